//! Westwood Mix archives.
//!
//! Three header layouts exist:
//!
//! - C&C: the file starts directly with the entry count.
//! - RA/TS/RA2 plain: a zero u16, a flags u16, then the same header at offset 4.
//! - RA/TS/RA2 encrypted (flag `0x2`): an 80-byte key block at offset 4
//!   followed by a Blowfish-encrypted header.
//!
//! Entries only carry a hash of their name; names are recovered from the
//! XCC databases (see [`crate::database`]).

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{ReadBytesExt, LE};
use packfs_common::{
    hash_filename, stream_length, BinaryReader, PackageHashType, ReadExt, SegmentStream,
    SharedStream, Stream,
};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::crypto::{HeaderCipher, BLOCK_SIZE, KEY_BLOCK_SIZE};
use crate::database::{read_local_database, LOCAL_DATABASE_NAME};
use crate::{Error, Package, Result};

const FORMAT: &str = "mix";

/// Flags bit marking an encrypted header.
const FLAG_ENCRYPTED: u16 = 0x2;

/// Entry count plus data size.
const HEADER_SIZE: u64 = 6;

/// One Mix index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct PackageEntry {
    /// Hash of the file name.
    pub hash: u32,
    /// Offset relative to the start of the data region.
    pub offset: u32,
    /// Length in bytes.
    pub length: u32,
}

impl PackageEntry {
    /// Size of a record on disk.
    pub const SIZE: u64 = std::mem::size_of::<PackageEntry>() as u64;
}

/// A Mix archive.
pub struct MixFile {
    name: String,
    stream: SharedStream,
    data_start: u64,
    index: HashMap<String, PackageEntry>,
    hash_type: PackageHashType,
    encrypted: bool,
}

impl MixFile {
    /// Parse a Mix archive, resolving names against `global_names` and any
    /// local database the archive carries.
    pub fn new(mut stream: Stream, filename: &str, global_names: &[String]) -> Result<Self> {
        let total = stream_length(&mut stream)?;
        stream.seek(SeekFrom::Start(0))?;

        let is_cnc = stream.read_u16::<LE>()? != 0;
        let encrypted = !is_cnc && stream.read_u16::<LE>()? & FLAG_ENCRYPTED != 0;

        let (entries, data_start) = if encrypted {
            read_encrypted_header(&mut stream)?
        } else {
            read_plain_header(&mut stream, if is_cnc { 0 } else { 4 })?
        };

        tracing::trace!(
            filename,
            cnc = is_cnc,
            encrypted,
            data_start,
            entries = entries.len(),
            "parsed mix header"
        );

        let data_len = total.saturating_sub(data_start);
        let mut by_hash = HashMap::with_capacity(entries.len());
        for entry in entries {
            let (hash, offset, length) = (entry.hash, entry.offset, entry.length);
            if offset as u64 + length as u64 > data_len {
                return Err(Error::OutOfBounds {
                    format: FORMAT,
                    name: format!("{hash:08X}"),
                    offset: offset as u64,
                    length: length as u64,
                    total: data_len,
                });
            }

            if let Some(previous) = by_hash.insert(hash, entry) {
                let (prev_offset, prev_length) = (previous.offset, previous.length);
                tracing::warn!(
                    filename,
                    hash = %format!("{hash:08X}"),
                    "duplicate hash: (offs={}, len={}) replaced by (offs={}, len={})",
                    prev_offset,
                    prev_length,
                    offset,
                    length
                );
            }
        }

        let stream: SharedStream = Arc::new(Mutex::new(stream));
        let mut mix = Self {
            name: filename.to_string(),
            stream,
            data_start,
            index: HashMap::new(),
            hash_type: PackageHashType::Classic,
            encrypted,
        };
        mix.resolve_names(&by_hash, global_names)?;
        Ok(mix)
    }

    fn resolve_names(
        &mut self,
        entries: &HashMap<u32, PackageEntry>,
        global_names: &[String],
    ) -> Result<()> {
        let mut candidates: Vec<String> = global_names.to_vec();

        let local = PackageHashType::ALL
            .iter()
            .find_map(|&t| entries.get(&hash_filename(LOCAL_DATABASE_NAME, t)));
        if let Some(entry) = local {
            let names = read_local_database(self.entry_stream(entry)?)?;
            tracing::debug!(filename = %self.name, names = names.len(), "found local mix database");
            candidates.extend(names);
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut classic = HashMap::new();
        let mut crc = HashMap::new();
        for name in candidates {
            if let Some(entry) = entries.get(&hash_filename(&name, PackageHashType::Classic)) {
                classic.insert(name.clone(), *entry);
            }
            if let Some(entry) = entries.get(&hash_filename(&name, PackageHashType::Crc32)) {
                crc.insert(name, *entry);
            }
        }

        (self.index, self.hash_type) = if crc.len() > classic.len() {
            (crc, PackageHashType::Crc32)
        } else {
            (classic, PackageHashType::Classic)
        };

        let unknown = entries.len().saturating_sub(self.index.len());
        if unknown > 0 {
            tracing::debug!(
                filename = %self.name,
                unknown,
                "failed to resolve filenames for unknown hashes"
            );
        }
        Ok(())
    }

    fn entry_stream(&self, entry: &PackageEntry) -> Result<SegmentStream> {
        Ok(SegmentStream::new(
            self.stream.clone(),
            self.data_start + entry.offset as u64,
            entry.length as u64,
        )?)
    }

    /// Resolved entries with offsets relative to the start of the file.
    pub fn index(&self) -> HashMap<String, PackageEntry> {
        self.index
            .iter()
            .map(|(name, e)| {
                let absolute = PackageEntry {
                    hash: e.hash,
                    offset: (e.offset as u64 + self.data_start) as u32,
                    length: e.length,
                };
                (name.clone(), absolute)
            })
            .collect()
    }

    /// Which hash algorithm resolved the names.
    pub fn hash_type(&self) -> PackageHashType {
        self.hash_type
    }

    /// Whether the header was Blowfish encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Offset of the first payload byte.
    pub fn data_start(&self) -> u64 {
        self.data_start
    }
}

fn parse_entries(header: &[u8]) -> Result<Vec<PackageEntry>> {
    let mut reader = BinaryReader::new(header);
    let count = reader.read_u16()?;
    let _data_size = reader.read_u32()?;

    (0..count)
        .map(|_| reader.read_struct::<PackageEntry>().map_err(Error::from))
        .collect()
}

fn read_plain_header(stream: &mut Stream, offset: u64) -> Result<(Vec<PackageEntry>, u64)> {
    stream.seek(SeekFrom::Start(offset))?;
    let count = stream.read_u16::<LE>()?;

    stream.seek(SeekFrom::Start(offset))?;
    let header_len = HEADER_SIZE + count as u64 * PackageEntry::SIZE;
    let header = stream.read_vec(header_len as usize)?;

    Ok((parse_entries(&header)?, offset + header_len))
}

fn read_encrypted_header(stream: &mut Stream) -> Result<(Vec<PackageEntry>, u64)> {
    let key_offset = 4u64;
    let header_offset = key_offset + KEY_BLOCK_SIZE as u64;

    stream.seek(SeekFrom::Start(key_offset))?;
    let key_block = stream.read_vec(KEY_BLOCK_SIZE)?;
    let cipher = HeaderCipher::from_key_block(&key_block)?;

    let mut first = [0u8; BLOCK_SIZE];
    stream.read_exact(&mut first)?;
    cipher.decrypt(&mut first);
    let count = u16::from_le_bytes([first[0], first[1]]) as u64;

    // Round the header up to whole blocks.
    let block_count = (13 + count * PackageEntry::SIZE) / BLOCK_SIZE as u64;
    let header_len = block_count * BLOCK_SIZE as u64;

    stream.seek(SeekFrom::Start(header_offset))?;
    let mut header = stream.read_vec(header_len as usize).map_err(|_| {
        Error::malformed(
            FORMAT,
            format!("encrypted header of {block_count} blocks is truncated"),
        )
    })?;
    cipher.decrypt(&mut header);

    Ok((parse_entries(&header)?, header_offset + header_len))
}

impl Package for MixFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn contents(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn contains(&self, filename: &str) -> bool {
        self.index.contains_key(filename)
    }

    fn get_stream(&self, filename: &str) -> Result<Option<Stream>> {
        match self.index.get(filename) {
            Some(entry) => Ok(Some(Box::new(self.entry_stream(entry)?))),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for MixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixFile")
            .field("name", &self.name)
            .field("data_start", &self.data_start)
            .field("entries", &self.index.len())
            .field("hash_type", &self.hash_type)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::decrypt_key;
    use blowfish::Blowfish;
    use cipher::generic_array::GenericArray;
    use cipher::{BlockEncrypt, KeyInit};
    use std::io::Cursor;

    fn local_database(names: &[&str]) -> Vec<u8> {
        let mut db = vec![0u8; 48];
        db.extend_from_slice(&(names.len() as i32).to_le_bytes());
        for name in names {
            db.extend_from_slice(name.as_bytes());
            db.push(0);
        }
        db
    }

    /// Header bytes (count, size, entries) and payload for `files`.
    fn layout(files: &[(&str, &[u8])], hash_type: PackageHashType) -> (Vec<u8>, Vec<u8>) {
        let mut header = Vec::new();
        let mut data = Vec::new();
        header.extend_from_slice(&(files.len() as u16).to_le_bytes());
        let total: usize = files.iter().map(|(_, b)| b.len()).sum();
        header.extend_from_slice(&(total as u32).to_le_bytes());

        for (name, bytes) in files {
            let entry = PackageEntry {
                hash: hash_filename(name, hash_type),
                offset: data.len() as u32,
                length: bytes.len() as u32,
            };
            header.extend_from_slice(entry.as_bytes());
            data.extend_from_slice(bytes);
        }
        (header, data)
    }

    fn plain_mix(files: &[(&str, &[u8])], hash_type: PackageHashType) -> Vec<u8> {
        let (header, data) = layout(files, hash_type);
        let mut out = vec![0, 0, 0, 0];
        out.extend(header);
        out.extend(data);
        out
    }

    fn read(mix: &MixFile, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        mix.get_stream(name)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_plain_mix_with_local_database() {
        let db = local_database(&["rules.ini", "art.ini"]);
        let bytes = plain_mix(
            &[
                ("rules.ini", b"[General]"),
                ("art.ini", b"[Movies]\n"),
                (LOCAL_DATABASE_NAME, &db),
            ],
            PackageHashType::Classic,
        );

        let mix = MixFile::new(Box::new(Cursor::new(bytes)), "test.mix", &[]).unwrap();
        assert_eq!(mix.hash_type(), PackageHashType::Classic);
        assert!(!mix.is_encrypted());

        let mut contents = mix.contents();
        contents.sort();
        assert_eq!(contents, ["art.ini", "rules.ini"]);
        assert_eq!(read(&mix, "rules.ini"), b"[General]");
        assert_eq!(read(&mix, "art.ini"), b"[Movies]\n");
        assert!(mix.get_stream("missing.ini").unwrap().is_none());
    }

    #[test]
    fn test_cnc_mix_with_global_names() {
        let (header, data) = layout(
            &[("conquer.eng", b"strings"), ("unnamed", b"??")],
            PackageHashType::Classic,
        );
        let mut bytes = header;
        bytes.extend(data);

        let global = vec!["conquer.eng".to_string(), "other.shp".to_string()];
        let mix = MixFile::new(Box::new(Cursor::new(bytes)), "local.mix", &global).unwrap();

        assert_eq!(mix.data_start(), 6 + 2 * PackageEntry::SIZE);
        assert_eq!(mix.contents(), ["conquer.eng"]);
        assert_eq!(read(&mix, "conquer.eng"), b"strings");

        let index = mix.index();
        assert_eq!({ index["conquer.eng"].offset }, mix.data_start() as u32);
    }

    #[test]
    fn test_crc_names_win_when_more_resolve() {
        let db = local_database(&["a.shp", "b.shp"]);
        let bytes = plain_mix(
            &[("a.shp", b"A"), ("b.shp", b"B"), (LOCAL_DATABASE_NAME, &db)],
            PackageHashType::Crc32,
        );

        let mix = MixFile::new(Box::new(Cursor::new(bytes)), "ts.mix", &[]).unwrap();
        assert_eq!(mix.hash_type(), PackageHashType::Crc32);
        assert_eq!(read(&mix, "b.shp"), b"B");
    }

    #[test]
    fn test_entry_past_end_rejected() {
        let mut bytes = plain_mix(&[("rules.ini", b"0123456789")], PackageHashType::Classic);
        bytes.truncate(bytes.len() - 3);

        assert!(matches!(
            MixFile::new(Box::new(Cursor::new(bytes)), "bad.mix", &[]),
            Err(Error::OutOfBounds { format: "mix", .. })
        ));
    }

    #[test]
    fn test_encrypted_header() {
        let key_block: Vec<u8> = (0u8..80).map(|b| b.wrapping_mul(7)).collect();
        let key = decrypt_key(&key_block).unwrap();
        let fish = Blowfish::<LE>::new_from_slice(&key).unwrap();

        let db = local_database(&["rules.ini"]);
        let (mut header, data) = layout(
            &[("rules.ini", b"encrypted!"), (LOCAL_DATABASE_NAME, &db)],
            PackageHashType::Classic,
        );
        let block_count = (13 + 2 * PackageEntry::SIZE as usize) / BLOCK_SIZE;
        header.resize(block_count * BLOCK_SIZE, 0);
        for block in header.chunks_exact_mut(BLOCK_SIZE) {
            fish.encrypt_block(GenericArray::from_mut_slice(block));
        }

        let mut bytes = vec![0, 0];
        bytes.extend_from_slice(&FLAG_ENCRYPTED.to_le_bytes());
        bytes.extend(key_block);
        bytes.extend(header);
        bytes.extend(data);

        let mix = MixFile::new(Box::new(Cursor::new(bytes)), "enc.mix", &[]).unwrap();
        assert!(mix.is_encrypted());
        assert_eq!(mix.data_start(), 84 + (block_count * BLOCK_SIZE) as u64);
        assert_eq!(read(&mix, "rules.ini"), b"encrypted!");
    }

    #[test]
    fn test_duplicate_hash_last_wins() {
        let mut bytes = vec![0, 0, 0, 0];
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        let hash = hash_filename("x.ini", PackageHashType::Classic);
        for offset in [0u32, 1] {
            let entry = PackageEntry {
                hash,
                offset,
                length: 1,
            };
            bytes.extend_from_slice(entry.as_bytes());
        }
        bytes.extend_from_slice(b"12");

        let global = vec!["x.ini".to_string()];
        let mix = MixFile::new(Box::new(Cursor::new(bytes)), "dup.mix", &global).unwrap();
        assert_eq!(read(&mix, "x.ini"), b"2");
    }
}
