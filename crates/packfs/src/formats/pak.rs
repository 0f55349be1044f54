//! Dune 2 Pak archives.
//!
//! The header is a chain of (u32 offset, NUL-terminated name) pairs ending
//! with a zero offset. Each file runs up to the next file's offset, or to
//! the end of the archive for the last one.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{ReadBytesExt, LE};
use packfs_common::{stream_length, ReadExt, SegmentStream, SharedStream, Stream};
use parking_lot::Mutex;

use crate::{Error, Package, Result};

const FORMAT: &str = "pak";

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u32,
    length: u32,
}

/// A Pak archive.
pub struct PakFile {
    name: String,
    stream: SharedStream,
    index: HashMap<String, Entry>,
}

impl PakFile {
    /// Parse a Pak archive.
    pub fn new(mut stream: Stream, filename: &str) -> Result<Self> {
        let total = stream_length(&mut stream)?;
        stream.seek(SeekFrom::Start(0))?;

        let mut index = HashMap::new();
        let mut offset = stream.read_u32::<LE>()?;
        while offset != 0 {
            let file = stream.read_asciiz()?;
            let next = stream.read_u32::<LE>()?;
            let end = if next == 0 { total } else { next as u64 };

            let length = end.checked_sub(offset as u64).ok_or_else(|| Error::OutOfBounds {
                format: FORMAT,
                name: file.clone(),
                offset: offset as u64,
                length: 0,
                total: end,
            })?;
            if end > total {
                return Err(Error::OutOfBounds {
                    format: FORMAT,
                    name: file,
                    offset: offset as u64,
                    length,
                    total,
                });
            }

            match index.entry(file) {
                MapEntry::Vacant(slot) => {
                    slot.insert(Entry {
                        offset,
                        length: length as u32,
                    });
                }
                MapEntry::Occupied(slot) => {
                    tracing::debug!(filename, file = %slot.key(), "duplicate pak entry ignored");
                }
            }

            offset = next;
        }

        Ok(Self {
            name: filename.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            index,
        })
    }
}

impl Package for PakFile {
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
        let Some(entry) = self.index.get(filename) else {
            return Ok(None);
        };
        let segment =
            SegmentStream::new(self.stream.clone(), entry.offset as u64, entry.length as u64)?;
        Ok(Some(Box::new(segment)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn pak(files: &[(&str, &[u8])]) -> Vec<u8> {
        let header_len: usize = files.iter().map(|(n, _)| 4 + n.len() + 1).sum::<usize>() + 4;
        let mut header = Vec::new();
        let mut data = Vec::new();
        for (name, bytes) in files {
            header.extend_from_slice(&((header_len + data.len()) as u32).to_le_bytes());
            header.extend_from_slice(name.as_bytes());
            header.push(0);
            data.extend_from_slice(bytes);
        }
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend(data);
        header
    }

    fn read(pak: &PakFile, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        pak.get_stream(name)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_offset_chain() {
        let bytes = pak(&[("ICON.ICN", b"icons"), ("MOUSE.SHP", b"cursor!")]);
        let archive = PakFile::new(Box::new(Cursor::new(bytes)), "dune.pak").unwrap();

        assert_eq!(read(&archive, "ICON.ICN"), b"icons");
        assert_eq!(read(&archive, "MOUSE.SHP"), b"cursor!");
        assert!(!archive.contains("icon.icn"));
    }

    #[test]
    fn test_first_duplicate_wins() {
        let bytes = pak(&[("A.VOC", b"first"), ("A.VOC", b"second")]);
        let archive = PakFile::new(Box::new(Cursor::new(bytes)), "sound.pak").unwrap();

        assert_eq!(archive.contents(), ["A.VOC"]);
        assert_eq!(read(&archive, "A.VOC"), b"first");
    }

    #[test]
    fn test_empty_archive() {
        let archive = PakFile::new(Box::new(Cursor::new(vec![0u8; 4])), "empty.pak").unwrap();
        assert!(archive.contents().is_empty());
    }

    #[test]
    fn test_offset_past_next_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"A\0");
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(b"B\0");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.resize(120, 0);

        assert!(matches!(
            PakFile::new(Box::new(Cursor::new(bytes)), "bad.pak"),
            Err(Error::OutOfBounds { format: "pak", .. })
        ));
    }
}
