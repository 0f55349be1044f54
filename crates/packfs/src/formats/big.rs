//! EA Big archives.
//!
//! The only big-endian format: a `BIGF` (or `BIG4`) magic, the archive size,
//! the entry count and the first entry offset, followed by entries of
//! (offset, size, NUL-terminated path).

use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{ReadBytesExt, BE, LE};
use packfs_common::{stream_length, ReadExt, SegmentStream, SharedStream, Stream};
use parking_lot::Mutex;

use crate::{Error, Package, Result};

const FORMAT: &str = "big";

/// Accepted magics.
pub const MAGICS: [&[u8; 4]; 2] = [b"BIGF", b"BIG4"];

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u32,
    size: u32,
}

/// A Big archive.
pub struct BigFile {
    name: String,
    stream: SharedStream,
    index: HashMap<String, Entry>,
}

impl BigFile {
    /// Parse a Big archive.
    pub fn new(mut stream: Stream, filename: &str) -> Result<Self> {
        let total = stream_length(&mut stream)?;
        stream.seek(SeekFrom::Start(0))?;

        let magic = stream.read_vec(4)?;
        if !MAGICS.iter().any(|m| m[..] == magic[..]) {
            return Err(Error::InvalidMagic {
                format: FORMAT,
                expected: b"BIGF".to_vec(),
                actual: magic,
            });
        }

        // Archive size, unused.
        let _size = stream.read_u32::<LE>()?;
        let count = stream.read_u32::<BE>()?;
        let _first_entry = stream.read_u32::<BE>()?;

        let mut index = HashMap::with_capacity(count.min(0x1_0000) as usize);
        for _ in 0..count {
            let offset = stream.read_u32::<BE>()?;
            let size = stream.read_u32::<BE>()?;
            let path = stream.read_asciiz()?;

            if offset as u64 + size as u64 > total {
                return Err(Error::OutOfBounds {
                    format: FORMAT,
                    name: path,
                    offset: offset as u64,
                    length: size as u64,
                    total,
                });
            }

            tracing::trace!(path = %path, offset, size, "big entry");
            if index.insert(path.clone(), Entry { offset, size }).is_some() {
                return Err(Error::malformed(FORMAT, format!("duplicate entry '{path}'")));
            }
        }

        Ok(Self {
            name: filename.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            index,
        })
    }

    /// Offset and size of `filename`, as stored.
    pub fn entry(&self, filename: &str) -> Option<(u32, u32)> {
        self.index.get(filename).map(|e| (e.offset, e.size))
    }
}

impl Package for BigFile {
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
            SegmentStream::new(self.stream.clone(), entry.offset as u64, entry.size as u64)?;
        Ok(Some(Box::new(segment)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn big(magic: &[u8; 4], files: &[(&str, &[u8])]) -> Vec<u8> {
        let table_len: usize = files.iter().map(|(n, _)| 8 + n.len() + 1).sum();
        let mut offset = 16 + table_len;

        let mut out = magic.to_vec();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(files.len() as u32).to_be_bytes());
        out.extend_from_slice(&16u32.to_be_bytes());
        for (name, bytes) in files {
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            offset += bytes.len();
        }
        for (_, bytes) in files {
            out.extend_from_slice(bytes);
        }
        out
    }

    #[test]
    fn test_big_endian_fields() {
        let bytes = big(b"BIGF", &[("data\\ini\\object.ini", b"Object")]);
        let archive = BigFile::new(Box::new(Cursor::new(bytes)), "ini.big").unwrap();

        // 16-byte header plus 8 + 19 + 1 bytes of entry.
        assert_eq!(archive.entry("data\\ini\\object.ini"), Some((44, 6)));

        let mut out = String::new();
        archive
            .get_stream("data\\ini\\object.ini")
            .unwrap()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "Object");
    }

    #[test]
    fn test_big4_magic() {
        let bytes = big(b"BIG4", &[("a", b"1"), ("b", b"22")]);
        let archive = BigFile::new(Box::new(Cursor::new(bytes)), "x.big").unwrap();
        let mut contents = archive.contents();
        contents.sort();
        assert_eq!(contents, ["a", "b"]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = big(b"BIGF", &[]);
        bytes[3] = b'X';
        assert!(matches!(
            BigFile::new(Box::new(Cursor::new(bytes)), "x.big"),
            Err(Error::InvalidMagic { format: "big", .. })
        ));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let bytes = big(b"BIGF", &[("a", b"1"), ("a", b"2")]);
        assert!(matches!(
            BigFile::new(Box::new(Cursor::new(bytes)), "x.big"),
            Err(Error::Malformed { format: "big", .. })
        ));
    }
}
