//! Ensemble Studios Drs archives (Age of Empires).
//!
//! A fixed header is followed by a list of tables, one per file extension.
//! Every table header is read before any table's entries. Files have numeric
//! IDs only and are exposed as `{id}.{extension}`.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use packfs_common::{stream_length, ReadExt, SegmentStream, SharedStream, Stream};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, Package, Result};

const FORMAT: &str = "drs";

/// Type tag every supported archive carries.
const TYPE_TAG: &[u8; 12] = b"tribe\0\0\0\0\0\0\0";

/// Fixed archive header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct DrsHeader {
    /// Copyright banner.
    pub copyright: [u8; 40],
    /// Version string, e.g. `1.00`.
    pub version: [u8; 4],
    /// Archive type tag.
    pub file_type: [u8; 12],
    /// Number of tables.
    pub table_count: u32,
    /// Offset of the first file's data.
    pub first_file_offset: u32,
}

/// Per-extension table descriptor.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct DrsTableHeader {
    /// Extension, stored reversed and space padded.
    pub extension: [u8; 4],
    /// Offset of the table's entries.
    pub offset: u32,
    /// Number of entries.
    pub count: u32,
}

impl DrsTableHeader {
    /// The extension in reading order.
    pub fn extension(&self) -> String {
        let mut ext = self.extension;
        ext.reverse();
        String::from_utf8_lossy(&ext)
            .trim_matches(|c| c == ' ' || c == '\0')
            .to_string()
    }
}

/// One file record.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct DrsEntry {
    /// Numeric file ID.
    pub id: u32,
    /// Absolute data offset.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
}

/// A Drs archive.
pub struct DrsFile {
    name: String,
    stream: SharedStream,
    index: HashMap<String, DrsEntry>,
}

impl DrsFile {
    /// Parse a Drs archive.
    pub fn new(mut stream: Stream, filename: &str) -> Result<Self> {
        let total = stream_length(&mut stream)?;
        stream.seek(SeekFrom::Start(0))?;

        let header: DrsHeader = stream.read_struct()?;
        if &header.file_type != TYPE_TAG {
            return Err(Error::InvalidMagic {
                format: FORMAT,
                expected: TYPE_TAG.to_vec(),
                actual: header.file_type.to_vec(),
            });
        }

        let tables = (0..header.table_count)
            .map(|_| stream.read_struct::<DrsTableHeader>())
            .collect::<std::io::Result<Vec<_>>>()?;

        let mut index = HashMap::new();
        for table in &tables {
            let extension = table.extension();
            stream.seek(SeekFrom::Start(table.offset as u64))?;

            for _ in 0..table.count {
                let entry: DrsEntry = stream.read_struct()?;
                let (id, offset, size) = (entry.id, entry.offset, entry.size);
                let file = format!("{id}.{extension}");

                if offset as u64 + size as u64 > total {
                    return Err(Error::OutOfBounds {
                        format: FORMAT,
                        name: file,
                        offset: offset as u64,
                        length: size as u64,
                        total,
                    });
                }
                index.insert(file, entry);
            }
        }

        tracing::trace!(filename, tables = tables.len(), files = index.len(), "parsed drs");

        Ok(Self {
            name: filename.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            index,
        })
    }
}

impl Package for DrsFile {
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
