//! InstallShield multi-volume cabinets.
//!
//! An installer ships a control file (`data1.hdr`) describing every file,
//! plus one or more data volumes (`data1.cab`, `data2.cab`, ...). Files are
//! addressed as `group\directory\file`. Payloads are stored raw or as a
//! sequence of u16-length-prefixed raw DEFLATE chunks, and a file may be
//! split across consecutive volumes.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{ReadBytesExt, LE};
use flate2::read::DeflateDecoder;
use packfs_common::{BinaryReader, ReadExt, Stream};
use parking_lot::Mutex;
use regex::Regex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, FileSystem, Package, Result};

const FORMAT: &str = "installshield";

/// `ISc(`
pub const SIGNATURE: u32 = 0x2863_5349;

const MAX_FILE_GROUP_COUNT: usize = 71;

/// Offset of the file group table inside the cab descriptor.
const FILE_GROUP_TABLE: usize = 62;

/// Size of a version 6+ file descriptor.
const FILE_DESCRIPTOR_SIZE: usize = 0x57;

/// Offset of the [`VolumeHeader`] in every `.cab` volume.
const VOLUME_HEADER_OFFSET: u64 = 20;

/// Upper bound on buffer space reserved from header sizes before any data
/// has been read.
const MAX_PREALLOCATION: usize = 1 << 20;

/// File descriptor flags.
pub mod file_flags {
    /// The payload continues in the next volume.
    pub const SPLIT: u16 = 0x1;
    /// Obfuscated payload.
    pub const OBFUSCATED: u16 = 0x2;
    /// DEFLATE-compressed payload.
    pub const COMPRESSED: u16 = 0x4;
    /// The descriptor is unusable.
    pub const INVALID: u16 = 0x8;
}

/// Link flag: this descriptor shares the payload of an earlier one.
pub const LINK_PREV: u8 = 0x1;

/// Header shared by the `.hdr` file and every volume.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct CommonHeader {
    pub signature: u32,
    pub version: u32,
    pub volume_info: u32,
    pub cab_descriptor_offset: u32,
    pub cab_descriptor_size: u32,
}

/// Where a volume's first and last (possibly split) files lie.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct VolumeHeader {
    pub data_offset: u32,
    pub data_offset_high: u32,
    pub first_file_index: u32,
    pub last_file_index: u32,
    pub first_file_offset: u32,
    pub first_file_offset_high: u32,
    pub first_file_size_expanded: u32,
    pub first_file_size_expanded_high: u32,
    pub first_file_size_compressed: u32,
    pub first_file_size_compressed_high: u32,
    pub last_file_offset: u32,
    pub last_file_offset_high: u32,
    pub last_file_size_expanded: u32,
    pub last_file_size_expanded_high: u32,
    pub last_file_size_compressed: u32,
    pub last_file_size_compressed_high: u32,
}

/// Version 6+ file descriptor, stored in a fixed-stride table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct FileDescriptorV6 {
    pub flags: u16,
    pub expanded_size: u32,
    pub _unknown1: u32,
    pub compressed_size: u32,
    pub _unknown2: u32,
    pub data_offset: u32,
    pub _unknown3: u32,
    pub md5: [u8; 16],
    pub _unknown4: [u8; 16],
    pub name_offset: u32,
    pub directory_index: u16,
    pub _unknown5: [u8; 12],
    pub link_previous: u32,
    pub link_next: u32,
    pub link_flags: u8,
    pub volume: u16,
}

/// Version 5 and older file descriptor, reached through an offset table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct FileDescriptorV5 {
    pub name_offset: u32,
    pub directory_index: u32,
    pub flags: u16,
    pub expanded_size: u32,
    pub compressed_size: u32,
    pub _unknown: [u8; 20],
    pub data_offset: u32,
}

/// A parsed file descriptor.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub directory_index: u32,
    pub flags: u16,
    pub expanded_size: u32,
    pub compressed_size: u32,
    pub data_offset: u32,
    pub link_previous: u32,
    pub link_flags: u8,
    pub volume: u16,
}

impl FileDescriptor {
    fn is(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Bytes the payload occupies in the volumes.
    fn stored_size(&self) -> u32 {
        if self.is(file_flags::COMPRESSED) {
            self.compressed_size
        } else {
            self.expanded_size
        }
    }
}

/// Major version of the cabinet format.
pub fn major_version(version: u32) -> Option<u32> {
    match version >> 24 {
        1 => Some((version >> 12) & 0xf),
        2 | 4 => Some((version & 0xffff) / 100),
        _ => None,
    }
}

/// `data1.hdr` -> `data`: the prefix volume names are built from.
pub fn common_name(hdr_name: &str) -> Result<String> {
    let suffix = Regex::new(r"\d*\.[^.]*$").map_err(|e| Error::malformed(FORMAT, e.to_string()))?;
    Ok(suffix.replace(hdr_name, "").into_owned())
}

/// An InstallShield cabinet set.
pub struct InstallShieldCab {
    name: String,
    major_version: u32,
    files: HashMap<u32, FileDescriptor>,
    index: HashMap<String, u32>,
    volumes: BTreeMap<u16, Mutex<Stream>>,
}

impl InstallShieldCab {
    /// Parse `hdr` and open its volumes through `context`.
    pub fn open(hdr: Stream, filename: &str, context: &FileSystem) -> Result<Self> {
        let mut cab = Self::parse(hdr, filename)?;
        let common = common_name(filename)?;

        let last_needed = cab.files.values().map(|f| f.volume).max().unwrap_or(1).max(1);
        let mut volume = 1u16;
        loop {
            let volume_name = format!("{common}{volume}.cab");
            match context.try_open(&volume_name)? {
                Some(stream) => {
                    tracing::debug!(volume = %volume_name, "opened cabinet volume");
                    cab.volumes.insert(volume, Mutex::new(stream));
                }
                None if volume <= last_needed => {
                    tracing::debug!(volume = %volume_name, "cabinet volume missing");
                }
                None => break,
            }
            volume = match volume.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(cab)
    }

    /// Build a cabinet from an already-opened set of volumes.
    pub fn with_volumes(
        hdr: Stream,
        filename: &str,
        volumes: impl IntoIterator<Item = (u16, Stream)>,
    ) -> Result<Self> {
        let mut cab = Self::parse(hdr, filename)?;
        cab.volumes = volumes
            .into_iter()
            .map(|(n, s)| (n, Mutex::new(s)))
            .collect();
        Ok(cab)
    }

    fn parse(mut hdr: Stream, filename: &str) -> Result<Self> {
        hdr.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        hdr.read_to_end(&mut data)?;
        let mut reader = BinaryReader::new(&data);

        let common: CommonHeader = reader.read_struct()?;
        let signature = common.signature;
        if signature != SIGNATURE {
            return Err(Error::InvalidMagic {
                format: FORMAT,
                expected: SIGNATURE.to_le_bytes().to_vec(),
                actual: signature.to_le_bytes().to_vec(),
            });
        }

        let version = common.version;
        let major_version = major_version(version).ok_or_else(|| {
            Error::malformed(FORMAT, format!("unknown version {version:#010x}"))
        })?;

        let base = common.cab_descriptor_offset as usize;
        reader.seek(base + 12)?;
        let file_table_offset = reader.read_u32()? as usize;
        reader.advance(4)?;
        let _file_table_size = reader.read_u32()?;
        let _file_table_size2 = reader.read_u32()?;
        let directory_count = reader.read_u32()? as usize;
        reader.advance(8)?;
        let file_count = reader.read_u32()?;
        let file_table_offset2 = reader.read_u32()? as usize;

        reader.seek(base + FILE_GROUP_TABLE)?;
        let group_offsets = (0..MAX_FILE_GROUP_COUNT)
            .map(|_| reader.read_u32())
            .collect::<packfs_common::Result<Vec<_>>>()?;

        let table = base + file_table_offset;
        reader.seek(table)?;
        let file_table = (0..directory_count)
            .map(|_| reader.read_u32())
            .collect::<packfs_common::Result<Vec<_>>>()?;
        let directory_names = file_table
            .iter()
            .map(|&offset| reader.cstring_at(table + offset as usize))
            .collect::<packfs_common::Result<Vec<_>>>()?;

        let mut groups = Vec::new();
        for offset in group_offsets {
            let mut next = offset;
            let mut hops = 0;
            while next != 0 {
                reader.seek(base + next as usize + 4)?;
                let descriptor = reader.read_u32()? as usize;
                next = reader.read_u32()?;

                reader.seek(base + descriptor)?;
                let name_offset = reader.read_u32()? as usize;
                reader.advance(if major_version <= 5 { 0x48 } else { 0x12 })?;
                let first_file = reader.read_u32()?;
                let last_file = reader.read_u32()?;
                let name = reader.cstring_at(base + name_offset)?;
                tracing::trace!(group = %name, first_file, last_file, "file group");
                groups.push((name, first_file, last_file));

                hops += 1;
                if hops > MAX_FILE_GROUP_COUNT * 64 {
                    return Err(Error::malformed(FORMAT, "file group chain does not terminate"));
                }
            }
        }

        let mut cab = Self {
            name: filename.to_string(),
            major_version,
            files: HashMap::new(),
            index: HashMap::new(),
            volumes: BTreeMap::new(),
        };

        let layout = TableLayout {
            table,
            file_table_offset2,
            directory_count,
        };
        for (group, first, last) in &groups {
            if first <= last && *last >= file_count {
                return Err(Error::malformed(
                    FORMAT,
                    format!("group {group} ends at file {last} of {file_count}"),
                ));
            }
            for i in *first..=*last {
                let descriptor = cab.read_descriptor(&reader, &layout, i)?;
                let directory = directory_names
                    .get(descriptor.directory_index as usize)
                    .ok_or_else(|| {
                        Error::malformed(
                            FORMAT,
                            format!("directory index {} out of range", descriptor.directory_index),
                        )
                    })?;

                let path = format!("{group}\\{directory}\\{}", descriptor.name);
                cab.index.insert(path, i);
                cab.files.insert(i, descriptor);
            }
        }

        tracing::debug!(
            filename,
            version = major_version,
            groups = groups.len(),
            files = cab.index.len(),
            "parsed installshield header"
        );
        Ok(cab)
    }

    fn read_descriptor(
        &self,
        reader: &BinaryReader<'_>,
        layout: &TableLayout,
        index: u32,
    ) -> Result<FileDescriptor> {
        let mut reader = reader.clone();
        let table = layout.table;

        if self.major_version <= 5 {
            reader.seek(table + (layout.directory_count + index as usize) * 4)?;
            let offset = reader.read_u32()? as usize;
            reader.seek(table + offset)?;
            let raw: FileDescriptorV5 = reader.read_struct()?;
            return Ok(FileDescriptor {
                name: reader.cstring_at(table + raw.name_offset as usize)?,
                directory_index: raw.directory_index,
                flags: raw.flags,
                expanded_size: raw.expanded_size,
                compressed_size: raw.compressed_size,
                data_offset: raw.data_offset,
                link_previous: 0,
                link_flags: 0,
                volume: 1,
            });
        }

        reader.seek(table + layout.file_table_offset2 + index as usize * FILE_DESCRIPTOR_SIZE)?;
        let raw: FileDescriptorV6 = reader.read_struct()?;
        Ok(FileDescriptor {
            name: reader.cstring_at(table + raw.name_offset as usize)?,
            directory_index: raw.directory_index as u32,
            flags: raw.flags,
            expanded_size: raw.expanded_size,
            compressed_size: raw.compressed_size,
            data_offset: raw.data_offset,
            link_previous: raw.link_previous,
            link_flags: raw.link_flags,
            volume: raw.volume,
        })
    }

    /// Major format version of the header.
    pub fn major_version(&self) -> u32 {
        self.major_version
    }

    /// Descriptor of a logical file.
    pub fn descriptor(&self, filename: &str) -> Option<&FileDescriptor> {
        self.index.get(filename).and_then(|i| self.files.get(i))
    }

    /// Extract a file by descriptor index.
    pub fn extract(&self, index: u32) -> Result<Vec<u8>> {
        let mut index = index;
        let mut hops = 0;
        let descriptor = loop {
            let descriptor = self
                .files
                .get(&index)
                .ok_or_else(|| Error::malformed(FORMAT, format!("no file descriptor {index}")))?;

            if descriptor.is(file_flags::INVALID) {
                return Err(Error::malformed(
                    FORMAT,
                    format!("file {} is marked invalid", descriptor.name),
                ));
            }
            if descriptor.link_flags & LINK_PREV != 0 {
                hops += 1;
                if hops > self.files.len() {
                    return Err(Error::malformed(FORMAT, "file links form a cycle"));
                }
                index = descriptor.link_previous;
                continue;
            }
            if descriptor.is(file_flags::OBFUSCATED) {
                return Err(Error::malformed(
                    FORMAT,
                    format!("file {} is obfuscated", descriptor.name),
                ));
            }
            break descriptor;
        };

        let mut reader = VolumeReader::new(self, descriptor, index)?;
        let capacity = (descriptor.expanded_size as usize).min(MAX_PREALLOCATION);
        let mut output = Vec::with_capacity(capacity);

        if descriptor.is(file_flags::COMPRESSED) {
            let mut remaining = descriptor.compressed_size as u64;
            while remaining > 0 {
                let length = Cursor::new(reader.take(2)?).read_u16::<LE>()? as u64;
                let chunk = reader.take(length)?;
                remaining = remaining.checked_sub(2 + length).ok_or_else(|| {
                    Error::malformed(FORMAT, format!("chunks of {} overrun", descriptor.name))
                })?;

                DeflateDecoder::new(&chunk[..])
                    .read_to_end(&mut output)
                    .map_err(|e| Error::Decompression(format!("{}: {e}", descriptor.name)))?;
            }
        } else {
            output = reader.take(descriptor.expanded_size as u64)?;
        }

        if output.len() as u64 != descriptor.expanded_size as u64 {
            return Err(Error::malformed(
                FORMAT,
                format!(
                    "did not fully extract {}: expected {}, got {}",
                    descriptor.name,
                    descriptor.expanded_size,
                    output.len()
                ),
            ));
        }

        Ok(output)
    }
}

struct TableLayout {
    table: usize,
    file_table_offset2: usize,
    directory_count: usize,
}

/// Sequential reader over a file's payload, following it across volumes.
struct VolumeReader<'a> {
    cab: &'a InstallShieldCab,
    descriptor: &'a FileDescriptor,
    index: u32,
    volume: u16,
    position: u64,
    remaining: u64,
}

impl<'a> VolumeReader<'a> {
    fn new(cab: &'a InstallShieldCab, descriptor: &'a FileDescriptor, index: u32) -> Result<Self> {
        let mut reader = Self {
            cab,
            descriptor,
            index,
            volume: descriptor.volume.max(1),
            position: 0,
            remaining: 0,
        };
        reader.set_volume(reader.volume)?;
        Ok(reader)
    }

    fn set_volume(&mut self, volume: u16) -> Result<()> {
        let stream = self
            .cab
            .volumes
            .get(&volume)
            .ok_or(Error::VolumeUnavailable(volume))?;
        let mut stream = stream.lock();

        stream.seek(SeekFrom::Start(0))?;
        let signature = stream.read_u32::<LE>()?;
        if signature != SIGNATURE {
            return Err(Error::InvalidMagic {
                format: FORMAT,
                expected: SIGNATURE.to_le_bytes().to_vec(),
                actual: signature.to_le_bytes().to_vec(),
            });
        }

        let descriptor = self.descriptor;
        let compressed = descriptor.is(file_flags::COMPRESSED);
        let (offset, size) = if descriptor.is(file_flags::SPLIT) {
            stream.seek(SeekFrom::Start(VOLUME_HEADER_OFFSET))?;
            let head: VolumeHeader = stream.read_struct()?;
            if self.index == head.last_file_index {
                let size = if compressed {
                    head.last_file_size_compressed
                } else {
                    head.last_file_size_expanded
                };
                (head.last_file_offset, size)
            } else if self.index == head.first_file_index {
                let size = if compressed {
                    head.first_file_size_compressed
                } else {
                    head.first_file_size_expanded
                };
                (head.first_file_offset, size)
            } else {
                return Err(Error::malformed(
                    FORMAT,
                    format!("volume {volume} does not hold file {}", self.index),
                ));
            }
        } else {
            (descriptor.data_offset, descriptor.stored_size())
        };

        tracing::trace!(volume, offset, size, file = %descriptor.name, "reading from volume");
        self.volume = volume;
        self.position = offset as u64;
        self.remaining = size as u64;
        Ok(())
    }

    /// Read the next `count` payload bytes, moving to the next volume as needed.
    fn take(&mut self, count: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((count as usize).min(MAX_PREALLOCATION));
        while (out.len() as u64) < count {
            if self.remaining == 0 {
                let next = self.volume.checked_add(1).ok_or_else(|| {
                    Error::malformed(FORMAT, "ran out of volumes")
                })?;
                self.set_volume(next)?;
                if self.remaining == 0 {
                    return Err(Error::malformed(
                        FORMAT,
                        format!("volume {next} holds no data for file {}", self.index),
                    ));
                }
            }

            let wanted = (count - out.len() as u64).min(self.remaining);
            let Some(stream) = self.cab.volumes.get(&self.volume) else {
                return Err(Error::VolumeUnavailable(self.volume));
            };
            let mut stream = stream.lock();
            stream.seek(SeekFrom::Start(self.position))?;
            let read = stream.by_ref().take(wanted).read_to_end(&mut out)?;
            if (read as u64) < wanted {
                return Err(Error::OutOfBounds {
                    format: FORMAT,
                    name: format!("file {}", self.index),
                    offset: self.position,
                    length: wanted,
                    total: self.position + read as u64,
                });
            }

            self.position += wanted;
            self.remaining -= wanted;
        }
        Ok(out)
    }
}

impl Package for InstallShieldCab {
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
        let Some(&index) = self.index.get(filename) else {
            return Ok(None);
        };
        Ok(Some(Box::new(Cursor::new(self.extract(index)?))))
    }
}
