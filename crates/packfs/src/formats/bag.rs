//! Red Alert 2 / Yuri's Revenge `audio.bag` archives.
//!
//! The sample data lives in the `.bag` file while a sibling `.idx` file holds
//! the index. Samples are stored headerless; [`BagFile::get_stream`] puts a
//! synthesized RIFF/WAVE header in front of each one so callers get a
//! playable `.wav`.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{ReadBytesExt, LE};
use packfs_common::{stream_length, MergedStream, ReadExt, SegmentStream, SharedStream, Stream};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, FileSystem, Package, Result};

const FORMAT: &str = "bag";

const IDX_MAGIC: &[u8; 4] = b"GABA";
const IDX_VERSION: u32 = 2;

/// Sample flags.
pub mod flags {
    /// Two channels instead of one.
    pub const STEREO: u32 = 0x1;
    /// 16-bit PCM.
    pub const PCM: u32 = 0x2;
    /// IMA ADPCM.
    pub const ADPCM: u32 = 0x8;
}

/// One record of the `.idx` file.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct IdxEntry {
    /// NUL-padded sample name, without extension.
    pub name: [u8; 16],
    /// Offset in the `.bag` file.
    pub offset: u32,
    /// Payload length.
    pub length: u32,
    /// Samples per second.
    pub sample_rate: u32,
    /// See [`flags`].
    pub flags: u32,
    /// ADPCM block size.
    pub chunk_size: u32,
}

impl IdxEntry {
    /// Logical filename, `{name}.wav`.
    pub fn filename(&self) -> String {
        let end = memchr_nul(&self.name);
        format!("{}.wav", String::from_utf8_lossy(&self.name[..end]))
    }

    fn channels(&self) -> u16 {
        if self.flags & flags::STEREO != 0 {
            2
        } else {
            1
        }
    }
}

fn memchr_nul(bytes: &[u8]) -> usize {
    packfs_common::memchr::memchr(0, bytes).unwrap_or(bytes.len())
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct PcmWaveHeader {
    riff: [u8; 4],
    riff_size: u32,
    wave: [u8; 4],
    fmt: [u8; 4],
    fmt_size: u32,
    format: u16,
    channels: u16,
    sample_rate: u32,
    byte_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    data: [u8; 4],
    data_size: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct AdpcmWaveHeader {
    riff: [u8; 4],
    riff_size: u32,
    wave: [u8; 4],
    fmt: [u8; 4],
    fmt_size: u32,
    format: u16,
    channels: u16,
    sample_rate: u32,
    byte_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    extra_size: u16,
    samples_per_block: u16,
    fact: [u8; 4],
    fact_size: u32,
    fact_samples: u32,
    data: [u8; 4],
    data_size: u32,
}

/// RIFF header bytes for a sample, empty when the sample is neither PCM nor
/// ADPCM.
///
/// Fails when the index fields do not fit the header.
pub fn wave_header(entry: &IdxEntry) -> Result<Vec<u8>> {
    let IdxEntry {
        length,
        sample_rate,
        flags: sample_flags,
        chunk_size,
        ..
    } = *entry;
    let channels = entry.channels();
    let name = entry.filename();
    let overflow = |field: &str| {
        Error::malformed(FORMAT, format!("sample '{name}': {field} does not fit a wave header"))
    };

    if sample_flags & flags::PCM != 0 {
        let header = PcmWaveHeader {
            riff: *b"RIFF",
            riff_size: length.checked_add(36).ok_or_else(|| overflow("length"))?,
            wave: *b"WAVE",
            fmt: *b"fmt ",
            fmt_size: 16,
            format: 1,
            channels,
            sample_rate,
            byte_rate: sample_rate
                .checked_mul(2 * channels as u32)
                .ok_or_else(|| overflow("sample rate"))?,
            block_align: 2 * channels,
            bits_per_sample: 16,
            data: *b"data",
            data_size: length,
        };
        return Ok(header.as_bytes().to_vec());
    }

    if sample_flags & flags::ADPCM != 0 {
        let samples_per_chunk = chunk_size
            .saturating_sub(4)
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| overflow("chunk size"))?;
        let block_align =
            u16::try_from(chunk_size.min(length)).map_err(|_| overflow("chunk size"))?;
        let byte_rate = ((2.0 * chunk_size as f64 / samples_per_chunk as f64)
            * (sample_rate as f64 / 2.0))
            .floor() as u32;

        let header = AdpcmWaveHeader {
            riff: *b"RIFF",
            riff_size: length.checked_add(52).ok_or_else(|| overflow("length"))?,
            wave: *b"WAVE",
            fmt: *b"fmt ",
            fmt_size: 20,
            format: 17,
            channels,
            sample_rate,
            byte_rate,
            block_align,
            bits_per_sample: 4,
            extra_size: 2,
            samples_per_block: samples_per_chunk,
            fact: *b"fact",
            fact_size: 4,
            fact_samples: length.checked_mul(4).ok_or_else(|| overflow("length"))?,
            data: *b"data",
            data_size: length,
        };
        return Ok(header.as_bytes().to_vec());
    }

    Ok(Vec::new())
}

/// Read the records of an `.idx` file.
pub fn read_idx<R: Read>(mut reader: R) -> Result<Vec<IdxEntry>> {
    let magic = reader.read_vec(4)?;
    if magic != IDX_MAGIC {
        return Err(Error::InvalidMagic {
            format: FORMAT,
            expected: IDX_MAGIC.to_vec(),
            actual: magic,
        });
    }

    let version = reader.read_u32::<LE>()?;
    if version != IDX_VERSION {
        return Err(Error::malformed(
            FORMAT,
            format!("unsupported idx version {version}"),
        ));
    }

    let count = reader.read_u32::<LE>()?;
    (0..count)
        .map(|_| reader.read_struct::<IdxEntry>().map_err(Error::from))
        .collect()
}

/// Name of the index belonging to a `.bag` file.
pub fn idx_name(bag_name: &str) -> String {
    match bag_name.rfind('.') {
        Some(dot) => format!("{}.idx", &bag_name[..dot]),
        None => format!("{bag_name}.idx"),
    }
}

/// An audio bag.
pub struct BagFile {
    name: String,
    stream: SharedStream,
    index: HashMap<String, IdxEntry>,
}

impl BagFile {
    /// Build a bag from its data stream and parsed index.
    pub fn new(mut stream: Stream, entries: Vec<IdxEntry>, filename: &str) -> Result<Self> {
        let total = stream_length(&mut stream)?;

        let mut index = HashMap::with_capacity(entries.len());
        for entry in entries {
            let file = entry.filename();
            let (offset, length) = (entry.offset as u64, entry.length as u64);
            if offset + length > total {
                return Err(Error::OutOfBounds {
                    format: FORMAT,
                    name: file,
                    offset,
                    length,
                    total,
                });
            }
            wave_header(&entry)?;
            if index.insert(file.clone(), entry).is_some() {
                return Err(Error::malformed(FORMAT, format!("duplicate sample '{file}'")));
            }
        }

        Ok(Self {
            name: filename.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            index,
        })
    }

    /// Open a bag, reading its index through `context`.
    pub fn open(stream: Stream, filename: &str, context: &FileSystem) -> Result<Self> {
        let idx = idx_name(filename);
        let index_stream = context
            .try_open(&idx)?
            .ok_or_else(|| Error::NotFound(idx.clone()))?;
        let entries = read_idx(index_stream)?;
        tracing::debug!(filename, idx = %idx, entries = entries.len(), "read bag index");
        Self::new(stream, entries, filename)
    }
}

impl Package for BagFile {
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

        let payload =
            SegmentStream::new(self.stream.clone(), entry.offset as u64, entry.length as u64)?;
        let header = Cursor::new(wave_header(entry)?);
        let parts: Vec<Stream> = vec![Box::new(header), Box::new(payload)];
        let merged = MergedStream::new(parts)?;
        Ok(Some(Box::new(merged)))
    }
}
