//! Byte-stream abstraction shared by every package.
//!
//! A package owns its byte source as a [`SharedStream`]; the streams it hands
//! out are [`SegmentStream`] windows into that source, so opening a file
//! never copies the payload. [`MergedStream`] stitches several streams into
//! one, which the Bag reader uses to put a synthesized WAVE header in front
//! of raw sample data.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Error, Result};

/// Anything that can back a package or be returned from one.
pub trait SeekableStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekableStream for T {}

/// An owned, type-erased byte stream.
pub type Stream = Box<dyn SeekableStream>;

/// A byte source shared between a package and the windows it hands out.
pub type SharedStream = Arc<Mutex<Stream>>;

/// Total length of a stream, leaving its position untouched.
pub fn stream_length<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let position = stream.stream_position()?;
    let length = stream.seek(SeekFrom::End(0))?;
    if position != length {
        stream.seek(SeekFrom::Start(position))?;
    }
    Ok(length)
}

fn resolve_seek(position: u64, length: u64, target: SeekFrom) -> io::Result<u64> {
    let (base, delta) = match target {
        SeekFrom::Start(offset) => return Ok(offset),
        SeekFrom::End(delta) => (length, delta),
        SeekFrom::Current(delta) => (position, delta),
    };

    base.checked_add_signed(delta).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

/// A read-only window `[offset, offset + length)` over a shared byte source.
///
/// The window keeps its own cursor and seeks the source before every read,
/// so several windows over the same source can be used alternately.
pub struct SegmentStream {
    source: SharedStream,
    offset: u64,
    length: u64,
    position: u64,
}

impl SegmentStream {
    /// Create a window, checking that it fits inside the source.
    pub fn new(source: SharedStream, offset: u64, length: u64) -> Result<Self> {
        let total = stream_length(&mut **source.lock())?;
        let fits = offset
            .checked_add(length)
            .is_some_and(|end| end <= total);
        if !fits {
            return Err(Error::SegmentOutOfRange {
                offset,
                length,
                total,
            });
        }

        Ok(Self {
            source,
            offset,
            length,
            position: 0,
        })
    }

    /// Length of the window in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the window is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Read for SegmentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length || buf.is_empty() {
            return Ok(0);
        }

        let wanted = (self.length - self.position).min(buf.len() as u64) as usize;
        let mut source = self.source.lock();
        source.seek(SeekFrom::Start(self.offset + self.position))?;
        let read = source.read(&mut buf[..wanted])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for SegmentStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = resolve_seek(self.position, self.length, pos)?;
        Ok(self.position)
    }
}

impl std::fmt::Debug for SegmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStream")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

/// Several streams presented back to back as one.
pub struct MergedStream {
    parts: Vec<(Stream, u64)>,
    length: u64,
    position: u64,
}

impl MergedStream {
    /// Concatenate `parts` in order.
    pub fn new(parts: Vec<Stream>) -> io::Result<Self> {
        let mut sized = Vec::with_capacity(parts.len());
        let mut length = 0u64;
        for mut part in parts {
            let part_length = stream_length(&mut part)?;
            length += part_length;
            sized.push((part, part_length));
        }

        Ok(Self {
            parts: sized,
            length,
            position: 0,
        })
    }

    /// Total length of all parts.
    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether every part is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Read for MergedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut start = 0u64;
        for (part, part_length) in &mut self.parts {
            let end = start + *part_length;
            if self.position < end {
                let local = self.position - start;
                let wanted = (end - self.position).min(buf.len() as u64) as usize;
                part.seek(SeekFrom::Start(local))?;
                let read = part.read(&mut buf[..wanted])?;
                self.position += read as u64;
                return Ok(read);
            }
            start = end;
        }

        Ok(0)
    }
}

impl Seek for MergedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = resolve_seek(self.position, self.length, pos)?;
        Ok(self.position)
    }
}
