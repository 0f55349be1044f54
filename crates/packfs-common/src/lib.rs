//! Common utilities for packfs.
//!
//! This crate provides the foundational pieces shared by every packfs reader:
//!
//! - [`BinaryReader`] - Zero-copy binary reading from byte slices
//! - [`ReadExt`] - Fixed-record and NUL-terminated string reads on streams
//! - [`Stream`] and friends - The seekable byte-stream abstraction packages hand out
//! - [`hash`] - The two legacy filename hashing algorithms used by Mix archives

mod error;
mod reader;
mod stream;

pub mod hash;

pub use error::{Error, Result};
pub use hash::{hash_filename, PackageHashType};
pub use reader::{BinaryReader, ReadExt};
pub use stream::{
    stream_length, MergedStream, SeekableStream, SegmentStream, SharedStream, Stream,
};

/// Re-exported for NUL scanning in fixed-size name fields.
pub use memchr;
