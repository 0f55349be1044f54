//! Error types for packfs-common.

use thiserror::Error;

/// Common error type for low-level reads.
#[derive(Debug, Error)]
pub enum Error {
    /// End of buffer reached while reading.
    #[error("unexpected end of buffer: needed {needed} bytes but only {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    /// A position handed to the reader lies outside the buffer.
    #[error("position {position} is outside a buffer of {len} bytes")]
    BadPosition { position: usize, len: usize },

    /// A window over a byte source does not fit inside it.
    #[error("segment [{offset}, +{length}) exceeds source length {total}")]
    SegmentOutOfRange { offset: u64, length: u64, total: u64 },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing null terminator in string.
    #[error("string missing null terminator")]
    MissingNullTerminator,
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
