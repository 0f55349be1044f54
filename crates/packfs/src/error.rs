//! Error types for the packfs crate.

use thiserror::Error;

/// Errors that can occur while opening packages or resolving files.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Common library error.
    #[error("{0}")]
    Common(#[from] packfs_common::Error),

    /// The name is not supplied by any mounted package.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Magic bytes or a type tag did not match the format.
    #[error("{format}: invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        format: &'static str,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    /// An entry points outside the archive.
    #[error("{format}: entry {name} at offset {offset} (+{length}) exceeds archive length {total}")]
    OutOfBounds {
        format: &'static str,
        name: String,
        offset: u64,
        length: u64,
        total: u64,
    },

    /// Any other structural inconsistency.
    #[error("{format}: malformed archive: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },

    /// No reader recognised the file.
    #[error("could not open package '{0}': file not found or its format is not supported")]
    UnsupportedPackage(String),

    /// A `$` mount named a mod the mod table does not know.
    #[error("could not load mod '{id}'. Available mods: {}", available.join(", "))]
    UnknownMod { id: String, available: Vec<String> },

    /// An explicit mount name is already taken by another package.
    #[error("explicit mount name '{0}' is already in use")]
    DuplicateExplicitMount(String),

    /// A path would leave the root of a directory package.
    #[error("path '{0}' escapes the package root")]
    PathEscape(String),

    /// An InstallShield volume needed for extraction was not opened.
    #[error("volume {0} is not available")]
    VolumeUnavailable(u16),

    /// Decompression error.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Decryption error.
    #[error("decryption error: {0}")]
    Decryption(String),

    /// ZIP codec error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Shorthand for [`Error::Malformed`].
    pub(crate) fn malformed(format: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            format,
            reason: reason.into(),
        }
    }
}

/// Result type for packfs operations.
pub type Result<T> = std::result::Result<T, Error>;
