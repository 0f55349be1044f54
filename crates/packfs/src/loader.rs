//! Format detection and dispatch.
//!
//! Every reader is tried in a fixed order; the first one whose sniff test
//! accepts the stream opens it. Sniffing leaves the stream position where
//! it found it.

use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{ByteOrder, LE};
use packfs_common::Stream;
use parking_lot::Mutex;

use crate::database::{read_global_database, GLOBAL_DATABASE_NAME};
use crate::formats::{self, BagFile, BigFile, DrsFile, MixFile, PakFile, ZipFile};
use crate::{FileSystem, PackageHandle, Result};

/// Archive formats the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageFormat {
    /// Westwood Mix, by `.mix` extension.
    Mix,
    /// EA Big, by `BIGF`/`BIG4` magic.
    Big,
    /// Dune 2 Pak, by `.pak` extension.
    Pak,
    /// Ensemble Drs, by `.drs` extension.
    Drs,
    /// Bag audio, by `.bag` extension.
    Bag,
    /// InstallShield cabinet header, by `.hdr` extension and signature.
    InstallShieldCab,
    /// ZIP, by local-file or end-of-central-directory signature.
    Zip,
}

impl PackageFormat {
    /// Every format, in the order they are tried.
    pub const ALL: [Self; 7] = [
        Self::Mix,
        Self::Big,
        Self::Pak,
        Self::Drs,
        Self::Bag,
        Self::InstallShieldCab,
        Self::Zip,
    ];

    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mix => "mix",
            Self::Big => "big",
            Self::Pak => "pak",
            Self::Drs => "drs",
            Self::Bag => "bag",
            Self::InstallShieldCab => "cab",
            Self::Zip => "zip",
        }
    }

    /// Whether this format's reader would accept the stream.
    pub fn sniff(self, stream: &mut Stream, filename: &str) -> Result<bool> {
        let accepted = match self {
            Self::Mix => has_extension(filename, ".mix"),
            Self::Pak => has_extension(filename, ".pak"),
            Self::Drs => has_extension(filename, ".drs"),
            Self::Bag => has_extension(filename, ".bag"),
            Self::Big => {
                peek_magic(stream)?.is_some_and(|m| formats::big::MAGICS.contains(&&m))
            }
            Self::InstallShieldCab => {
                has_extension(filename, ".hdr")
                    && peek_magic(stream)?
                        .is_some_and(|m| LE::read_u32(&m) == formats::cab::SIGNATURE)
            }
            Self::Zip => peek_magic(stream)?.is_some_and(|m| {
                &m == formats::zip::LOCAL_FILE_MAGIC || &m == formats::zip::EMPTY_ARCHIVE_MAGIC
            }),
        };
        Ok(accepted)
    }

    /// Open the stream with this format's reader.
    pub fn open(
        self,
        stream: Stream,
        filename: &str,
        context: &FileSystem,
    ) -> Result<PackageHandle> {
        let package: PackageHandle = match self {
            Self::Mix => {
                let names = context.loaders().global_mix_names(context)?;
                Arc::new(MixFile::new(stream, filename, &names)?)
            }
            Self::Big => Arc::new(BigFile::new(stream, filename)?),
            Self::Pak => Arc::new(PakFile::new(stream, filename)?),
            Self::Drs => Arc::new(DrsFile::new(stream, filename)?),
            Self::Bag => Arc::new(BagFile::open(stream, filename, context)?),
            Self::InstallShieldCab => {
                Arc::new(formats::InstallShieldCab::open(stream, filename, context)?)
            }
            Self::Zip => ZipFile::new(stream, filename)?,
        };
        Ok(package)
    }
}

impl std::fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn has_extension(filename: &str, extension: &str) -> bool {
    let (name, ext) = (filename.as_bytes(), extension.as_bytes());
    name.len() >= ext.len() && name[name.len() - ext.len()..].eq_ignore_ascii_case(ext)
}

fn peek_magic(stream: &mut Stream) -> Result<Option<[u8; 4]>> {
    let position = stream.stream_position()?;
    let mut magic = [0u8; 4];
    let read = stream.read_exact(&mut magic);
    stream.seek(SeekFrom::Start(position))?;

    match read {
        Ok(()) => Ok(Some(magic)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The ordered set of formats a [`FileSystem`] parses packages with.
///
/// Also holds the global mix database once it has been found, so readers
/// never consult process-wide state.
pub struct PackageLoaders {
    formats: Vec<PackageFormat>,
    global_mix_names: Mutex<Option<Arc<[String]>>>,
}

impl PackageLoaders {
    /// All formats in registration order.
    pub fn new() -> Self {
        Self::with_formats(PackageFormat::ALL)
    }

    /// A custom selection of formats, tried in the given order.
    pub fn with_formats(formats: impl IntoIterator<Item = PackageFormat>) -> Self {
        Self {
            formats: formats.into_iter().collect(),
            global_mix_names: Mutex::new(None),
        }
    }

    pub fn formats(&self) -> &[PackageFormat] {
        &self.formats
    }

    /// Detect the format of `stream` and open it.
    ///
    /// Returns `Ok(None)` when no format accepts the stream. A reader that
    /// accepts but then fails to parse reports its error.
    pub fn try_parse(
        &self,
        mut stream: Stream,
        filename: &str,
        context: &FileSystem,
    ) -> Result<Option<PackageHandle>> {
        for &format in &self.formats {
            if format.sniff(&mut stream, filename)? {
                tracing::trace!(filename, %format, "format matched");
                return format.open(stream, filename, context).map(Some);
            }
        }

        tracing::trace!(filename, "no format matched");
        Ok(None)
    }

    /// Names from the global mix database, loaded through `context` the
    /// first time it can be found.
    pub fn global_mix_names(&self, context: &FileSystem) -> Result<Arc<[String]>> {
        if let Some(names) = self.global_mix_names.lock().as_ref() {
            return Ok(names.clone());
        }

        let Some(stream) = context.try_open(GLOBAL_DATABASE_NAME)? else {
            return Ok(Arc::from(Vec::new()));
        };

        let names: Arc<[String]> = read_global_database(stream)?.into();
        tracing::debug!(names = names.len(), "loaded global mix database");
        *self.global_mix_names.lock() = Some(names.clone());
        Ok(names)
    }
}

impl Default for PackageLoaders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(bytes: &[u8]) -> Stream {
        Box::new(Cursor::new(bytes.to_vec()))
    }

    fn detect(bytes: &[u8], filename: &str) -> Option<PackageFormat> {
        let mut s = stream(bytes);
        PackageFormat::ALL
            .into_iter()
            .find(|f| f.sniff(&mut s, filename).unwrap())
    }

    #[test]
    fn test_extension_formats_ignore_case() {
        assert_eq!(detect(b"", "CONQUER.MIX"), Some(PackageFormat::Mix));
        assert_eq!(detect(b"", "dune.Pak"), Some(PackageFormat::Pak));
        assert_eq!(detect(b"", "sounds.drs"), Some(PackageFormat::Drs));
        assert_eq!(detect(b"", "audio.bag"), Some(PackageFormat::Bag));
        assert_eq!(detect(b"", "readme.txt"), None);
    }

    #[test]
    fn test_magic_formats() {
        assert_eq!(detect(b"BIGF\0\0\0\0", "data.big"), Some(PackageFormat::Big));
        assert_eq!(detect(b"BIG4\0\0\0\0", "anything"), Some(PackageFormat::Big));
        assert_eq!(detect(b"PK\x03\x04rest", "mod.oramod"), Some(PackageFormat::Zip));
        assert_eq!(detect(b"PK\x05\x06", "empty.zip"), Some(PackageFormat::Zip));
        assert_eq!(detect(b"PK", "short.zip"), None);
    }

    #[test]
    fn test_cab_needs_extension_and_signature() {
        let signature = formats::cab::SIGNATURE.to_le_bytes();
        assert_eq!(detect(&signature, "data1.HDR"), Some(PackageFormat::InstallShieldCab));
        assert_eq!(detect(&signature, "data1.cab"), None);
        assert_eq!(detect(b"ISc)", "data1.hdr"), None);
    }

    #[test]
    fn test_sniff_restores_position() {
        let mut s = stream(b"xxBIGF");
        s.seek(SeekFrom::Start(2)).unwrap();
        assert!(PackageFormat::Big.sniff(&mut s, "a.big").unwrap());
        assert_eq!(s.stream_position().unwrap(), 2);
        assert!(!PackageFormat::Zip.sniff(&mut s, "a.big").unwrap());
        assert_eq!(s.stream_position().unwrap(), 2);
    }

    #[test]
    fn test_mix_sorts_before_magic() {
        // A .mix that happens to start with a zip signature is still a mix.
        assert_eq!(detect(b"PK\x03\x04", "odd.mix"), Some(PackageFormat::Mix));
    }
}
