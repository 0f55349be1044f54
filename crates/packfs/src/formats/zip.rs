//! ZIP packages.
//!
//! [`ZipFile`] reads an archive in place, [`ReadWriteZipFile`] keeps one in
//! memory and rewrites it (and its backing file, if any) on every change, and
//! [`ZipFolder`] presents a directory inside either as a package of its own.

use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use packfs_common::Stream;
use parking_lot::Mutex;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Error, FileSystem, Package, PackageHandle, Result, WritablePackage};

/// Local file header signature.
pub const LOCAL_FILE_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// End of central directory signature, the first bytes of an empty archive.
pub const EMPTY_ARCHIVE_MAGIC: &[u8; 4] = b"PK\x05\x06";

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    filename: &str,
) -> Result<Option<Vec<u8>>> {
    match archive.by_name(filename) {
        Ok(mut file) => {
            if file.is_dir() {
                return Ok(None);
            }
            let mut out = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut out)?;
            Ok(Some(out))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_directory<R: Read + Seek>(archive: &ZipArchive<R>, filename: &str) -> bool {
    let dir = format!("{}/", filename.trim_end_matches('/'));
    archive.index_for_name(&dir).is_some()
}

/// Nested open shared by the zip packages: directories become folders,
/// anything else goes through the dispatcher.
fn open_nested(
    package: &dyn Package,
    this: Weak<dyn Package>,
    is_dir: bool,
    filename: &str,
    context: &FileSystem,
) -> Result<Option<PackageHandle>> {
    if is_dir {
        return Ok(Some(Arc::new(ZipFolder::new(this, filename))));
    }

    let Some(stream) = package.get_stream(filename)? else {
        return Ok(None);
    };
    context.try_parse_package(stream, filename)
}

/// A read-only ZIP archive.
pub struct ZipFile {
    name: String,
    archive: Mutex<ZipArchive<Stream>>,
    this: Weak<ZipFile>,
}

impl ZipFile {
    /// Open an archive.
    pub fn new(stream: Stream, filename: &str) -> Result<Arc<Self>> {
        let archive = ZipArchive::new(stream)?;
        tracing::trace!(filename, entries = archive.len(), "opened zip");
        Ok(Arc::new_cyclic(|this| Self {
            name: filename.to_string(),
            archive: Mutex::new(archive),
            this: this.clone(),
        }))
    }
}

impl Package for ZipFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn contents(&self) -> Vec<String> {
        self.archive.lock().file_names().map(str::to_string).collect()
    }

    fn contains(&self, filename: &str) -> bool {
        self.archive.lock().index_for_name(filename).is_some()
    }

    fn get_stream(&self, filename: &str) -> Result<Option<Stream>> {
        let bytes = read_entry(&mut self.archive.lock(), filename)?;
        Ok(bytes.map(|b| Box::new(Cursor::new(b)) as Stream))
    }

    fn open_package(&self, filename: &str, context: &FileSystem) -> Result<Option<PackageHandle>> {
        let is_dir = is_directory(&self.archive.lock(), filename);
        let this: Weak<dyn Package> = self.this.clone();
        open_nested(self, this, is_dir, filename, context)
    }
}

/// An in-memory ZIP archive that supports writes.
///
/// When created with a path, every change is written back to it.
pub struct ReadWriteZipFile {
    name: String,
    path: Option<PathBuf>,
    archive: Mutex<ZipArchive<Cursor<Vec<u8>>>>,
    this: Weak<ReadWriteZipFile>,
}

impl ReadWriteZipFile {
    /// Load an existing archive from disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        Self::from_bytes(bytes, Some(path))
    }

    /// Start an empty archive, optionally backed by `path`.
    pub fn create(path: Option<PathBuf>) -> Result<Arc<Self>> {
        let bytes = ZipWriter::new(Cursor::new(Vec::new())).finish()?.into_inner();
        if let Some(path) = &path {
            fs::write(path, &bytes)?;
        }
        Self::from_bytes(bytes, path)
    }

    fn from_bytes(bytes: Vec<u8>, path: Option<PathBuf>) -> Result<Arc<Self>> {
        let archive = ZipArchive::new(Cursor::new(bytes))?;
        let name = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Ok(Arc::new_cyclic(|this| Self {
            name,
            path,
            archive: Mutex::new(archive),
            this: this.clone(),
        }))
    }

    /// Copy every entry except `skip`, then append `add`.
    fn rewrite(&self, skip: &str, add: Option<&[u8]>) -> Result<()> {
        let mut archive = self.archive.lock();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            if file.name() == skip {
                continue;
            }
            writer.raw_copy_file(file)?;
        }

        if let Some(contents) = add {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file(skip, options)?;
            writer.write_all(contents)?;
        }

        let bytes = writer.finish()?.into_inner();
        if let Some(path) = &self.path {
            fs::write(path, &bytes)?;
        }
        *archive = ZipArchive::new(Cursor::new(bytes))?;
        Ok(())
    }
}

impl Package for ReadWriteZipFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn contents(&self) -> Vec<String> {
        self.archive.lock().file_names().map(str::to_string).collect()
    }

    fn contains(&self, filename: &str) -> bool {
        self.archive.lock().index_for_name(filename).is_some()
    }

    fn get_stream(&self, filename: &str) -> Result<Option<Stream>> {
        let bytes = read_entry(&mut self.archive.lock(), filename)?;
        Ok(bytes.map(|b| Box::new(Cursor::new(b)) as Stream))
    }

    fn open_package(&self, filename: &str, context: &FileSystem) -> Result<Option<PackageHandle>> {
        let is_dir = is_directory(&self.archive.lock(), filename);
        let this: Weak<dyn Package> = self.this.clone();
        open_nested(self, this, is_dir, filename, context)
    }

    fn as_writable(&self) -> Option<&dyn WritablePackage> {
        Some(self)
    }
}

impl WritablePackage for ReadWriteZipFile {
    fn update(&self, filename: &str, contents: &[u8]) -> Result<()> {
        self.rewrite(filename, Some(contents))
    }

    fn delete(&self, filename: &str) -> Result<()> {
        if !self.contains(filename) {
            return Err(Error::NotFound(filename.to_string()));
        }
        self.rewrite(filename, None)
    }
}

/// A directory inside a zip archive.
///
/// Holds only a weak reference to its archive; once the archive is gone the
/// folder is empty.
pub struct ZipFolder {
    name: String,
    parent: Weak<dyn Package>,
}

impl ZipFolder {
    /// A view of `path` inside `parent`.
    pub fn new(parent: Weak<dyn Package>, path: &str) -> Self {
        Self {
            name: path.trim_end_matches('/').to_string(),
            parent,
        }
    }

    fn full_name(&self, filename: &str) -> String {
        format!("{}/{}", self.name, filename)
    }
}

impl Package for ZipFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn contents(&self) -> Vec<String> {
        let Some(parent) = self.parent.upgrade() else {
            return Vec::new();
        };

        let prefix = format!("{}/", self.name);
        parent
            .contents()
            .into_iter()
            .filter_map(|entry| {
                let child = entry.strip_prefix(&prefix)?;
                let levels = child.split('/').filter(|p| !p.is_empty()).count();
                (levels == 1).then(|| child.trim_end_matches('/').to_string())
            })
            .collect()
    }

    fn contains(&self, filename: &str) -> bool {
        self.parent
            .upgrade()
            .is_some_and(|parent| parent.contains(&self.full_name(filename)))
    }

    fn get_stream(&self, filename: &str) -> Result<Option<Stream>> {
        match self.parent.upgrade() {
            Some(parent) => parent.get_stream(&self.full_name(filename)),
            None => Ok(None),
        }
    }

    fn open_package(&self, filename: &str, context: &FileSystem) -> Result<Option<PackageHandle>> {
        match self.parent.upgrade() {
            Some(parent) => parent.open_package(&self.full_name(filename), context),
            None => Ok(None),
        }
    }
}
