//! Native directories as packages.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use packfs_common::Stream;

use crate::{Error, FileSystem, Package, PackageHandle, Result, WritablePackage};

/// A directory on the native filesystem.
///
/// Names are resolved relative to the root and may use `/` or `\` as a
/// separator. Only the top level is listed by [`Package::contents`]; deeper
/// files are still reachable by path.
#[derive(Debug)]
pub struct Directory {
    name: String,
    root: PathBuf,
}

impl Directory {
    /// Open `root`, creating it if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: root.display().to_string(),
            root,
        })
    }

    /// The native path of the directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let escape = || Error::PathEscape(filename.to_string());

        if Path::new(filename)
            .components()
            .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
            || filename.starts_with(['/', '\\'])
        {
            return Err(escape());
        }

        let mut path = self.root.clone();
        let mut depth = 0usize;
        for part in filename.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    depth = depth.checked_sub(1).ok_or_else(escape)?;
                    path.pop();
                }
                part => {
                    depth += 1;
                    path.push(part);
                }
            }
        }

        Ok(path)
    }
}

impl Package for Directory {
    fn name(&self) -> &str {
        &self.name
    }

    fn contents(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(root = %self.root.display(), error = %e, "cannot list directory");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn contains(&self, filename: &str) -> bool {
        self.resolve(filename).is_ok_and(|path| path.is_file())
    }

    fn get_stream(&self, filename: &str) -> Result<Option<Stream>> {
        let path = self.resolve(filename)?;
        if path.is_dir() {
            return Ok(None);
        }

        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_package(&self, filename: &str, context: &FileSystem) -> Result<Option<PackageHandle>> {
        let path = self.resolve(filename)?;
        if path.is_dir() {
            return Ok(Some(Arc::new(Directory::new(path)?)));
        }
        if !path.is_file() {
            return Ok(None);
        }

        context.try_parse_package(Box::new(File::open(&path)?), filename)
    }

    fn as_writable(&self) -> Option<&dyn WritablePackage> {
        Some(self)
    }
}

impl WritablePackage for Directory {
    fn update(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(filename)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(())
    }

    fn delete(&self, filename: &str) -> Result<()> {
        let path = self.resolve(filename)?;
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.is_file() {
            fs::remove_file(&path)?;
        } else {
            return Err(Error::NotFound(filename.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read(dir: &Directory, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        dir.get_stream(name)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_creates_missing_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("a/b");
        let dir = Directory::new(&root).unwrap();
        assert!(root.is_dir());
        assert!(dir.contents().is_empty());
    }

    #[test]
    fn test_write_read_delete() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Directory::new(temp.path()).unwrap();

        dir.update("maps/desert/map.yaml", b"Title: Desert").unwrap();
        dir.update("rules.yaml", b"World:").unwrap();

        assert_eq!(read(&dir, "maps/desert/map.yaml"), b"Title: Desert");
        assert_eq!(read(&dir, "maps\\desert\\map.yaml"), b"Title: Desert");
        assert_eq!(dir.contents(), ["maps", "rules.yaml"]);
        assert!(dir.contains("rules.yaml"));
        assert!(!dir.contains("maps"));

        dir.delete("maps").unwrap();
        assert!(!temp.path().join("maps").exists());
        assert!(dir.get_stream("maps/desert/map.yaml").unwrap().is_none());
        assert!(matches!(dir.delete("maps"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rejects_escape() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Directory::new(temp.path().join("root")).unwrap();

        for name in ["../outside.txt", "a/../../outside.txt", "/etc/passwd"] {
            assert!(
                matches!(dir.get_stream(name), Err(Error::PathEscape(_))),
                "{name} should be rejected"
            );
        }
        assert!(matches!(
            dir.update("../x", b""),
            Err(Error::PathEscape(_))
        ));

        dir.update("a/b.txt", b"ok").unwrap();
        assert_eq!(read(&dir, "a/../a/b.txt"), b"ok");
    }
}
