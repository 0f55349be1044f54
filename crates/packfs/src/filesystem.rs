//! The layered virtual filesystem.
//!
//! Packages are mounted in order; a name resolves to the most recently
//! mounted package that contains it. A mount may carry an explicit name, in
//! which case `name|path` addresses that package alone.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use packfs_common::Stream;

use crate::formats::Directory;
use crate::loader::PackageLoaders;
use crate::config::resolve_case_insensitive_path;
use crate::{same_package, Error, FileSystemConfig, PackageHandle, Result};

/// Packages owned by someone else, addressed with `$id`.
pub trait ModPackages: Send + Sync {
    /// The package registered under `id`.
    fn package(&self, id: &str) -> Option<PackageHandle>;

    /// Every registered id.
    fn ids(&self) -> Vec<String>;
}

impl ModPackages for HashMap<String, PackageHandle> {
    fn package(&self, id: &str) -> Option<PackageHandle> {
        self.get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A package as held by the filesystem.
#[derive(Clone)]
pub enum MountedPackage {
    /// Opened by the filesystem, released when its last mount goes away.
    Owned(PackageHandle),
    /// Borrowed from the mod table, which keeps it alive.
    External(PackageHandle),
}

impl MountedPackage {
    pub fn package(&self) -> &PackageHandle {
        match self {
            Self::Owned(package) | Self::External(package) => package,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External(_))
    }
}

impl From<PackageHandle> for MountedPackage {
    fn from(package: PackageHandle) -> Self {
        Self::Owned(package)
    }
}

impl std::fmt::Debug for MountedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_external() { "External" } else { "Owned" };
        f.debug_tuple(kind).field(&self.package().name()).finish()
    }
}

struct MountRecord {
    package: MountedPackage,
    count: usize,
}

/// Ordered composition of mounted packages.
pub struct FileSystem {
    config: FileSystemConfig,
    loaders: PackageLoaders,
    mods: Option<Box<dyn ModPackages>>,
    current_mod: Option<String>,
    /// Oldest first.
    mounted: Vec<MountRecord>,
    explicit_mounts: HashMap<String, PackageHandle>,
    /// Name to candidate packages, lowest priority first.
    file_index: HashMap<String, Vec<PackageHandle>>,
}

impl FileSystem {
    pub fn new(config: FileSystemConfig) -> Self {
        Self {
            config,
            loaders: PackageLoaders::new(),
            mods: None,
            current_mod: None,
            mounted: Vec::new(),
            explicit_mounts: HashMap::new(),
            file_index: HashMap::new(),
        }
    }

    /// Attach the table `$id` mounts resolve against. `current_mod` names
    /// the mod this filesystem belongs to; its own package is never
    /// reported as external.
    pub fn with_mods(
        mut self,
        mods: impl ModPackages + 'static,
        current_mod: Option<&str>,
    ) -> Self {
        self.mods = Some(Box::new(mods));
        self.current_mod = current_mod.map(str::to_string);
        self
    }

    /// Replace the format dispatcher.
    pub fn with_loaders(mut self, loaders: PackageLoaders) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    pub fn loaders(&self) -> &PackageLoaders {
        &self.loaders
    }

    /// Mount a package by name.
    ///
    /// - `~name` is optional: any failure is logged and `Ok(None)` returned.
    /// - `$id` mounts the mod table's package for `id`.
    /// - Anything else goes through [`FileSystem::open_package`].
    pub fn mount(
        &mut self,
        name: &str,
        explicit_name: Option<&str>,
    ) -> Result<Option<PackageHandle>> {
        if let Some(optional) = name.strip_prefix('~') {
            return match self.mount(optional, explicit_name) {
                Ok(package) => Ok(package),
                Err(e) => {
                    tracing::debug!(
                        package = %optional,
                        error = %e,
                        "optional package not mounted"
                    );
                    Ok(None)
                }
            };
        }

        let mounted = if let Some(id) = name.strip_prefix('$') {
            let package = self.mods.as_ref().and_then(|mods| mods.package(id));
            let package = package.ok_or_else(|| Error::UnknownMod {
                id: id.to_string(),
                available: self.mods.as_ref().map(|mods| mods.ids()).unwrap_or_default(),
            })?;
            MountedPackage::External(package)
        } else {
            let package = self
                .open_package(name)?
                .ok_or_else(|| Error::UnsupportedPackage(name.to_string()))?;
            MountedPackage::Owned(package)
        };

        let package = mounted.package().clone();
        self.mount_package(mounted, explicit_name)?;
        Ok(Some(package))
    }

    /// Mount an already-opened package.
    ///
    /// Mounting a package that is already mounted moves it to the top
    /// priority and increments its mount count.
    pub fn mount_package(
        &mut self,
        package: impl Into<MountedPackage>,
        explicit_name: Option<&str>,
    ) -> Result<()> {
        let mounted = package.into();
        let package = mounted.package().clone();

        if let Some(alias) = explicit_name {
            if let Some(existing) = self.explicit_mounts.get(alias) {
                if !same_package(existing, &package) {
                    return Err(Error::DuplicateExplicitMount(alias.to_string()));
                }
            }
        }

        if let Some(position) = self.position_of(&package) {
            let mut record = self.mounted.remove(position);
            record.count += 1;
            for file in package.contents() {
                let candidates = self.file_index.entry(file).or_default();
                candidates.retain(|p| !same_package(p, &package));
                candidates.push(package.clone());
            }
            tracing::debug!(package = %package.name(), count = record.count, "remounted package");
            self.mounted.push(record);
        } else {
            let contents = package.contents();
            tracing::debug!(
                package = %package.name(),
                files = contents.len(),
                external = mounted.is_external(),
                "mounted package"
            );
            for file in contents {
                self.file_index.entry(file).or_default().push(package.clone());
            }
            self.mounted.push(MountRecord {
                package: mounted,
                count: 1,
            });
        }

        if let Some(alias) = explicit_name {
            self.explicit_mounts.insert(alias.to_string(), package);
        }
        Ok(())
    }

    /// Drop one mount of `package`. Returns false if it was not mounted.
    pub fn unmount(&mut self, package: &PackageHandle) -> bool {
        let Some(position) = self.position_of(package) else {
            return false;
        };

        let record = &mut self.mounted[position];
        record.count -= 1;
        if record.count > 0 {
            return true;
        }

        let record = self.mounted.remove(position);
        self.file_index.retain(|_, candidates| {
            candidates.retain(|p| !same_package(p, package));
            !candidates.is_empty()
        });
        self.explicit_mounts.retain(|_, p| !same_package(p, package));

        match record.package {
            MountedPackage::Owned(package) => {
                tracing::debug!(package = %package.name(), "released package");
            }
            MountedPackage::External(package) => {
                tracing::debug!(package = %package.name(), "detached external package");
            }
        }
        true
    }

    /// Drop every mount at once.
    pub fn unmount_all(&mut self) {
        tracing::debug!(packages = self.mounted.len(), "unmounting all packages");
        self.mounted.clear();
        self.explicit_mounts.clear();
        self.file_index.clear();
    }

    /// Replace the current mounts with `packages`, mounted in order.
    pub fn load_packages<I, N>(&mut self, packages: I) -> Result<()>
    where
        I: IntoIterator<Item = (N, Option<N>)>,
        N: AsRef<str>,
    {
        self.unmount_all();
        for (name, explicit_name) in packages {
            self.mount(name.as_ref(), explicit_name.as_ref().map(AsRef::as_ref))?;
        }
        Ok(())
    }

    /// Open `name` as a package without mounting it.
    ///
    /// Returns `Ok(None)` when the bytes are found but no format accepts
    /// them.
    pub fn open_package(&self, name: &str) -> Result<Option<PackageHandle>> {
        let addressed = name.contains('|');
        let mut path = self.config.resolve_path(name);
        if !addressed && !path.exists() {
            if let Some(found) = resolve_case_insensitive_path(&path) {
                tracing::trace!(name, path = %found.display(), "matched ignoring case");
                path = found;
            }
        }

        if !addressed && path.is_dir() {
            return Ok(Some(Arc::new(Directory::new(path)?)));
        }

        if let Some((parent, subpath)) = self.try_get_package_containing(name) {
            return parent.open_package(&subpath, self);
        }

        let stream: Stream = if !addressed && path.is_file() {
            Box::new(File::open(&path)?)
        } else {
            self.open(name)?
        };
        self.try_parse_package(stream, name)
    }

    /// Detect the format of `stream` and open it.
    pub fn try_parse_package(
        &self,
        stream: Stream,
        filename: &str,
    ) -> Result<Option<PackageHandle>> {
        self.loaders.try_parse(stream, filename, self)
    }

    /// The package that currently supplies `path`, and the name to use
    /// inside it.
    pub fn try_get_package_containing(&self, path: &str) -> Option<(PackageHandle, String)> {
        if let Some((package, rest)) = self.split_explicit(path) {
            return Some((package.clone(), rest.to_string()));
        }

        self.indexed(path)
            .or_else(|| (!has_explicit_split(path)).then(|| self.any_containing(path)).flatten())
            .map(|package| (package, path.to_string()))
    }

    /// Open a file, failing with [`Error::NotFound`] if no package has it.
    pub fn open(&self, filename: &str) -> Result<Stream> {
        self.try_open(filename)?
            .ok_or_else(|| Error::NotFound(filename.to_string()))
    }

    /// Open a file, or `Ok(None)` if no package has it.
    pub fn try_open(&self, filename: &str) -> Result<Option<Stream>> {
        if let Some((package, rest)) = self.split_explicit(filename) {
            return package.get_stream(rest);
        }

        if let Some(package) = self.indexed(filename) {
            if let Some(stream) = package.get_stream(filename)? {
                return Ok(Some(stream));
            }
        }

        if has_explicit_split(filename) {
            return Ok(None);
        }

        for record in self.mounted.iter().rev() {
            let package = record.package.package();
            if package.contains(filename) {
                if let Some(stream) = package.get_stream(filename)? {
                    return Ok(Some(stream));
                }
            }
        }
        Ok(None)
    }

    /// Whether [`FileSystem::try_open`] would find `filename`.
    pub fn exists(&self, filename: &str) -> bool {
        if let Some((package, rest)) = self.split_explicit(filename) {
            return package.contains(rest);
        }

        self.indexed(filename).is_some()
            || (!has_explicit_split(filename) && self.any_containing(filename).is_some())
    }

    /// Whether `filename` is addressed into a package borrowed from another
    /// mod.
    pub fn is_external_mod_file(&self, filename: &str) -> bool {
        let Some((package, _)) = self.split_explicit(filename) else {
            return false;
        };

        if let (Some(mods), Some(current)) = (&self.mods, &self.current_mod) {
            if mods.package(current).is_some_and(|own| same_package(&own, package)) {
                return false;
            }
        }

        self.position_of(package)
            .is_some_and(|i| self.mounted[i].package.is_external())
    }

    /// The explicit name `package` was mounted under, if any.
    pub fn prefix_of(&self, package: &PackageHandle) -> Option<&str> {
        self.explicit_mounts
            .iter()
            .find(|(_, p)| same_package(p, package))
            .map(|(name, _)| name.as_str())
    }

    /// Mounted packages, oldest first.
    pub fn mounted_packages(&self) -> Vec<PackageHandle> {
        self.mounted
            .iter()
            .map(|record| record.package.package().clone())
            .collect()
    }

    fn position_of(&self, package: &PackageHandle) -> Option<usize> {
        self.mounted
            .iter()
            .position(|record| same_package(record.package.package(), package))
    }

    fn split_explicit<'a>(&self, filename: &'a str) -> Option<(&PackageHandle, &'a str)> {
        let (prefix, rest) = filename.split_once('|')?;
        if prefix.is_empty() {
            return None;
        }
        self.explicit_mounts.get(prefix).map(|package| (package, rest))
    }

    fn indexed(&self, filename: &str) -> Option<PackageHandle> {
        self.file_index
            .get(filename)?
            .iter()
            .rev()
            .find(|package| package.contains(filename))
            .cloned()
    }

    fn any_containing(&self, filename: &str) -> Option<PackageHandle> {
        self.mounted
            .iter()
            .rev()
            .map(|record| record.package.package())
            .find(|package| package.contains(filename))
            .cloned()
    }
}

fn has_explicit_split(filename: &str) -> bool {
    filename.find('|').is_some_and(|i| i > 0)
}
