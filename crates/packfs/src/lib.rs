//! Layered virtual filesystem over legacy strategy-game archives.
//!
//! A [`FileSystem`] composes any number of packages into one namespace.
//! Packages come in several on-disk formats:
//!
//! - Plain directories (read-write)
//! - Westwood Mix archives, including Blowfish-encrypted headers
//! - EA Big archives
//! - Offset-chained Pak archives
//! - Ensemble Drs archives
//! - Bag audio archives with their `.idx` index
//! - Multi-volume InstallShield cabinets (`data1.hdr` + `data1.cab`, ...)
//! - ZIP archives and folders inside them
//!
//! Later mounts override earlier ones, and a mount may be given an explicit
//! name so that `name|path` always resolves inside that package.
//!
//! # Example
//!
//! ```no_run
//! use packfs::{FileSystem, FileSystemConfig};
//!
//! let mut fs = FileSystem::new(FileSystemConfig::new("/opt/game"));
//! fs.mount("content", Some("core"))?;
//! fs.mount("~conquer.mix", None)?;
//!
//! let mut rules = fs.open("core|rules.yaml")?;
//! # Ok::<(), packfs::Error>(())
//! ```

mod config;
pub mod crypto;
pub mod database;
mod error;
mod filesystem;
pub mod formats;
pub mod loader;
mod package;

pub use config::{resolve_case_insensitive_path, FileSystemConfig};
pub use error::{Error, Result};
pub use filesystem::{FileSystem, ModPackages, MountedPackage};
pub use loader::{PackageFormat, PackageLoaders};
pub use package::{same_package, Package, PackageHandle, WritablePackage};

pub use packfs_common::{hash_filename, PackageHashType, Stream};
