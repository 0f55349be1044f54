//! Archive readers, one module per on-disk format.

pub mod bag;
pub mod big;
pub mod cab;
pub mod directory;
pub mod drs;
pub mod mix;
pub mod pak;
pub mod zip;

pub use bag::BagFile;
pub use big::BigFile;
pub use cab::InstallShieldCab;
pub use directory::Directory;
pub use drs::DrsFile;
pub use mix::MixFile;
pub use pak::PakFile;
pub use zip::{ReadWriteZipFile, ZipFile, ZipFolder};
