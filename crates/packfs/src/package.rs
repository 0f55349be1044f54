//! The contract every archive reader implements.

use std::io::{Cursor, Read};
use std::sync::Arc;

use packfs_common::Stream;

use crate::{FileSystem, Result};

/// A shared handle to a mounted package.
pub type PackageHandle = Arc<dyn Package>;

/// A readable container of named blobs.
///
/// Dropping the last handle releases the package's byte source.
pub trait Package: Send + Sync {
    /// Name the package was opened under.
    fn name(&self) -> &str;

    /// Every logical filename this package can supply.
    fn contents(&self) -> Vec<String>;

    /// Whether `filename` can be opened from this package.
    fn contains(&self, filename: &str) -> bool;

    /// Open a file, or `Ok(None)` when the package does not have it.
    fn get_stream(&self, filename: &str) -> Result<Option<Stream>>;

    /// Open a package stored inside this one.
    ///
    /// The child is parsed from an in-memory copy of its bytes so it does not
    /// borrow from the parent.
    fn open_package(&self, filename: &str, context: &FileSystem) -> Result<Option<PackageHandle>> {
        let Some(mut stream) = self.get_stream(filename)? else {
            return Ok(None);
        };

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        context.try_parse_package(Box::new(Cursor::new(bytes)), filename)
    }

    /// Write access, for the packages that support it.
    fn as_writable(&self) -> Option<&dyn WritablePackage> {
        None
    }
}

/// A package that can be modified in place.
pub trait WritablePackage: Package {
    /// Create or replace `filename`.
    fn update(&self, filename: &str, contents: &[u8]) -> Result<()>;

    /// Remove `filename`.
    fn delete(&self, filename: &str) -> Result<()>;
}

/// Whether two handles refer to the same package instance.
pub fn same_package(a: &PackageHandle, b: &PackageHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
