//! Filesystem configuration.

use std::fs;
use std::path::{Component, Path, PathBuf};

/// Where native mount paths are resolved from.
///
/// Relative names are joined to `base_dir`. A leading `^` selects the
/// support directory instead, which defaults to `base_dir` when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileSystemConfig {
    /// Game installation directory.
    pub base_dir: PathBuf,
    /// Per-user data directory, addressed with `^`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub support_dir: Option<PathBuf>,
}

impl FileSystemConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            support_dir: None,
        }
    }

    /// Set the directory `^` paths resolve against.
    pub fn with_support_dir(mut self, support_dir: impl Into<PathBuf>) -> Self {
        self.support_dir = Some(support_dir.into());
        self
    }

    /// The directory `^` paths resolve against.
    pub fn support_dir(&self) -> &Path {
        self.support_dir.as_deref().unwrap_or(&self.base_dir)
    }

    /// Map a mount name to a native path.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        if let Some(rest) = name.strip_prefix('^') {
            return self.support_dir().join(rest.trim_start_matches(['/', '\\']));
        }

        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Find an existing path that matches `path` ignoring ASCII case, one
/// component at a time.
///
/// Legacy content ships names like `CONQUER.MIX`; on case-sensitive hosts
/// this finds them from `conquer.mix`. `.` components are dropped. Returns
/// `None` if any component has no match.
pub fn resolve_case_insensitive_path(path: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                if candidate.exists() {
                    resolved = candidate;
                    continue;
                }

                let wanted = name.to_str()?;
                let dir = if resolved.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    resolved.as_path()
                };
                let found = fs::read_dir(dir)
                    .ok()?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name())
                    .find(|entry| entry.to_str().is_some_and(|e| e.eq_ignore_ascii_case(wanted)))?;
                resolved.push(found);
            }
            other => resolved.push(other),
        }
    }
    Some(resolved)
}
