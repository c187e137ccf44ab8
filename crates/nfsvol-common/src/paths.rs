//! Standard filesystem paths for nfsvol.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Suffix appended to a volume mount point to name its intermediate mount.
pub const INTERMEDIATE_SUFFIX: &str = "_mapfs";

/// File name of the persisted driver state, relative to the mount root.
pub const STATE_FILE_NAME: &str = "driver-state.json";

/// Default mount root directory.
pub static NFSVOL_MOUNT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("NFSVOL_MOUNT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/volumes"))
});

/// Standard paths used by the volume driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPaths {
    /// Directory under which every volume is mounted (default: /tmp/volumes).
    pub mount_root: PathBuf,
}

impl DriverPaths {
    /// Create paths with the default mount root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom mount root.
    #[must_use]
    pub fn with_mount_root(root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: root.into(),
        }
    }

    /// Mount point for a named volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> PathBuf {
        self.mount_root.join(name)
    }

    /// The persisted driver state file.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.mount_root.join(STATE_FILE_NAME)
    }
}

impl Default for DriverPaths {
    fn default() -> Self {
        Self {
            mount_root: NFSVOL_MOUNT_DIR.clone(),
        }
    }
}

/// Strip a single trailing slash, leaving the filesystem root intact.
#[must_use]
pub fn trim_trailing_slash(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

/// The intermediate kernel mount that backs a remapped target.
#[must_use]
pub fn intermediate_mount(target: &Path) -> PathBuf {
    let target = target.to_string_lossy();
    PathBuf::from(format!(
        "{}{INTERMEDIATE_SUFFIX}",
        trim_trailing_slash(&target)
    ))
}

/// The real mount point an intermediate directory belongs to.
#[must_use]
pub fn real_mountpoint(intermediate: &str) -> &str {
    intermediate
        .strip_suffix(INTERMEDIATE_SUFFIX)
        .unwrap_or(intermediate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = DriverPaths::with_mount_root("/var/vcap/data/volumes/nfs");
        assert_eq!(
            paths.volume("vol1"),
            PathBuf::from("/var/vcap/data/volumes/nfs/vol1")
        );
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/var/vcap/data/volumes/nfs/driver-state.json")
        );
    }

    #[test]
    fn intermediate_drops_trailing_slash() {
        assert_eq!(
            intermediate_mount(Path::new("/some/target/")),
            PathBuf::from("/some/target_mapfs")
        );
        assert_eq!(
            intermediate_mount(Path::new("/some/target")),
            PathBuf::from("/some/target_mapfs")
        );
    }

    #[test]
    fn real_mountpoint_strips_suffix() {
        assert_eq!(real_mountpoint("/tmp/volumes/a_mapfs"), "/tmp/volumes/a");
        assert_eq!(real_mountpoint("/tmp/volumes/a"), "/tmp/volumes/a");
    }

    #[test]
    fn trailing_slash() {
        assert_eq!(trim_trailing_slash("/a/b/"), "/a/b");
        assert_eq!(trim_trailing_slash("/a/b"), "/a/b");
        assert_eq!(trim_trailing_slash("/"), "/");
    }
}
