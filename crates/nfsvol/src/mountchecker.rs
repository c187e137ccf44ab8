//! Live mount table queries.

use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

/// Default location of the kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Read-only view over the mounts currently known to the kernel.
pub trait MountChecker: Send + Sync {
    /// Whether `path` is a mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Every mount point whose path matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    fn list(&self, pattern: &Regex) -> io::Result<Vec<String>>;
}

/// [`MountChecker`] that parses a `/proc/mounts` style table.
#[derive(Debug, Clone)]
pub struct ProcMountChecker {
    table: PathBuf,
}

impl Default for ProcMountChecker {
    fn default() -> Self {
        Self {
            table: PathBuf::from(PROC_MOUNTS),
        }
    }
}

impl ProcMountChecker {
    /// Checker over `/proc/mounts`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker over an arbitrary mount table file.
    #[must_use]
    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }

    fn mount_points(&self) -> io::Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.table)?;
        Ok(parse_mount_points(&content))
    }
}

impl MountChecker for ProcMountChecker {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        let wanted = path.to_string_lossy();
        Ok(self.mount_points()?.iter().any(|m| *m == wanted))
    }

    fn list(&self, pattern: &Regex) -> io::Result<Vec<String>> {
        Ok(self
            .mount_points()?
            .into_iter()
            .filter(|m| pattern.is_match(m))
            .collect())
    }
}

/// Extract the mount point column from each line of a mount table.
fn parse_mount_points(table: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(1))
        .map(ToString::to_string)
        .collect()
}
