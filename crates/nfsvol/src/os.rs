//! Narrow capability traits over the operating system.
//!
//! The driver and the mounter never touch `std::fs` or the clock directly;
//! they go through these traits so that state transitions can be exercised
//! against in-memory fakes.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rustix::fs::Mode;

/// Ownership and permission bits of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
}

/// Filesystem operations used by the driver.
pub trait FileSystem: Send + Sync {
    /// Create a directory and its parents, world-accessible.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Remove a file or an empty directory.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Whether the path exists.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Ownership and permission bits of a path.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace a file's contents.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Resolve a path against the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be read.
    fn absolute(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// The umask is process-wide; every change to it goes through this lock.
static UMASK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Clears the process umask until dropped.
struct UmaskGuard {
    previous: Mode,
    _lock: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    fn clear() -> Self {
        let lock = UMASK_LOCK.lock();
        let previous = rustix::process::umask(Mode::empty());
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        rustix::process::umask(self.previous);
    }
}

/// [`FileSystem`] backed by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let _umask = UmaskGuard::clear();
        fs::DirBuilder::new().recursive(true).mode(0o777).create(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let _umask = UmaskGuard::clear();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)?;
        file.write_all(contents)
    }

    fn absolute(&self, path: &Path) -> io::Result<PathBuf> {
        std::path::absolute(path)
    }
}
