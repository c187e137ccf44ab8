//! Mount orchestration.
//!
//! A [`Mounter`] performs the actual work behind a volume mount: the kernel
//! NFS mount, the uid/gid remapping helper, and the matching teardown.

mod mapfs;
pub mod options;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nfsvol_common::{DriverResult, MountOptionMask, RawOptions};
use tokio_util::sync::CancellationToken;

pub use mapfs::MapfsMounter;

/// Kernel mount options applied to every share.
pub const DEFAULT_KERNEL_OPTIONS: &str =
    "rsize=1048576,wsize=1048576,hard,timeo=600,retrans=2,actimeo=0";

/// Default location of the remapping helper binary.
pub const DEFAULT_MAPFS_PATH: &str = "/var/vcap/packages/mapfs/bin/mapfs";

/// Text the helper prints once its mount is live.
pub const MAPFS_READY_MARKER: &str = "Mounted!";

/// Options a caller may set on a mapfs backed volume.
pub const MAPFS_ALLOWED_OPTIONS: [&str; 11] = [
    "auto_cache",
    "mount",
    "source",
    "experimental",
    "uid",
    "gid",
    "username",
    "password",
    "readonly",
    "version",
    "cache",
];

/// Performs mounts and unmounts of a single share.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `share` onto `target`.
    ///
    /// # Errors
    ///
    /// Validation and execution failures are safe errors; identity
    /// resolution failures are propagated unchanged.
    async fn mount(
        &self,
        ctx: &CancellationToken,
        share: &str,
        target: &Path,
        opts: &RawOptions,
    ) -> DriverResult<()>;

    /// Unmount `target` and its intermediate mount.
    ///
    /// # Errors
    ///
    /// Returns a safe error if `target` cannot be unmounted or the
    /// intermediate directory cannot be removed.
    async fn unmount(&self, ctx: &CancellationToken, target: &Path) -> DriverResult<()>;

    /// Whether `mountpoint` is still a live mount.
    async fn check(&self, ctx: &CancellationToken, name: &str, mountpoint: &Path) -> bool;

    /// Kill every helper and tear down every intermediate mount under `root`.
    async fn purge(&self, ctx: &CancellationToken, root: &Path);
}

/// Settings for [`MapfsMounter`].
#[derive(Debug, Clone)]
pub struct MapfsConfig {
    /// Kernel file system type.
    pub fstype: String,
    /// Base kernel mount options.
    pub default_options: String,
    /// Path of the remapping helper.
    pub mapfs_path: String,
    /// How long the helper may take to report readiness.
    pub mount_timeout: Duration,
    /// Deadline for the liveness check.
    pub check_timeout: Duration,
    /// Pause between purge checks for lingering helpers.
    pub purge_poll_interval: Duration,
    /// Maximum number of purge checks.
    pub purge_poll_attempts: u32,
}

impl Default for MapfsConfig {
    fn default() -> Self {
        Self {
            fstype: "nfs".to_string(),
            default_options: DEFAULT_KERNEL_OPTIONS.to_string(),
            mapfs_path: DEFAULT_MAPFS_PATH.to_string(),
            mount_timeout: Duration::from_secs(5 * 60),
            check_timeout: Duration::from_secs(5),
            purge_poll_interval: Duration::from_millis(100),
            purge_poll_attempts: 30,
        }
    }
}

impl MapfsConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remapping helper path.
    #[must_use]
    pub fn with_mapfs_path(mut self, path: impl Into<String>) -> Self {
        self.mapfs_path = path.into();
        self
    }

    /// Set the kernel file system type.
    #[must_use]
    pub fn with_fstype(mut self, fstype: impl Into<String>) -> Self {
        self.fstype = fstype.into();
        self
    }

    /// Set the base kernel mount options.
    #[must_use]
    pub fn with_default_options(mut self, options: impl Into<String>) -> Self {
        self.default_options = options.into();
        self
    }

    /// Set the helper readiness timeout.
    #[must_use]
    pub const fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Set the liveness check deadline.
    #[must_use]
    pub const fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Set the purge polling schedule.
    #[must_use]
    pub const fn with_purge_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.purge_poll_interval = interval;
        self.purge_poll_attempts = attempts;
        self
    }
}

/// The option mask applied to mapfs mounts.
///
/// # Errors
///
/// Fails only if the built-in defaults are malformed.
pub fn default_mask() -> DriverResult<MountOptionMask> {
    let mut defaults = RawOptions::new();
    defaults.insert("auto_cache".to_string(), "true".into());

    MountOptionMask::new(
        MAPFS_ALLOWED_OPTIONS,
        &defaults,
        Vec::<(&str, &str)>::new(),
        Vec::<&str>::new(),
        Vec::<&str>::new(),
    )
}
