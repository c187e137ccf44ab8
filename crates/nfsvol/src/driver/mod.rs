//! The volume driver state machine.
//!
//! Every volume carries a mount reference count. Only the first mount and
//! the last unmount touch the system; the ones in between just adjust the
//! count. The table is written to disk after each change and read back at
//! startup, minus the creation options.

mod state;
mod volumes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nfsvol_common::{DriverError, DriverPaths, DriverResult, RawOptions};
use tokio_util::sync::CancellationToken;

pub use state::StateStore;
pub use volumes::{VolumeInfo, VolumeMap};

use crate::admin::Drainable;
use crate::mountchecker::{MountChecker, ProcMountChecker};
use crate::mounter::Mounter;
use crate::os::{Clock, FileSystem, OsFileSystem, SystemClock};

/// Plugin interfaces implemented by the driver.
pub const IMPLEMENTS: [&str; 1] = ["VolumeDriver"];

/// Volume scope reported to the container runtime.
pub const SCOPE: &str = "local";

/// First mounts slower than this are logged as a warning.
pub const SLOW_MOUNT_THRESHOLD: Duration = Duration::from_secs(8);

/// Reference-counted volume lifecycle on top of a [`Mounter`].
pub struct VolumeDriver {
    volumes: VolumeMap,
    paths: DriverPaths,
    state: StateStore,
    mounter: Arc<dyn Mounter>,
    fs: Arc<dyn FileSystem>,
    mount_checker: Arc<dyn MountChecker>,
    clock: Arc<dyn Clock>,
}

impl VolumeDriver {
    /// Driver over the host file system and mount table.
    ///
    /// Any state saved under the mount root is restored.
    pub fn new(paths: DriverPaths, mounter: Arc<dyn Mounter>) -> Self {
        Self::with_capabilities(
            paths,
            mounter,
            Arc::new(OsFileSystem),
            Arc::new(ProcMountChecker::new()),
            Arc::new(SystemClock),
        )
    }

    /// Driver over explicit capabilities.
    ///
    /// Any state saved under the mount root is restored.
    pub fn with_capabilities(
        paths: DriverPaths,
        mounter: Arc<dyn Mounter>,
        fs: Arc<dyn FileSystem>,
        mount_checker: Arc<dyn MountChecker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = StateStore::new(Arc::clone(&fs), paths.mount_root.clone());
        let driver = Self {
            volumes: VolumeMap::new(),
            paths,
            state,
            mounter,
            fs,
            mount_checker,
            clock,
        };
        driver.state.restore(&driver.volumes);
        driver
    }

    /// The plugin interfaces this driver implements.
    #[must_use]
    pub const fn activate(&self) -> &'static [&'static str] {
        &IMPLEMENTS
    }

    /// The volume scope.
    #[must_use]
    pub const fn capabilities(&self) -> &'static str {
        SCOPE
    }

    /// Register a volume, or replace the options of an existing one.
    ///
    /// # Errors
    ///
    /// Fails on an empty name, a missing `source` option, or when the state
    /// cannot be saved. The in-memory change is kept in the last case.
    pub fn create(&self, name: &str, opts: RawOptions) -> DriverResult<()> {
        require_name(name)?;
        tracing::info!(volume = %name, "Create start");

        if !opts.get("source").is_some_and(serde_json::Value::is_string) {
            tracing::info!(volume = %name, "Create request is missing source");
            return Err(DriverError::MissingSource);
        }

        match self.volumes.get(name) {
            Some(mut existing) => {
                existing.opts = opts;
                self.volumes.put(existing);
            }
            None => {
                tracing::info!(volume = %name, "Creating volume");
                self.volumes.put(VolumeInfo::new(name, opts));
            }
        }

        self.persist("creating")?;
        tracing::info!(volume = %name, "Create end");
        Ok(())
    }

    /// Mount a volume, returning its mount point.
    ///
    /// # Errors
    ///
    /// Fails for unknown volumes and when the state cannot be saved. A
    /// failed first mount returns the serialized safe error when there is
    /// one; a failed remount of a stale volume is reported as such.
    pub async fn mount(&self, ctx: &CancellationToken, name: &str) -> DriverResult<String> {
        require_name(name)?;
        tracing::info!(volume = %name, "Mount start");

        let mut volume = self
            .volumes
            .get(name)
            .ok_or_else(|| DriverError::VolumeNotCreated {
                name: name.to_string(),
            })?;

        let mount_path = self.mount_path(name)?;
        volume.mountpoint = mount_path.to_string_lossy().into_owned();

        let first_mount = volume.mount_count == 0;
        volume.mount_count += 1;
        tracing::info!(volume = %name, count = volume.mount_count, "Mount count incremented");

        let mountpoint = volume.mountpoint.clone();
        let opts = volume.opts.clone();
        self.volumes.put(volume);
        self.persist("mounting")?;

        if first_mount {
            let started = self.clock.now();
            let result = self.mount_volume(ctx, &opts, &mount_path).await;

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed > SLOW_MOUNT_THRESHOLD {
                tracing::warn!(
                    volume = %name,
                    seconds = elapsed.as_secs(),
                    "Mount took too long, container creation may fail"
                );
            }

            return match result {
                Ok(()) => {
                    tracing::info!(volume = %name, mountpoint = %mountpoint, "Mount end");
                    Ok(mountpoint)
                }
                Err(DriverError::Safe(safe)) => Err(DriverError::MountFailed {
                    payload: safe.to_json().unwrap_or_else(|_| safe.to_string()),
                }),
                Err(e) => Err(DriverError::MountFailed {
                    payload: e.to_string(),
                }),
            };
        }

        if !self.mounter.check(ctx, name, &mount_path).await {
            tracing::info!(volume = %name, "Volume is stale, remounting");
            self.mount_volume(ctx, &opts, &mount_path)
                .await
                .map_err(|e| {
                    tracing::error!(volume = %name, error = %e, "Remount failed");
                    DriverError::Remount {
                        message: e.to_string(),
                    }
                })?;
        }

        tracing::info!(volume = %name, mountpoint = %mountpoint, "Mount end");
        Ok(mountpoint)
    }

    /// Release one mount of a volume; the last release unmounts it.
    ///
    /// # Errors
    ///
    /// Fails for unknown or never-mounted volumes, when the final unmount
    /// fails (the count is then left unchanged), or when the state cannot be
    /// saved.
    pub async fn unmount(&self, ctx: &CancellationToken, name: &str) -> DriverResult<()> {
        require_name(name)?;
        tracing::info!(volume = %name, "Unmount start");

        let mut volume = self.volumes.get(name).ok_or_else(|| {
            tracing::error!(volume = %name, "No such volume");
            DriverError::VolumeNotFound {
                name: name.to_string(),
            }
        })?;

        if volume.mountpoint.is_empty() {
            tracing::error!(volume = %name, "Mount point not assigned");
            return Err(DriverError::NotMounted);
        }

        if volume.mount_count == 1 {
            self.unmount_volume(ctx, name, Path::new(&volume.mountpoint))
                .await?;
        }

        volume.mount_count = volume.mount_count.saturating_sub(1);
        tracing::info!(volume = %name, count = volume.mount_count, "Mount count decremented");

        if volume.mount_count == 0 {
            self.volumes.delete(name);
        } else {
            self.volumes.put(volume);
        }

        self.persist("unmounting")?;
        tracing::info!(volume = %name, "Unmount end");
        Ok(())
    }

    /// Forget a volume, unmounting it first if needed.
    ///
    /// # Errors
    ///
    /// Fails on an empty name, when the unmount fails, or when the state
    /// cannot be saved. Unknown volumes are not an error.
    pub async fn remove(&self, ctx: &CancellationToken, name: &str) -> DriverResult<()> {
        require_name(name)?;
        tracing::info!(volume = %name, "Remove start");

        let Some(volume) = self.volumes.get(name) else {
            tracing::warn!(volume = %name, "Volume not found, nothing to remove");
            return Ok(());
        };

        if !volume.mountpoint.is_empty() {
            self.unmount_volume(ctx, name, Path::new(&volume.mountpoint))
                .await?;
        }

        self.volumes.delete(name);
        self.persist("removing")?;
        tracing::info!(volume = %name, "Remove end");
        Ok(())
    }

    /// The mount point of a mounted volume.
    ///
    /// # Errors
    ///
    /// Fails for unknown or never-mounted volumes.
    pub fn path(&self, name: &str) -> DriverResult<String> {
        require_name(name)?;

        let volume = self.volumes.get(name).ok_or_else(|| {
            tracing::error!(volume = %name, "No such volume");
            DriverError::VolumeNotFound {
                name: name.to_string(),
            }
        })?;

        if volume.mountpoint.is_empty() {
            tracing::error!(volume = %name, "Mount point not assigned");
            return Err(DriverError::NotMounted);
        }

        Ok(volume.mountpoint)
    }

    /// A single volume.
    ///
    /// # Errors
    ///
    /// Fails for unknown volumes.
    pub fn get(&self, name: &str) -> DriverResult<VolumeInfo> {
        self.volumes
            .get(name)
            .ok_or_else(|| DriverError::VolumeNotFound {
                name: name.to_string(),
            })
    }

    /// Every known volume.
    #[must_use]
    pub fn list(&self) -> Vec<VolumeInfo> {
        self.volumes.values()
    }

    /// Unmount and forget every volume, then sweep orphaned mounts.
    ///
    /// Individual failures are logged; the sweep always runs.
    pub async fn drain(&self, ctx: &CancellationToken) {
        tracing::info!("Drain start");

        for name in self.volumes.keys() {
            let Some(volume) = self.volumes.get(&name) else {
                continue;
            };

            if !volume.mountpoint.is_empty() && volume.mount_count > 0 {
                if let Err(e) = self
                    .unmount_volume(ctx, &name, Path::new(&volume.mountpoint))
                    .await
                {
                    tracing::error!(
                        volume = %name,
                        mountpoint = %volume.mountpoint,
                        error = %e,
                        "Drain unmount failed"
                    );
                }
            }
            self.volumes.delete(&name);
        }

        self.mounter.purge(ctx, &self.paths.mount_root).await;

        if let Err(e) = self.persist("draining") {
            tracing::error!(error = %e, "Failed to save drained state");
        }
        tracing::info!("Drain end");
    }

    fn mount_path(&self, name: &str) -> DriverResult<PathBuf> {
        let root = self.fs.absolute(&self.paths.mount_root)?;
        self.fs.create_dir_all(&root).inspect_err(|e| {
            tracing::error!(path = %root.display(), error = %e, "Creating mount root failed");
        })?;
        Ok(root.join(name))
    }

    async fn mount_volume(
        &self,
        ctx: &CancellationToken,
        opts: &RawOptions,
        mount_path: &Path,
    ) -> DriverResult<()> {
        let Some(source) = opts.get("source").and_then(serde_json::Value::as_str) else {
            tracing::error!(path = %mount_path.display(), "Volume has no source");
            return Err(DriverError::MissingSource);
        };

        self.fs.create_dir_all(mount_path).inspect_err(|e| {
            tracing::error!(path = %mount_path.display(), error = %e, "Creating mount point failed");
        })?;

        let result = self.mounter.mount(ctx, source, mount_path, opts).await;
        if let Err(e) = &result {
            tracing::error!(source, error = %e, "Mount failed");
            if let Err(rm) = self.fs.remove(mount_path) {
                tracing::error!(path = %mount_path.display(), error = %rm, "Removing mount point failed");
            }
        }
        result
    }

    async fn unmount_volume(
        &self,
        ctx: &CancellationToken,
        name: &str,
        mount_path: &Path,
    ) -> DriverResult<()> {
        let mounted = self.mount_checker.exists(mount_path).inspect_err(|e| {
            tracing::error!(path = %mount_path.display(), error = %e, "Reading mount table failed");
        })?;

        if !mounted {
            let removed = self.fs.remove(mount_path).is_ok();
            let err = DriverError::MountpointMissing {
                name: name.to_string(),
                path: mount_path.display().to_string(),
                removed,
            };
            tracing::info!(volume = %name, error = %err, "Mount point not found");
            return Err(err);
        }

        self.mounter
            .unmount(ctx, mount_path)
            .await
            .map_err(|e| {
                tracing::error!(volume = %name, error = %e, "Unmount failed");
                DriverError::Unmount {
                    message: e.to_string(),
                }
            })?;

        self.fs.remove(mount_path).map_err(|e| {
            tracing::error!(path = %mount_path.display(), error = %e, "Removing mount point failed");
            DriverError::RemoveMountpoint {
                message: e.to_string(),
            }
        })?;

        tracing::info!(volume = %name, "Unmounted volume");
        Ok(())
    }

    fn persist(&self, operation: &'static str) -> DriverResult<()> {
        self.state.save(&self.volumes).map_err(|e| {
            tracing::error!(operation, error = %e, "Persisting state failed");
            DriverError::PersistState {
                operation,
                message: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl Drainable for VolumeDriver {
    async fn drain(&self, ctx: &CancellationToken) -> DriverResult<()> {
        Self::drain(self, ctx).await;
        Ok(())
    }
}

fn require_name(name: &str) -> DriverResult<()> {
    if name.is_empty() {
        Err(DriverError::MissingVolumeName)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{
        FakeMountChecker, FakeMounter, LogCapture, ManualClock, MemoryFileSystem,
    };

    struct Harness {
        fs: Arc<MemoryFileSystem>,
        checker: Arc<FakeMountChecker>,
        mounter: Arc<FakeMounter>,
        clock: Arc<ManualClock>,
        driver: VolumeDriver,
    }

    fn harness() -> Harness {
        let fs = Arc::new(MemoryFileSystem::default());
        harness_with(fs)
    }

    fn harness_with(fs: Arc<MemoryFileSystem>) -> Harness {
        let checker = Arc::new(FakeMountChecker::default());
        let mounter = Arc::new(FakeMounter::new(Arc::clone(&checker)));
        let clock = Arc::new(ManualClock::default());
        let driver = VolumeDriver::with_capabilities(
            DriverPaths::with_mount_root("/tmp/volumes"),
            mounter.clone(),
            fs.clone(),
            checker.clone(),
            clock.clone(),
        );
        Harness {
            fs,
            checker,
            mounter,
            clock,
            driver,
        }
    }

    fn source(share: &str) -> RawOptions {
        match json!({ "source": share }) {
            Value::Object(map) => map,
            _ => unreachable!("object literal"),
        }
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn saved_state(fs: &MemoryFileSystem) -> Value {
        serde_json::from_slice(&fs.read(Path::new("/tmp/volumes/driver-state.json")).unwrap())
            .unwrap()
    }

    #[test]
    fn activate_and_capabilities() {
        let h = harness();
        assert_eq!(h.driver.activate(), ["VolumeDriver"]);
        assert_eq!(h.driver.capabilities(), "local");
    }

    #[test]
    fn create_requires_name_and_source() {
        let h = harness();
        assert!(matches!(
            h.driver.create("", source("s:/a")),
            Err(DriverError::MissingVolumeName)
        ));
        assert!(matches!(
            h.driver.create("vol", RawOptions::new()),
            Err(DriverError::MissingSource)
        ));
    }

    #[test]
    fn create_replaces_options_and_persists() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.create("vol", source("s:/b")).unwrap();

        assert_eq!(h.driver.list().len(), 1);
        assert_eq!(
            h.driver.get("vol").unwrap().opts["source"],
            Value::from("s:/b")
        );
        assert_eq!(
            saved_state(&h.fs),
            json!({ "vol": { "Name": "vol", "Mountpoint": "", "MountCount": 0 } })
        );
    }

    #[test_log::test(tokio::test)]
    async fn mount_requires_created_volume() {
        let h = harness();
        let err = h.driver.mount(&ctx(), "nope").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Volume 'nope' must be created before being mounted"
        );
    }

    #[test_log::test(tokio::test)]
    async fn reference_counting() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();

        let path = h.driver.mount(&ctx(), "vol").await.unwrap();
        assert_eq!(path, "/tmp/volumes/vol");
        h.driver.mount(&ctx(), "vol").await.unwrap();
        assert_eq!(h.mounter.mounts(), 1);
        assert_eq!(h.mounter.checks(), 1);
        assert_eq!(h.driver.get("vol").unwrap().mount_count, 2);

        h.driver.unmount(&ctx(), "vol").await.unwrap();
        assert_eq!(h.mounter.unmounts(), 0);
        assert_eq!(h.driver.get("vol").unwrap().mount_count, 1);

        h.driver.unmount(&ctx(), "vol").await.unwrap();
        assert_eq!(h.mounter.unmounts(), 1);
        assert!(h.driver.get("vol").is_err());
        assert!(!h.fs.contains(Path::new("/tmp/volumes/vol")));
        assert_eq!(saved_state(&h.fs), json!({}));
    }

    #[test_log::test(tokio::test)]
    async fn stale_mount_is_remounted() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();

        h.mounter.set_live(false);
        h.driver.mount(&ctx(), "vol").await.unwrap();
        assert_eq!(h.mounter.mounts(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn failed_remount_is_reported() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();

        h.mounter.set_live(false);
        h.mounter.fail_mounts(DriverError::safe("exit status 32"));
        let err = h.driver.mount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(err.to_string(), "Error remounting volume: exit status 32");
    }

    #[test_log::test(tokio::test)]
    async fn safe_mount_failures_are_serialized() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.mounter
            .fail_mounts(DriverError::safe("user lacks read access to share"));

        let err = h.driver.mount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"{"SafeDescription":"user lacks read access to share"}"#
        );
        assert!(!h.fs.contains(Path::new("/tmp/volumes/vol")));
        assert_eq!(h.driver.get("vol").unwrap().mount_count, 1);
    }

    #[test_log::test(tokio::test)]
    async fn opaque_mount_failures_are_raw() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.mounter.fail_mounts(DriverError::Directory {
            message: "bind failed".into(),
        });

        let err = h.driver.mount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(err.to_string(), "bind failed");
    }

    #[tokio::test]
    async fn slow_mount_still_succeeds() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.mounter.advance_on_mount(h.clock.clone(), Duration::from_secs(9));

        assert!(h.driver.mount(&ctx(), "vol").await.is_ok());
        let output = logs.contents();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("Mount took too long"), "{output}");
    }

    #[tokio::test]
    async fn quick_mount_is_not_flagged() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.mounter.advance_on_mount(h.clock.clone(), Duration::from_secs(8));

        assert!(h.driver.mount(&ctx(), "vol").await.is_ok());
        assert!(!logs.contents().contains("Mount took too long"));
    }

    #[test_log::test(tokio::test)]
    async fn unmount_errors() {
        let h = harness();
        let err = h.driver.unmount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(err.to_string(), "Volume 'vol' not found");

        h.driver.create("vol", source("s:/a")).unwrap();
        let err = h.driver.unmount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(err.to_string(), "Volume not previously mounted");
    }

    #[test_log::test(tokio::test)]
    async fn failed_unmount_keeps_volume() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();
        h.mounter.fail_unmounts(DriverError::safe("exit status 16"));

        let err = h.driver.unmount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(err.to_string(), "Error unmounting volume: exit status 16");
        assert_eq!(h.driver.get("vol").unwrap().mount_count, 1);
    }

    #[test_log::test(tokio::test)]
    async fn missing_mount_table_entry() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();
        h.checker.remove("/tmp/volumes/vol");

        let err = h.driver.unmount(&ctx(), "vol").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Volume vol does not exist (path: /tmp/volumes/vol)"
        );
        assert_eq!(h.mounter.unmounts(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn remove_unmounts_then_forgets() {
        let h = harness();
        h.driver.remove(&ctx(), "ghost").await.unwrap();

        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();
        h.driver.remove(&ctx(), "vol").await.unwrap();

        assert_eq!(h.mounter.unmounts(), 1);
        assert!(h.driver.list().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn path_lookup() {
        let h = harness();
        assert_eq!(
            h.driver.path("vol").unwrap_err().to_string(),
            "Volume 'vol' not found"
        );
        h.driver.create("vol", source("s:/a")).unwrap();
        assert!(matches!(h.driver.path("vol"), Err(DriverError::NotMounted)));

        h.driver.mount(&ctx(), "vol").await.unwrap();
        assert_eq!(h.driver.path("vol").unwrap(), "/tmp/volumes/vol");
    }

    #[test_log::test(tokio::test)]
    async fn drain_unmounts_everything_and_purges() {
        let h = harness();
        for name in ["a", "b", "c"] {
            h.driver.create(name, source("s:/x")).unwrap();
        }
        h.driver.mount(&ctx(), "a").await.unwrap();
        h.driver.mount(&ctx(), "b").await.unwrap();
        h.mounter.fail_unmounts(DriverError::safe("busy"));

        h.driver.drain(&ctx()).await;

        assert!(h.driver.list().is_empty());
        assert_eq!(h.mounter.unmounts(), 2);
        assert_eq!(h.mounter.purged(), vec![PathBuf::from("/tmp/volumes")]);
        assert_eq!(saved_state(&h.fs), json!({}));
    }

    #[test_log::test(tokio::test)]
    async fn state_survives_restart() {
        let h = harness();
        h.driver.create("vol", source("s:/a")).unwrap();
        h.driver.mount(&ctx(), "vol").await.unwrap();

        let restarted = harness_with(h.fs.clone());
        let vol = restarted.driver.get("vol").unwrap();
        assert_eq!(vol.mount_count, 1);
        assert_eq!(vol.mountpoint, "/tmp/volumes/vol");
        assert!(vol.opts.is_empty());
    }
}
