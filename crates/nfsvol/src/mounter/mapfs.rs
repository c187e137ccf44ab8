//! NFS kernel mount fronted by the mapfs uid/gid remapping helper.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nfsvol_common::paths::{INTERMEDIATE_SUFFIX, intermediate_mount, real_mountpoint};
use nfsvol_common::{DriverError, DriverResult, MountOptionMask, MountOpts, RawOptions};
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::options::{
    INVALID_GID, INVALID_UID, helper_args, kernel_options, lacks_read_access, normalize_share,
    positive_id, redacted,
};
use super::{MAPFS_READY_MARKER, MapfsConfig, Mounter};
use crate::invoker::{InvokeError, Invoker, args};
use crate::mountchecker::MountChecker;
use crate::os::FileSystem;
use crate::resolver::IdResolver;

/// [`Mounter`] that mounts NFS shares and optionally remaps ownership.
///
/// Without a `uid` the share is mounted straight onto the target. With one,
/// the share is mounted on `<target>_mapfs` and the helper re-exports it on
/// the target as the requested uid/gid.
pub struct MapfsMounter {
    invoker: Arc<dyn Invoker>,
    fs: Arc<dyn FileSystem>,
    mount_checker: Arc<dyn MountChecker>,
    resolver: Option<Arc<dyn IdResolver>>,
    mask: MountOptionMask,
    config: MapfsConfig,
}

impl MapfsMounter {
    /// Create a mounter without identity resolution.
    pub fn new(
        invoker: Arc<dyn Invoker>,
        fs: Arc<dyn FileSystem>,
        mount_checker: Arc<dyn MountChecker>,
        mask: MountOptionMask,
        config: MapfsConfig,
    ) -> Self {
        Self {
            invoker,
            fs,
            mount_checker,
            resolver: None,
            mask,
            config,
        }
    }

    /// Resolve `username`/`password` options through `resolver`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn IdResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        program: &str,
        argv: &[&str],
    ) -> Result<(), InvokeError> {
        let result = self.invoker.invoke(ctx, program, &args(argv), &[]);
        let outcome = result.wait().await;
        if let Err(e) = &outcome {
            tracing::debug!(program, error = %e, stderr = %result.stderr(), "Command failed");
        }
        outcome
    }

    /// Merge a resolved identity into `opts` when a username is given.
    async fn resolve_identity(
        &self,
        ctx: &CancellationToken,
        opts: &mut RawOptions,
    ) -> DriverResult<()> {
        let Some(username) = opts.get("username") else {
            return Ok(());
        };

        if opts.contains_key("uid") || opts.contains_key("gid") {
            return Err(DriverError::safe("Not allowed options"));
        }

        let Some(resolver) = &self.resolver else {
            return Err(DriverError::safe(
                "LDAP username is specified but LDAP is not configured",
            ));
        };

        let Some(password) = opts.get("password") else {
            return Err(DriverError::safe(
                "LDAP username is specified but LDAP password is missing",
            ));
        };

        let identity = resolver
            .resolve(ctx, &option_text(username), &option_text(password))
            .await?;

        opts.insert("uid".to_string(), Value::String(identity.uid));
        opts.insert("gid".to_string(), Value::String(identity.gid));
        Ok(())
    }

    /// Best-effort teardown of an intermediate mount after a failed step.
    async fn unwind_intermediate(&self, ctx: &CancellationToken, intermediate: &Path) {
        let dir = intermediate.to_string_lossy();
        if let Err(e) = self.run(ctx, "umount", &[&*dir]).await {
            tracing::error!(path = %dir, error = %e, "Intermediate unmount failed");
            return;
        }
        if let Err(e) = self.fs.remove(intermediate) {
            tracing::error!(path = %dir, error = %e, "Intermediate remove failed");
        }
    }
}

#[async_trait]
impl Mounter for MapfsMounter {
    async fn mount(
        &self,
        ctx: &CancellationToken,
        share: &str,
        target: &Path,
        opts: &RawOptions,
    ) -> DriverResult<()> {
        tracing::info!(share, target = %target.display(), "Mount start");

        let mut opts = opts.clone();
        self.resolve_identity(ctx, &mut opts).await?;

        match (opts.contains_key("uid"), opts.contains_key("gid")) {
            (true, false) => return Err(DriverError::safe("required 'gid' option is missing")),
            (false, true) => return Err(DriverError::safe("required 'uid' option is missing")),
            _ => {}
        }

        let canonical: MountOpts = self.mask.apply(&opts).map_err(|e| {
            tracing::debug!(share, options = ?redacted(&opts), "Mount options rejected");
            DriverError::safe(e.to_string())
        })?;

        let share = normalize_share(share)?;
        let mount_options = kernel_options(&self.config.default_options, &canonical)?;

        let remap = match (canonical.get("uid"), canonical.get("gid")) {
            (Some(uid), Some(gid)) => Some((
                positive_id(uid, INVALID_UID)?,
                positive_id(gid, INVALID_GID)?,
            )),
            _ => None,
        };

        let intermediate = intermediate_mount(target);
        let target = PathBuf::from(real_mountpoint(&intermediate.to_string_lossy()));

        self.fs.create_dir_all(&intermediate).map_err(|e| {
            tracing::error!(path = %intermediate.display(), error = %e, "Creating intermediate directory failed");
            DriverError::safe(e.to_string())
        })?;

        let kernel_target = if remap.is_some() { &intermediate } else { &target };
        let kernel_target_str = kernel_target.to_string_lossy();
        let kernel_mount = [
            "-t",
            self.config.fstype.as_str(),
            "-o",
            mount_options.as_str(),
            share.as_str(),
            &*kernel_target_str,
        ];
        if let Err(e) = self.run(ctx, "mount", &kernel_mount).await {
            tracing::error!(share = %share, error = %e, "Kernel mount failed");
            if let Err(rm) = self.fs.remove(&intermediate) {
                tracing::error!(path = %intermediate.display(), error = %rm, "Removing intermediate directory failed");
            }
            return Err(DriverError::safe(e.to_string()));
        }

        let Some((uid, gid)) = remap else {
            tracing::info!(target = %target.display(), "Mounted without remapping");
            return Ok(());
        };

        match self.fs.stat(&intermediate) {
            Err(e) => {
                tracing::warn!(path = %intermediate.display(), error = %e, "Unable to stat new mount, skipping access check");
            }
            Ok(stat) if lacks_read_access(&stat, uid, gid) => {
                tracing::error!(uid, gid, ?stat, "Mapped user lacks read access to share");
                self.unwind_intermediate(ctx, &intermediate).await;
                return Err(DriverError::safe("user lacks read access to share"));
            }
            Ok(_) => {}
        }

        let mut helper = helper_args(uid, gid, &canonical);
        helper.push(target.to_string_lossy().into_owned());
        helper.push(intermediate.to_string_lossy().into_owned());

        let result = self
            .invoker
            .invoke(ctx, &self.config.mapfs_path, &helper, &[]);
        if let Err(e) = result
            .wait_for(MAPFS_READY_MARKER, self.config.mount_timeout)
            .await
        {
            tracing::error!(error = %e, stderr = %result.stderr(), "Remapping helper failed");
            self.unwind_intermediate(ctx, &intermediate).await;
            return Err(DriverError::safe(e.to_string()));
        }

        tracing::info!(target = %target.display(), uid, gid, "Mounted with remapping");
        Ok(())
    }

    async fn unmount(&self, ctx: &CancellationToken, target: &Path) -> DriverResult<()> {
        let intermediate = intermediate_mount(target);
        let target = real_mountpoint(&intermediate.to_string_lossy()).to_string();
        tracing::info!(%target, "Unmount start");

        self.run(ctx, "umount", &["-l", target.as_str()])
            .await
            .map_err(|e| DriverError::safe(e.to_string()))?;

        match self.mount_checker.exists(&intermediate) {
            Ok(true) => {
                let dir = intermediate.to_string_lossy();
                if let Err(e) = self.run(ctx, "umount", &["-l", &*dir]).await {
                    tracing::error!(path = %dir, error = %e, "Intermediate unmount failed");
                    return Ok(());
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "Checking intermediate mount failed");
            }
        }

        if self.fs.exists(&intermediate).unwrap_or(false) {
            self.fs
                .remove(&intermediate)
                .map_err(|e| DriverError::safe(e.to_string()))?;
        }

        tracing::info!(%target, "Unmount end");
        Ok(())
    }

    async fn check(&self, ctx: &CancellationToken, name: &str, mountpoint: &Path) -> bool {
        let deadline = ctx.child_token();
        let point = mountpoint.to_string_lossy();
        let result = self
            .invoker
            .invoke(&deadline, "mountpoint", &args(&["-q", &*point]), &[]);

        let outcome = tokio::time::timeout(self.config.check_timeout, result.wait()).await;
        deadline.cancel();

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::info!(volume = name, error = %e, "Unable to verify volume");
                false
            }
            Err(_) => {
                tracing::info!(volume = name, "Timed out verifying volume");
                false
            }
        }
    }

    async fn purge(&self, ctx: &CancellationToken, root: &Path) {
        tracing::info!(root = %root.display(), "Purge start");

        let pkill = self.invoker.invoke(ctx, "pkill", &args(&["mapfs"]), &[]);
        if let Err(e) = pkill.wait().await {
            tracing::info!(error = %e, output = %pkill.stdout(), "pkill mapfs");
        }

        for _ in 0..self.config.purge_poll_attempts {
            tracing::debug!("Waiting for mapfs to exit");
            tokio::time::sleep(self.config.purge_poll_interval).await;
            let pgrep = self.invoker.invoke(ctx, "pgrep", &args(&["mapfs"]), &[]);
            if let Err(e) = pgrep.wait().await {
                tracing::debug!(error = %e, "No mapfs processes left");
                break;
            }
        }

        let pattern = match Regex::new(&format!(
            "^{}.*{INTERMEDIATE_SUFFIX}$",
            root.to_string_lossy()
        )) {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Unable to list mounts");
                return;
            }
        };

        let mounts = match self.mount_checker.list(&pattern) {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "Reading mount table failed");
                return;
            }
        };
        tracing::info!(?mounts, "Purging intermediate mounts");

        for intermediate in &mounts {
            let real = real_mountpoint(intermediate);
            for dir in [real, intermediate.as_str()] {
                if let Err(e) = self.run(ctx, "umount", &["-l", "-f", dir]).await {
                    tracing::error!(path = dir, error = %e, "Purge unmount failed");
                }
                if let Err(e) = self.fs.remove(Path::new(dir)) {
                    tracing::error!(path = dir, error = %e, "Purge cannot remove directory");
                }
            }
        }

        tracing::info!(root = %root.display(), "Purge end");
    }
}

fn option_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
