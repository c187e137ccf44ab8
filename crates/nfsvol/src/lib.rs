//! # nfsvol
//!
//! Volume driver that mounts NFS shares for a container runtime, optionally
//! presenting them under a different uid/gid through the mapfs helper.
//!
//! ## Components
//!
//! - **Invoker**: runs commands in their own process group, with output
//!   markers, deadlines and cancellation
//! - **Resolver**: LDAP username/password to uid/gid lookup
//! - **Mounter**: kernel mount, helper supervision and teardown
//! - **Driver**: reference-counted volume lifecycle with on-disk state
//! - **Admin**: ping and graceful evacuation
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nfsvol::driver::VolumeDriver;
//! use nfsvol::invoker::ProcessGroupInvoker;
//! use nfsvol::mountchecker::ProcMountChecker;
//! use nfsvol::mounter::{MapfsConfig, MapfsMounter, default_mask};
//! use nfsvol::os::OsFileSystem;
//! use nfsvol_common::DriverPaths;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> nfsvol_common::DriverResult<()> {
//! let mounter = MapfsMounter::new(
//!     Arc::new(ProcessGroupInvoker::new()),
//!     Arc::new(OsFileSystem),
//!     Arc::new(ProcMountChecker::new()),
//!     default_mask()?,
//!     MapfsConfig::new(),
//! );
//! let driver = VolumeDriver::new(DriverPaths::new(), Arc::new(mounter));
//!
//! let opts = serde_json::json!({ "source": "server:/export", "uid": "2000", "gid": "2000" });
//! driver.create("data", opts.as_object().cloned().unwrap_or_default())?;
//! let mountpoint = driver.mount(&CancellationToken::new(), "data").await?;
//! # let _ = mountpoint;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod driver;
pub mod invoker;
pub mod mountchecker;
pub mod mounter;
pub mod os;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use admin::{Drainable, DriverAdmin, ServerProcess};
pub use driver::{VolumeDriver, VolumeInfo};
pub use invoker::{InvokeError, InvokeResult, Invoker, ProcessGroupInvoker};
pub use mounter::{MapfsConfig, MapfsMounter, Mounter};
pub use resolver::{IdResolver, Identity, LdapConfig, LdapIdResolver};
