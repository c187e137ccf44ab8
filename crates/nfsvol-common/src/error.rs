//! Common error types for nfsvol.
//!
//! Two classes of error flow through the driver. A [`SafeError`] is built
//! deliberately from text that never carries host paths, credentials or
//! upstream diagnostics, and may be echoed verbatim to a remote caller.
//! Everything else is opaque: logged locally with full detail and surfaced
//! as-is only when the call site has nothing better to offer.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`DriverError`].
pub type DriverResult<T> = Result<T, DriverError>;

/// An error whose description is safe to show to a remote caller.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{safe_description}")]
#[diagnostic(code(nfsvol::safe))]
pub struct SafeError {
    /// The caller-facing description.
    #[serde(rename = "SafeDescription")]
    pub safe_description: String,
}

impl SafeError {
    /// Create a safe error from a caller-facing description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            safe_description: description.into(),
        }
    }

    /// Serialize to the structured `{"SafeDescription": ...}` payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> DriverResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Errors raised by the volume driver and its collaborators.
#[derive(Error, Diagnostic, Debug)]
pub enum DriverError {
    /// A deliberately constructed, caller-safe error.
    #[error("{0}")]
    #[diagnostic(code(nfsvol::safe))]
    Safe(#[from] SafeError),

    /// Request did not name a volume.
    #[error("Missing mandatory 'volume_name'")]
    #[diagnostic(code(nfsvol::volume::missing_name))]
    MissingVolumeName,

    /// Create request without a `source` option.
    #[error("Missing mandatory 'source' field in 'Opts'")]
    #[diagnostic(
        code(nfsvol::volume::missing_source),
        help("Pass the NFS share as the 'source' option, e.g. server:/export")
    )]
    MissingSource,

    /// Volume is not known to the driver.
    #[error("Volume '{name}' not found")]
    #[diagnostic(code(nfsvol::volume::not_found))]
    VolumeNotFound {
        /// The volume name.
        name: String,
    },

    /// Mount requested for a volume that was never created.
    #[error("Volume '{name}' must be created before being mounted")]
    #[diagnostic(code(nfsvol::volume::not_created))]
    VolumeNotCreated {
        /// The volume name.
        name: String,
    },

    /// Volume has no mount point assigned yet.
    #[error("Volume not previously mounted")]
    #[diagnostic(code(nfsvol::volume::not_mounted))]
    NotMounted,

    /// The mount point is missing from the live mount table.
    #[error("Volume {name} does not exist (path: {path}){}", removal_suffix(.removed))]
    #[diagnostic(code(nfsvol::volume::mountpoint_missing))]
    MountpointMissing {
        /// The volume name.
        name: String,
        /// The expected mount point.
        path: String,
        /// Whether the stale directory was cleaned up.
        removed: bool,
    },

    /// Writing the state file failed.
    #[error("persist state failed when {operation}: {message}")]
    #[diagnostic(code(nfsvol::state::persist))]
    PersistState {
        /// The operation that triggered the write.
        operation: &'static str,
        /// The underlying failure.
        message: String,
    },

    /// The first mount of a volume failed.
    ///
    /// The payload is the serialized [`SafeError`] when one was available,
    /// otherwise the raw error text.
    #[error("{payload}")]
    #[diagnostic(code(nfsvol::mount::failed))]
    MountFailed {
        /// The caller-facing payload.
        payload: String,
    },

    /// Re-mounting a stale volume failed.
    #[error("Error remounting volume: {message}")]
    #[diagnostic(code(nfsvol::mount::remount))]
    Remount {
        /// The underlying failure.
        message: String,
    },

    /// Unmounting a volume failed.
    #[error("Error unmounting volume: {message}")]
    #[diagnostic(code(nfsvol::unmount::failed))]
    Unmount {
        /// The underlying failure.
        message: String,
    },

    /// The mount point directory could not be removed after unmount.
    #[error("Error removing mountpoint: {message}")]
    #[diagnostic(code(nfsvol::unmount::remove))]
    RemoveMountpoint {
        /// The underlying failure.
        message: String,
    },

    /// Opaque directory-service failure (service bind or search).
    #[error("{message}")]
    #[diagnostic(code(nfsvol::directory))]
    Directory {
        /// The upstream message.
        message: String,
    },

    /// Evacuate was called before the server process was registered.
    #[error("unexpected error: server process not found")]
    #[diagnostic(code(nfsvol::admin::server_not_found))]
    ServerNotFound,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(nfsvol::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(nfsvol::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(nfsvol::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl DriverError {
    /// Shorthand for a [`DriverError::Safe`].
    pub fn safe(description: impl Into<String>) -> Self {
        Self::Safe(SafeError::new(description))
    }

    /// Whether this error may be echoed verbatim to a remote caller.
    #[must_use]
    pub const fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    /// The inner [`SafeError`], if this is one.
    #[must_use]
    pub const fn as_safe(&self) -> Option<&SafeError> {
        match self {
            Self::Safe(err) => Some(err),
            _ => None,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn removal_suffix(removed: &bool) -> &'static str {
    if *removed {
        ""
    } else {
        " and unable to remove mount directory"
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
