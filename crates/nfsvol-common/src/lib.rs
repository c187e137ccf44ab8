//! # nfsvol-common
//!
//! Shared types for the nfsvol volume driver:
//! - Safe and opaque error types
//! - Standard mount root and state file paths
//! - The declarative mount option mask

#![warn(missing_docs)]

pub mod error;
pub mod mask;
pub mod paths;

pub use error::{DriverError, DriverResult, SafeError};
pub use mask::{MaskError, MountOptionMask, MountOpts, OptionValidator, RawOptions};
pub use paths::DriverPaths;
