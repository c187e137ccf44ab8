//! The shared volume table.

use std::collections::BTreeMap;

use nfsvol_common::{DriverResult, RawOptions};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A named volume and its mount reference count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Absolute mount point, empty until first mounted.
    #[serde(default)]
    pub mountpoint: String,
    /// Number of outstanding mounts.
    #[serde(default)]
    pub mount_count: u32,
    /// Options given at creation. Never persisted.
    #[serde(skip)]
    pub opts: RawOptions,
}

impl VolumeInfo {
    /// A freshly created, unmounted volume.
    pub fn new(name: impl Into<String>, opts: RawOptions) -> Self {
        Self {
            name: name.into(),
            opts,
            ..Self::default()
        }
    }
}

/// Volume table guarded by a single read/write lock.
///
/// Each call takes the lock for its own duration only; callers never hold
/// it across a mount or unmount.
#[derive(Debug, Default)]
pub struct VolumeMap {
    inner: RwLock<BTreeMap<String, VolumeInfo>>,
}

impl VolumeMap {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the named volume.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<VolumeInfo> {
        self.inner.read().get(name).cloned()
    }

    /// Insert or replace a volume under its own name.
    pub fn put(&self, volume: VolumeInfo) {
        self.inner.write().insert(volume.name.clone(), volume);
    }

    /// Remove a volume.
    pub fn delete(&self, name: &str) -> Option<VolumeInfo> {
        self.inner.write().remove(name)
    }

    /// Names of every volume.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Copies of every volume.
    #[must_use]
    pub fn values(&self) -> Vec<VolumeInfo> {
        self.inner.read().values().cloned().collect()
    }

    /// Number of volumes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Serialize the table, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> DriverResult<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.inner.read())?)
    }

    /// Replace the table with a serialized snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a valid snapshot; the table is left
    /// untouched.
    pub fn restore(&self, data: &[u8]) -> DriverResult<()> {
        let restored: BTreeMap<String, VolumeInfo> = serde_json::from_slice(data)?;
        *self.inner.write() = restored;
        Ok(())
    }
}
