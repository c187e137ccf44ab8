//! Volume table persistence.

use std::path::PathBuf;
use std::sync::Arc;

use nfsvol_common::DriverResult;
use nfsvol_common::paths::STATE_FILE_NAME;

use super::volumes::VolumeMap;
use crate::os::FileSystem;

/// Saves and restores the volume table under the mount root.
pub struct StateStore {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl StateStore {
    /// Store rooted at `root`.
    pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    /// Write the whole table.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or the file written.
    pub fn save(&self, volumes: &VolumeMap) -> DriverResult<()> {
        let root = self.fs.absolute(&self.root)?;
        self.fs.create_dir_all(&root)?;

        let path = root.join(STATE_FILE_NAME);
        let data = volumes.to_json()?;
        self.fs.write(&path, &data).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to write state file");
        })?;

        tracing::debug!(path = %path.display(), volumes = volumes.len(), "Saved driver state");
        Ok(())
    }

    /// Load the table saved by [`StateStore::save`].
    ///
    /// A missing or unreadable file leaves `volumes` as it was.
    pub fn restore(&self, volumes: &VolumeMap) {
        let path = self.state_path();

        let data = match self.fs.read(&path) {
            Ok(data) => data,
            Err(e) => {
                tracing::info!(path = %path.display(), error = %e, "No driver state restored");
                return;
            }
        };

        match volumes.restore(&data) {
            Ok(()) => {
                tracing::info!(path = %path.display(), volumes = volumes.len(), "Restored driver state");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to parse driver state");
            }
        }
    }
}
