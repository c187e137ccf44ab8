//! Thread-safe output capture.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Append-only byte buffer shared between a reader task and waiters.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes.
    pub fn append(&self, bytes: &[u8]) {
        self.inner.lock().extend_from_slice(bytes);
    }

    /// Whether the captured output contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        let buf = self.inner.lock();
        let needle = needle.as_bytes();
        needle.is_empty() || buf.windows(needle.len()).any(|w| w == needle)
    }

    /// Copy everything from `reader` into the buffer until EOF.
    pub async fn drain_from<R: AsyncRead + Unpin>(&self, mut reader: R) {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => self.append(&chunk[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "Output capture stopped");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Display for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.inner.lock()))
    }
}
