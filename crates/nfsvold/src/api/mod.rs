//! HTTP transports for the plugin and admin surfaces.

pub mod admin;
pub mod plugin;

use serde::Serialize;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Bare `{"Err": ...}` response.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    /// Empty on success.
    pub err: String,
}

impl ErrorResponse {
    fn from_result<T, E: std::fmt::Display>(result: &Result<T, E>) -> Self {
        Self {
            err: result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

/// Token scoped to one request; cancelled when the handler returns or is
/// dropped.
fn request_scope() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}
