//! Process administration endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use nfsvol::DriverAdmin;
use tower_http::trace::TraceLayer;

use super::{ErrorResponse, request_scope};

/// Router serving `/evacuate` and `/ping` for `admin`.
pub fn router(admin: Arc<DriverAdmin>) -> Router {
    Router::new()
        .route("/evacuate", get(evacuate))
        .route("/ping", get(ping))
        .layer(TraceLayer::new_for_http())
        .with_state(admin)
}

async fn evacuate(State(admin): State<Arc<DriverAdmin>>) -> (StatusCode, Json<ErrorResponse>) {
    let (ctx, _guard) = request_scope();
    respond("evacuate", ErrorResponse::from_result(&admin.evacuate(&ctx).await))
}

async fn ping(State(admin): State<Arc<DriverAdmin>>) -> (StatusCode, Json<ErrorResponse>) {
    respond("ping", ErrorResponse::from_result(&admin.ping()))
}

fn respond(operation: &str, response: ErrorResponse) -> (StatusCode, Json<ErrorResponse>) {
    if response.err.is_empty() {
        (StatusCode::OK, Json(response))
    } else {
        tracing::error!(operation, error = %response.err, "Admin request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(response))
    }
}
