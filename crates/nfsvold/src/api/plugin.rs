//! Docker volume plugin protocol.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use nfsvol::VolumeDriver;
use nfsvol_common::RawOptions;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower_http::trace::TraceLayer;

use super::{ErrorResponse, request_scope};

/// Request carrying a volume name.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRequest {
    /// Volume name.
    #[serde(default)]
    pub name: String,
}

/// Create request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    /// Volume name.
    #[serde(default)]
    pub name: String,
    /// Driver options; may be null.
    #[serde(default)]
    pub opts: Option<RawOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MountpointResponse {
    mountpoint: String,
    err: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeEntry {
    name: String,
    mountpoint: String,
    status: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<VolumeEntry>,
    err: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListResponse {
    volumes: Vec<VolumeEntry>,
    err: String,
}

/// Router serving the plugin endpoints for `driver`.
pub fn router(driver: Arc<VolumeDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .layer(TraceLayer::new_for_http())
        .with_state(driver)
}

async fn activate(State(driver): State<Arc<VolumeDriver>>) -> Json<Value> {
    Json(json!({ "Implements": driver.activate() }))
}

async fn capabilities(State(driver): State<Arc<VolumeDriver>>) -> Json<Value> {
    Json(json!({ "Capabilities": { "Scope": driver.capabilities() } }))
}

async fn create(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<CreateRequest>,
) -> Json<ErrorResponse> {
    let result = driver.create(&req.name, req.opts.unwrap_or_default());
    Json(ErrorResponse::from_result(&result))
}

async fn remove(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<NameRequest>,
) -> Json<ErrorResponse> {
    let (ctx, _guard) = request_scope();
    let result = driver.remove(&ctx, &req.name).await;
    Json(ErrorResponse::from_result(&result))
}

async fn mount(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<NameRequest>,
) -> Json<MountpointResponse> {
    let (ctx, _guard) = request_scope();
    let response = match driver.mount(&ctx, &req.name).await {
        Ok(mountpoint) => MountpointResponse {
            mountpoint,
            err: String::new(),
        },
        Err(e) => MountpointResponse {
            mountpoint: String::new(),
            err: e.to_string(),
        },
    };
    Json(response)
}

async fn unmount(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<NameRequest>,
) -> Json<ErrorResponse> {
    let (ctx, _guard) = request_scope();
    let result = driver.unmount(&ctx, &req.name).await;
    Json(ErrorResponse::from_result(&result))
}

async fn path(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<NameRequest>,
) -> Json<MountpointResponse> {
    let response = match driver.path(&req.name) {
        Ok(mountpoint) => MountpointResponse {
            mountpoint,
            err: String::new(),
        },
        Err(e) => MountpointResponse {
            mountpoint: String::new(),
            err: e.to_string(),
        },
    };
    Json(response)
}

async fn get(
    State(driver): State<Arc<VolumeDriver>>,
    Json(req): Json<NameRequest>,
) -> Json<GetResponse> {
    let response = match driver.get(&req.name) {
        Ok(volume) => GetResponse {
            volume: Some(VolumeEntry {
                name: volume.name,
                mountpoint: volume.mountpoint,
                status: Map::new(),
            }),
            err: String::new(),
        },
        Err(e) => GetResponse {
            volume: None,
            err: e.to_string(),
        },
    };
    Json(response)
}

async fn list(State(driver): State<Arc<VolumeDriver>>) -> Json<ListResponse> {
    let volumes = driver
        .list()
        .into_iter()
        .map(|volume| VolumeEntry {
            name: volume.name,
            mountpoint: volume.mountpoint,
            status: Map::new(),
        })
        .collect();
    Json(ListResponse {
        volumes,
        err: String::new(),
    })
}
