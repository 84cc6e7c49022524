//! REST handlers under `/api`.
//!
//! Every handler talks to the session through its [`SessionHandle`] and
//! answers `{ "success": true, ... }` or, through [`ApiError`],
//! `{ "success": false, "error": "..." }` with a status derived from the
//! error kind.

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use pgnhub_recorder::StartOptions;
use pgnhub_runtime::{ServerConfig, SessionHandle, SubmitRequest};
use pgnhub_types::{ConnectionProfile, ErrorKind, HubError};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A failed request, rendered as `{ "success": false, "error": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Response code for a hub error.
pub fn status_for(err: &HubError) -> StatusCode {
    match (err.kind(), err) {
        (_, HubError::PathTraversal(_)) => StatusCode::BAD_REQUEST,
        (ErrorKind::Validation | ErrorKind::Parse, _) => StatusCode::BAD_REQUEST,
        (ErrorKind::Precondition, _) => StatusCode::CONFLICT,
        (ErrorKind::NotFound, _) => StatusCode::NOT_FOUND,
        (ErrorKind::Transport, _) => StatusCode::BAD_GATEWAY,
        (ErrorKind::FileSystem | ErrorKind::Internal, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            warn!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Stamp `"success": true` onto a JSON object.
fn success(mut body: Value) -> Json<Value> {
    if let Value::Object(map) = &mut body {
        map.insert("success".into(), Value::Bool(true));
    }
    Json(body)
}

fn done(message: &str) -> Json<Value> {
    success(json!({ "message": message }))
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub server: ServerConfig,
}

pub async fn get_config(State(session): State<SessionHandle>) -> ApiResult {
    let config = session.config().await?;
    Ok(success(json!({ "config": config })))
}

pub async fn put_config(
    State(session): State<SessionHandle>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> ApiResult {
    let Json(update) = payload?;
    let config = session.set_server(update.server).await?;
    info!(port = config.server.port, "server settings updated");
    Ok(success(json!({
        "message": "Configuration saved",
        "config": config,
    })))
}

// ---------------------------------------------------------------------------
// Connection profiles
// ---------------------------------------------------------------------------

pub async fn list_connections(State(session): State<SessionHandle>) -> ApiResult {
    let config = session.config().await?;
    let connections: Vec<ConnectionProfile> =
        config.connections.profiles.into_values().collect();
    Ok(success(json!({
        "connections": connections,
        "activeConnection": config.connections.active_connection,
    })))
}

pub async fn save_connection(
    State(session): State<SessionHandle>,
    payload: Result<Json<ConnectionProfile>, JsonRejection>,
) -> ApiResult {
    let Json(profile) = payload?;
    let id = profile.id.clone();
    session.save_profile(profile).await?;
    Ok(success(json!({ "message": "Connection profile saved", "id": id })))
}

pub async fn get_connection(
    State(session): State<SessionHandle>,
    Path(id): Path<String>,
) -> ApiResult {
    let profile = session.get_profile(&id).await?;
    Ok(success(json!({ "connection": profile })))
}

pub async fn delete_connection(
    State(session): State<SessionHandle>,
    Path(id): Path<String>,
) -> ApiResult {
    session.delete_profile(&id).await?;
    Ok(done("Connection profile deleted"))
}

pub async fn activate_connection(
    State(session): State<SessionHandle>,
    Path(id): Path<String>,
) -> ApiResult {
    session.activate(&id).await?;
    Ok(done("Connection activated"))
}

pub async fn deactivate_connection(State(session): State<SessionHandle>) -> ApiResult {
    session.deactivate().await?;
    Ok(done("Connection deactivated"))
}

pub async fn restart_connection(State(session): State<SessionHandle>) -> ApiResult {
    session.restart().await?;
    Ok(done("Connection restarting"))
}

pub async fn status(State(session): State<SessionHandle>) -> ApiResult {
    let snapshot = session.status().await?;
    Ok(success(json!({ "status": snapshot })))
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

pub async fn recording_status(State(session): State<SessionHandle>) -> ApiResult {
    let status = session.recording_status().await?;
    Ok(success(json!({ "status": status })))
}

pub async fn start_recording(
    State(session): State<SessionHandle>,
    payload: Result<Json<StartOptions>, JsonRejection>,
) -> ApiResult {
    let Json(options) = payload?;
    let status = session.start_recording(options).await?;
    Ok(success(json!({ "message": "Recording started", "status": status })))
}

pub async fn stop_recording(State(session): State<SessionHandle>) -> ApiResult {
    let status = session.stop_recording().await?;
    Ok(success(json!({ "message": "Recording stopped", "status": status })))
}

pub async fn list_recordings(State(session): State<SessionHandle>) -> ApiResult {
    let files = session.recordings().await?;
    Ok(success(json!({ "files": files })))
}

/// Stream a recording back as an attachment.
pub async fn download_recording(
    State(session): State<SessionHandle>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let path = session.recording_path(&name).await?;
    let file = tokio::fs::File::open(&path).await.map_err(HubError::from)?;
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

pub async fn delete_recording(
    State(session): State<SessionHandle>,
    Path(name): Path<String>,
) -> ApiResult {
    session.delete_recording(&name).await?;
    Ok(done("Recording deleted"))
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

pub async fn send(
    State(session): State<SessionHandle>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let results = session.submit(request).await?;
    Ok(success(json!({ "results": results })))
}
