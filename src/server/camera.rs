//! Session, live view and filming commands.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::device::DeviceId;
use crate::error::{CameraError, Result};
use crate::session::{SessionManager, SessionStatus};
use crate::streaming::stream_manager::run_blocking;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub device_id: Option<DeviceId>,
}

fn success(message: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": message }))
}

/// Run a session command off the async workers.
async fn with_session<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&SessionManager) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let session = Arc::clone(state.streams.session());
    run_blocking(move || f(&session)).await
}

pub async fn status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.streams.status())
}

/// The body is optional; an empty body opens the default device.
pub async fn open_session(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let request: OpenSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        OpenSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| CameraError::InvalidParameter(format!("invalid request body: {}", e)))?
    };

    let device = with_session(&state, move |session| session.open(request.device_id)).await?;
    info!("Camera session opened on {}", device);
    Ok(Json(json!({
        "success": true,
        "message": "Session opened successfully",
        "deviceId": device,
    })))
}

pub async fn close_session(State(state): State<AppState>) -> Result<Json<Value>> {
    state.streams.close_session().await?;
    Ok(success("Session closed successfully"))
}

pub async fn start_live_view(State(state): State<AppState>) -> Result<Json<Value>> {
    with_session(&state, |session| session.start_live_view()).await?;
    Ok(success("Live view started successfully"))
}

/// A running stream notices the device left live view and ends itself.
pub async fn stop_live_view(State(state): State<AppState>) -> Result<Json<Value>> {
    with_session(&state, |session| session.stop_live_view()).await?;
    Ok(success("Live view stopped successfully"))
}

pub async fn start_filming(State(state): State<AppState>) -> Result<Json<Value>> {
    with_session(&state, |session| session.start_filming()).await?;
    Ok(success("Filming started successfully"))
}

pub async fn stop_filming(State(state): State<AppState>) -> Result<Json<Value>> {
    with_session(&state, |session| session.stop_filming()).await?;
    Ok(success("Filming stopped successfully"))
}
