//! Error types shared by the session, pipeline and HTTP layers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, CameraError>;

/// Camera and streaming errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    /// No device session is open; returned before any device call
    #[error("No camera session is open")]
    NoSessionOpen,

    #[error("Camera not found: {0}")]
    DeviceNotFound(String),

    #[error("Camera is busy: {0}")]
    DeviceBusy(String),

    /// Mode precondition failed (e.g. filming without live view)
    #[error("Camera is not ready: {0}")]
    DeviceNotReady(String),

    #[error("Stream is already active")]
    StreamAlreadyActive,

    /// The stream handle no longer refers to the running stream
    #[error("Stream is not active")]
    StreamNotActive,

    #[error("No live view image available")]
    NoFrameAvailable,

    /// Raw frame could not be decoded; the frame is skipped
    #[error("Failed to decode frame: {0}")]
    FrameDecode(String),

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Any other failure reported by the device driver
    #[error("Device error: {0}")]
    Device(String),
}

impl CameraError {
    /// Per-frame errors that never count towards stopping a stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::FrameDecode(_) | CameraError::NoFrameAvailable)
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CameraError::NoSessionOpen
            | CameraError::DeviceNotReady(_)
            | CameraError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            CameraError::DeviceNotFound(_) | CameraError::NoFrameAvailable => StatusCode::NOT_FOUND,
            CameraError::DeviceBusy(_)
            | CameraError::StreamAlreadyActive
            | CameraError::StreamNotActive => StatusCode::CONFLICT,
            CameraError::FrameDecode(_) | CameraError::Encode(_) | CameraError::Device(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CameraError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(CameraError::FrameDecode("bad".into()).is_transient());
        assert!(CameraError::NoFrameAvailable.is_transient());
        assert!(!CameraError::Device("usb reset".into()).is_transient());
        assert!(!CameraError::NoSessionOpen.is_transient());
    }

    #[test]
    fn status_codes() {
        assert_eq!(CameraError::NoSessionOpen.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(CameraError::StreamAlreadyActive.status_code(), StatusCode::CONFLICT);
        assert_eq!(CameraError::NoFrameAvailable.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            CameraError::Device("io".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn messages_match_api_wording() {
        assert_eq!(CameraError::NoSessionOpen.to_string(), "No camera session is open");
        assert_eq!(CameraError::StreamAlreadyActive.to_string(), "Stream is already active");
    }
}
