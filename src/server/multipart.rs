//! Motion JPEG over `multipart/x-mixed-replace`, plus the single frame
//! endpoints that bypass the capture loop.
//!
//! Browsers render these streams natively: `<img src="/api/stream/liveview">`.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::AppState;
use crate::error::{CameraError, Result};
use crate::streaming::{
    FrameSink, SinkError, StopReason, StreamConfig, StreamHandle, StreamManager, StreamStats,
    TransportKind,
};
use crate::video::EncodedFrame;

pub const BOUNDARY: &str = "frame";

/// Quality used by the high frame rate endpoint when none is given
pub const HIGH_FPS_QUALITY: u8 = 70;

/// Box used by the optimized single frame endpoint when none is given
pub const FRAME_WIDTH: u32 = 800;
pub const FRAME_HEIGHT: u32 = 600;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub fps: Option<u32>,
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamQuery {
    fn resolve(&self, defaults: StreamConfig) -> StreamConfig {
        StreamConfig {
            fps: self.fps.unwrap_or(defaults.fps),
            quality: self.quality.unwrap_or(defaults.quality),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
        }
    }
}

/// One boundary-delimited part carrying `jpeg`
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Writes frames into one open response body
pub struct MultipartSink {
    tx: mpsc::Sender<Bytes>,
}

impl MultipartSink {
    /// Sink plus the receiving end that feeds the response body
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for MultipartSink {
    fn kind(&self) -> TransportKind {
        TransportKind::Multipart
    }

    async fn write_frame(&mut self, frame: &EncodedFrame) -> std::result::Result<(), SinkError> {
        self.tx
            .send(encode_part(&frame.data))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self, reason: &StopReason) -> std::result::Result<(), SinkError> {
        debug!("Multipart response ending: {}", reason);
        Ok(())
    }
}

/// Stops a dedicated stream once its response is gone.
struct StopOnDrop {
    streams: Arc<StreamManager>,
    handle: StreamHandle,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let streams = Arc::clone(&self.streams);
        let handle = self.handle;
        tokio::spawn(async move { streams.stop_stream(&handle).await });
    }
}

fn multipart_response(rx: mpsc::Receiver<Bytes>, guard: Option<StopOnDrop>) -> Response {
    let body = async_stream::stream! {
        let _guard = guard;
        let mut rx = rx;
        while let Some(part) = rx.recv().await {
            yield Ok::<_, Infallible>(part);
        }
    };

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

fn jpeg_response(frame: EncodedFrame) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))],
        frame.data,
    )
        .into_response()
}

/// Shared live view stream: joins the running stream or starts one.
pub async fn shared_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let (sink, rx) = MultipartSink::channel();
    let (handle, id) = state
        .streams
        .ensure_and_subscribe(query.resolve(state.defaults), Box::new(sink))
        .await?;
    info!("Multipart viewer {} joined stream {}", id, handle.id);
    Ok(multipart_response(rx, None))
}

/// Dedicated stream bound to this response. Rejected while any stream runs.
pub async fn high_fps_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let defaults = StreamConfig {
        quality: HIGH_FPS_QUALITY,
        ..state.defaults
    };
    let config = query.resolve(defaults);

    let (sink, rx) = MultipartSink::channel();
    let (handle, _) = state.streams.start_and_subscribe(config, Box::new(sink)).await?;
    let guard = StopOnDrop {
        streams: Arc::clone(&state.streams),
        handle,
    };

    let mut response = multipart_response(rx, Some(guard));
    let headers = response.headers_mut();
    headers.insert("X-FPS", HeaderValue::from(config.fps));
    headers.insert("X-Quality", HeaderValue::from(u32::from(config.quality)));
    Ok(response)
}

pub async fn stop_stream(State(state): State<AppState>) -> Json<Value> {
    state.streams.stop_active().await;
    Json(json!({ "message": "Live view stream stopped" }))
}

/// Current live view frame at native size
pub async fn single_frame(State(state): State<AppState>) -> Result<Response> {
    let frame = state.streams.get_native_frame(state.defaults.quality).await?;
    Ok(jpeg_response(frame))
}

#[derive(Debug, Default, Deserialize)]
pub struct FrameQuery {
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Current live view frame fitted into the requested box
pub async fn optimized_frame(
    State(state): State<AppState>,
    Query(query): Query<FrameQuery>,
) -> Result<Response> {
    let quality = query.quality.unwrap_or(state.defaults.quality);
    if quality > crate::video::MAX_QUALITY {
        return Err(CameraError::InvalidParameter(format!(
            "quality must be within 0..=100, got {}",
            quality
        )));
    }
    let frame = state
        .streams
        .get_single_frame(
            query.width.unwrap_or(FRAME_WIDTH),
            query.height.unwrap_or(FRAME_HEIGHT),
            quality,
        )
        .await?;
    Ok(jpeg_response(frame))
}

pub async fn streaming_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.streams.status();
    let stats: StreamStats = state.streams.stats().await;
    Json(json!({
        "isStreaming": stats.active,
        "cameraSessionOpen": status.session_open,
        "liveViewActive": status.live_view_on,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stats": stats,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::testing::encoded;

    #[test]
    fn test_part_layout() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn test_query_defaults() {
        let defaults = StreamConfig::default();
        let query = StreamQuery {
            fps: Some(60),
            ..Default::default()
        };
        let config = query.resolve(defaults);
        assert_eq!(config.fps, 60);
        assert_eq!(config.quality, defaults.quality);
        assert_eq!((config.width, config.height), (640, 480));
    }

    #[tokio::test]
    async fn test_sink_writes_parts() {
        let (mut sink, mut rx) = MultipartSink::channel();
        sink.write_frame(&encoded(1)).await.unwrap();

        let part = rx.recv().await.unwrap();
        assert!(part.starts_with(b"--frame\r\n"));
        assert!(part.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_sink_reports_disconnect() {
        let (mut sink, rx) = MultipartSink::channel();
        drop(rx);
        assert_eq!(sink.write_frame(&encoded(1)).await, Err(SinkError::Closed));
    }
}
