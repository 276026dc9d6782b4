//! HTTP surface: REST commands, multipart streams, the command socket and
//! the broadcast channel.

pub mod camera;
pub mod hub;
pub mod multipart;
pub mod socket;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::device::CameraDevice;
use crate::session::SessionManager;
use crate::streaming::{PipelineConfig, StreamConfig, StreamManager};

pub use hub::Hub;
pub use socket::SocketClients;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub streams: Arc<StreamManager>,
    pub hub: Arc<Hub>,
    pub sockets: Arc<SocketClients>,
    /// Applied to stream requests that leave parameters out
    pub defaults: StreamConfig,
}

impl AppState {
    pub fn new(
        device: Box<dyn CameraDevice>,
        defaults: StreamConfig,
        pipeline: PipelineConfig,
        hub_capacity: usize,
    ) -> Self {
        let session = Arc::new(SessionManager::new(device));
        let hub = Arc::new(Hub::new(hub_capacity));
        let sockets = Arc::new(SocketClients::new());
        let streams = StreamManager::new(session, pipeline)
            .with_auto_subscriber(hub.clone())
            .with_auto_subscriber(sockets.clone());
        Self {
            streams: Arc::new(streams),
            hub,
            sockets,
            defaults,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/camera/status", get(camera::status))
        .route("/api/camera/session/open", post(camera::open_session))
        .route("/api/camera/session/close", post(camera::close_session))
        .route("/api/camera/liveview/start", post(camera::start_live_view))
        .route("/api/camera/liveview/stop", post(camera::stop_live_view))
        .route("/api/camera/filming/start", post(camera::start_filming))
        .route("/api/camera/filming/stop", post(camera::stop_filming))
        .route("/api/stream/liveview", get(multipart::shared_stream))
        .route("/api/stream/liveview/single", get(multipart::single_frame))
        .route("/api/photobooth/liveview/highfps", get(multipart::high_fps_stream))
        .route("/api/photobooth/liveview/stop", post(multipart::stop_stream))
        .route("/api/photobooth/liveview/frame", get(multipart::optimized_frame))
        .route("/api/photobooth/status", get(multipart::streaming_status))
        .route("/ws", get(socket::upgrade))
        .route("/hub", get(hub::upgrade))
        .with_state(state)
}
