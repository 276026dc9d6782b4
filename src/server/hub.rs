//! Broadcast channel.
//!
//! Every stream gets one relay sink attached at start; the relay turns frames
//! into `LiveViewFrame` events on a `tokio::sync::broadcast` channel that all
//! `/hub` connections read from. Slow connections lag and skip events instead
//! of holding the relay back.

use async_trait::async_trait;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::{debug, info, warn};

use super::AppState;
use crate::streaming::{
    AutoSubscriber, FrameSink, SinkError, StopReason, StreamConfig, StreamHandle, TransportKind,
};
use crate::video::{EncodedFrame, DEFAULT_QUALITY};

/// Event pushed to hub connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    /// Base64 JPEG
    LiveViewFrame(String),
    LiveViewStarted {
        #[serde(rename = "targetFps")]
        target_fps: u32,
        quality: u8,
    },
    LiveViewStopped,
    Error(String),
}

/// Method invoked by a hub connection
#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
pub enum HubInvocation {
    StartLiveViewStream {
        #[serde(rename = "targetFps", default)]
        target_fps: Option<u32>,
        #[serde(default)]
        quality: Option<u8>,
    },
    StopLiveViewStream,
}

fn to_text(event: &HubEvent) -> Option<Utf8Bytes> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            warn!("Failed to serialize hub event: {}", e);
            None
        }
    }
}

pub struct Hub {
    tx: broadcast::Sender<Utf8Bytes>,
}

impl Hub {
    /// `capacity` events are kept per connection before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to every connection. Returns how many received it.
    pub fn emit(&self, event: &HubEvent) -> usize {
        match to_text(event) {
            Some(text) => self.tx.send(text).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Utf8Bytes> {
        self.tx.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl AutoSubscriber for Hub {
    fn attach(&self, handle: &StreamHandle) -> Vec<Box<dyn FrameSink>> {
        debug!("Hub relay attached to stream {}", handle.id);
        vec![Box::new(HubRelaySink {
            tx: self.tx.clone(),
        })]
    }
}

/// Relays one stream to the hub channel
pub struct HubRelaySink {
    tx: broadcast::Sender<Utf8Bytes>,
}

impl HubRelaySink {
    fn emit(&self, event: &HubEvent) {
        if let Some(text) = to_text(event) {
            // no connected clients is not an error
            let _ = self.tx.send(text);
        }
    }
}

#[async_trait]
impl FrameSink for HubRelaySink {
    fn kind(&self) -> TransportKind {
        TransportKind::BroadcastChannel
    }

    async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), SinkError> {
        if self.tx.receiver_count() == 0 {
            return Ok(());
        }
        let data = base64::engine::general_purpose::STANDARD.encode(&frame.data);
        self.emit(&HubEvent::LiveViewFrame(data));
        Ok(())
    }

    async fn close(&mut self, reason: &StopReason) -> Result<(), SinkError> {
        if let StopReason::Failed(e) = reason {
            self.emit(&HubEvent::Error(e.to_string()));
        }
        self.emit(&HubEvent::LiveViewStopped);
        Ok(())
    }
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (caller_tx, caller_rx) = mpsc::channel::<Utf8Bytes>(8);
    let events = tokio_stream::StreamExt::filter_map(
        BroadcastStream::new(state.hub.subscribe()),
        |event| match event {
            Ok(text) => Some(text),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!("Hub connection lagged, {} event(s) skipped", skipped);
                None
            }
        },
    );
    let mut outgoing = Box::pin(tokio_stream::StreamExt::merge(
        ReceiverStream::new(caller_rx),
        events,
    ));
    info!("Hub connection opened, {} connected", state.hub.connection_count());

    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing.next().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match serde_json::from_str::<HubInvocation>(text.as_str()) {
            Ok(invocation) => invoke(&state, invocation).await,
            Err(e) => Some(HubEvent::Error(format!("invalid invocation: {}", e))),
        };
        if let Some(text) = reply.as_ref().and_then(to_text) {
            if caller_tx.send(text).await.is_err() {
                break;
            }
        }
    }

    writer.abort();
    info!("Hub connection closed");
}

/// Run one invocation; the return value goes to the caller only.
async fn invoke(state: &AppState, invocation: HubInvocation) -> Option<HubEvent> {
    match invocation {
        HubInvocation::StartLiveViewStream {
            target_fps,
            quality,
        } => {
            let config = StreamConfig {
                fps: target_fps.unwrap_or(state.defaults.fps),
                quality: quality.unwrap_or(DEFAULT_QUALITY),
                ..state.defaults
            };
            match state.streams.start_stream(config).await {
                Ok(_) => Some(HubEvent::LiveViewStarted {
                    target_fps: config.fps,
                    quality: config.quality,
                }),
                Err(e) => Some(HubEvent::Error(e.to_string())),
            }
        }
        HubInvocation::StopLiveViewStream => {
            // a running stream's relay announces the stop itself
            if !state.streams.stop_active().await {
                state.hub.emit(&HubEvent::LiveViewStopped);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockCamera;
    use crate::error::CameraError;
    use crate::streaming::testing::encoded;
    use crate::streaming::PipelineConfig;
    use std::time::Duration;
    use uuid::Uuid;

    fn app_state() -> (AppState, MockCamera) {
        let camera = MockCamera::default();
        let defaults = StreamConfig {
            fps: 10,
            quality: 70,
            width: 32,
            height: 18,
        };
        let state = AppState::new(
            Box::new(camera.clone()),
            defaults,
            PipelineConfig::default(),
            64,
        );
        state.streams.session().open(None).unwrap();
        (state, camera)
    }

    fn drain(rx: &mut broadcast::Receiver<Utf8Bytes>) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Ok(text) = rx.try_recv() {
            events.push(serde_json::from_str(text.as_str()).unwrap());
        }
        events
    }

    fn relay(hub: &Hub) -> Box<dyn FrameSink> {
        let mut sinks = hub.attach(&StreamHandle {
            id: Uuid::new_v4(),
            config: StreamConfig::default(),
        });
        assert_eq!(sinks.len(), 1);
        sinks.remove(0)
    }

    fn next_event(rx: &mut broadcast::Receiver<Utf8Bytes>) -> HubEvent {
        let text = rx.try_recv().unwrap();
        serde_json::from_str(text.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_relay_fans_out_frames() {
        let hub = Hub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let mut sink = relay(&hub);

        let frame = encoded(1);
        sink.write_frame(&frame).await.unwrap();

        let expected = base64::engine::general_purpose::STANDARD.encode(&frame.data);
        assert_eq!(next_event(&mut first), HubEvent::LiveViewFrame(expected.clone()));
        assert_eq!(next_event(&mut second), HubEvent::LiveViewFrame(expected));
    }

    #[tokio::test]
    async fn test_relay_without_connections() {
        let hub = Hub::new(8);
        let mut sink = relay(&hub);
        assert!(sink.write_frame(&encoded(1)).await.is_ok());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_announces_failure() {
        let hub = Hub::new(8);
        let mut rx = hub.subscribe();
        let mut sink = relay(&hub);

        let reason = StopReason::Failed(CameraError::Device("usb reset".into()));
        sink.close(&reason).await.unwrap();

        assert_eq!(
            next_event(&mut rx),
            HubEvent::Error("Device error: usb reset".into())
        );
        assert_eq!(next_event(&mut rx), HubEvent::LiveViewStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_start_and_stop() {
        let (state, camera) = app_state();
        let mut rx = state.hub.subscribe();

        let reply = invoke(
            &state,
            HubInvocation::StartLiveViewStream {
                target_fps: Some(20),
                quality: None,
            },
        )
        .await;
        assert_eq!(
            reply,
            Some(HubEvent::LiveViewStarted {
                target_fps: 20,
                quality: DEFAULT_QUALITY
            })
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(invoke(&state, HubInvocation::StopLiveViewStream).await, None);
        assert!(!state.streams.is_streaming().await);
        assert_eq!(camera.calls().stop, 1);

        let events = drain(&mut rx);
        let frames = events
            .iter()
            .filter(|e| matches!(e, HubEvent::LiveViewFrame(_)))
            .count();
        assert!(frames >= 3, "{} frames", frames);
        assert_eq!(events.last(), Some(&HubEvent::LiveViewStopped));
        assert_eq!(
            events.iter().filter(|e| **e == HubEvent::LiveViewStopped).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_start_while_streaming() {
        let (state, _camera) = app_state();
        let handle = state.streams.ensure_stream(state.defaults).await.unwrap();

        let reply = invoke(
            &state,
            HubInvocation::StartLiveViewStream {
                target_fps: None,
                quality: Some(50),
            },
        )
        .await;
        assert_eq!(
            reply,
            Some(HubEvent::Error(CameraError::StreamAlreadyActive.to_string()))
        );
        assert_eq!(state.streams.active_handle().await, Some(handle));
        state.streams.stop_stream(&handle).await;
    }

    #[tokio::test]
    async fn test_invoke_stop_when_idle_still_announces() {
        let (state, camera) = app_state();
        let mut rx = state.hub.subscribe();

        assert_eq!(invoke(&state, HubInvocation::StopLiveViewStream).await, None);
        assert_eq!(drain(&mut rx), vec![HubEvent::LiveViewStopped]);
        assert_eq!(camera.calls().stop, 0);
    }

    #[tokio::test]
    async fn test_invoke_without_session() {
        let (state, camera) = app_state();
        state.streams.close_session().await.unwrap();

        let reply = invoke(
            &state,
            HubInvocation::StartLiveViewStream {
                target_fps: None,
                quality: None,
            },
        )
        .await;
        assert_eq!(
            reply,
            Some(HubEvent::Error(CameraError::NoSessionOpen.to_string()))
        );
        assert_eq!(camera.calls().start, 0);
    }

    #[test]
    fn test_event_wire_format() {
        let started = HubEvent::LiveViewStarted {
            target_fps: 30,
            quality: 80,
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            serde_json::json!({"event": "LiveViewStarted", "data": {"targetFps": 30, "quality": 80}})
        );
        assert_eq!(
            serde_json::to_value(&HubEvent::LiveViewStopped).unwrap(),
            serde_json::json!({"event": "LiveViewStopped"})
        );
    }

    #[test]
    fn test_invocation_parsing() {
        let start: HubInvocation =
            serde_json::from_str(r#"{"method":"StartLiveViewStream","targetFps":15}"#).unwrap();
        assert!(matches!(
            start,
            HubInvocation::StartLiveViewStream {
                target_fps: Some(15),
                quality: None
            }
        ));
        let stop: HubInvocation = serde_json::from_str(r#"{"method":"StopLiveViewStream"}"#).unwrap();
        assert!(matches!(stop, HubInvocation::StopLiveViewStream));
        assert!(serde_json::from_str::<HubInvocation>(r#"{"method":"TakePhoto"}"#).is_err());
    }
}
