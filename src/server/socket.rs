//! Command socket.
//!
//! One WebSocket connection per client. The client sends
//! `{"action": "start_liveview" | "stop_liveview" | "get_frame", "parameters": {...}}`
//! and receives the frames of every stream that runs while it is connected,
//! whoever started it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::streaming::{
    AutoSubscriber, FrameSink, SinkError, StopReason, StreamConfig, StreamHandle, TransportKind,
};
use crate::video::EncodedFrame;

/// Messages queued for the socket writer
const OUTBOUND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketAction {
    StartLiveview,
    StopLiveview,
    GetFrame,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CommandParameters {
    pub fps: Option<u32>,
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SocketCommand {
    #[serde(alias = "Action")]
    pub action: SocketAction,
    #[serde(default, alias = "Parameters")]
    pub parameters: CommandParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketMessage {
    Frame {
        /// Base64 JPEG
        data: String,
        /// Unix milliseconds
        timestamp: i64,
    },
    LiveviewStarted,
    LiveviewStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}

impl SocketMessage {
    fn frame(frame: &EncodedFrame) -> Self {
        SocketMessage::Frame {
            data: base64::engine::general_purpose::STANDARD.encode(&frame.data),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn error(message: impl ToString) -> Self {
        SocketMessage::Error {
            message: message.to_string(),
        }
    }

    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("Failed to serialize socket message: {}", e);
                None
            }
        }
    }
}

/// Delivers stream frames to one socket connection
pub struct SocketSink {
    out: mpsc::Sender<Message>,
}

impl SocketSink {
    async fn send(&self, message: SocketMessage) -> Result<(), SinkError> {
        match message.into_message() {
            Some(message) => self.out.send(message).await.map_err(|_| SinkError::Closed),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FrameSink for SocketSink {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), SinkError> {
        self.send(SocketMessage::frame(frame)).await
    }

    async fn close(&mut self, reason: &StopReason) -> Result<(), SinkError> {
        if let StopReason::Failed(e) = reason {
            self.send(SocketMessage::error(e)).await?;
        }
        self.send(SocketMessage::LiveviewStopped {
            reason: Some(reason.to_string()),
        })
        .await
    }
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

struct Client {
    out: mpsc::Sender<Message>,
    /// Stream this client's sink was last attached to
    stream: Option<Uuid>,
}

/// Connected command sockets. Each one gets its own sink on every stream
/// that starts while it is connected.
#[derive(Default)]
pub struct SocketClients {
    clients: Mutex<HashMap<Uuid, Client>>,
}

impl SocketClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: Uuid, out: mpsc::Sender<Message>) {
        self.lock().insert(id, Client { out, stream: None });
    }

    fn remove(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    /// Sender for a sink on `stream`, unless `client` already has one there.
    fn claim(&self, client: Uuid, stream: Uuid) -> Option<mpsc::Sender<Message>> {
        let mut clients = self.lock();
        let client = clients.get_mut(&client)?;
        if client.stream == Some(stream) {
            return None;
        }
        client.stream = Some(stream);
        Some(client.out.clone())
    }

    fn attached_to(&self, client: Uuid) -> Option<Uuid> {
        self.lock().get(&client).and_then(|client| client.stream)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AutoSubscriber for SocketClients {
    fn attach(&self, handle: &StreamHandle) -> Vec<Box<dyn FrameSink>> {
        let mut clients = self.lock();
        let sinks: Vec<Box<dyn FrameSink>> = clients
            .values_mut()
            .filter(|client| !client.out.is_closed())
            .map(|client| {
                client.stream = Some(handle.id);
                Box::new(SocketSink {
                    out: client.out.clone(),
                }) as Box<dyn FrameSink>
            })
            .collect();
        if !sinks.is_empty() {
            debug!("{} socket(s) attached to stream {}", sinks.len(), handle.id);
        }
        sinks
    }
}

/// Per-connection state
struct Connection {
    id: Uuid,
    state: AppState,
    out: mpsc::Sender<Message>,
}

impl Connection {
    /// Register with the socket clients and attach to a running stream.
    async fn open(state: AppState, out: mpsc::Sender<Message>) -> Self {
        let id = Uuid::new_v4();
        state.sockets.register(id, out.clone());
        let connection = Self { id, state, out };
        connection.join_active().await;
        connection
    }

    async fn reply(&self, message: SocketMessage) -> bool {
        match message.into_message() {
            Some(message) => self.out.send(message).await.is_ok(),
            None => true,
        }
    }

    /// Attach to whatever stream is running, once.
    async fn join_active(&self) {
        let sockets = &self.state.sockets;
        let id = self.id;
        let joined = self
            .state
            .streams
            .subscribe_active_with(|handle| {
                sockets
                    .claim(id, handle.id)
                    .map(|out| Box::new(SocketSink { out }) as Box<dyn FrameSink>)
            })
            .await;
        if let Some((handle, _)) = joined {
            debug!("Socket {} joined running stream {}", id, handle.id);
        }
    }

    async fn handle(&self, command: SocketCommand) -> Option<SocketMessage> {
        match command.action {
            SocketAction::StartLiveview => Some(self.start(command.parameters).await),
            SocketAction::StopLiveview => self.stop().await,
            SocketAction::GetFrame => Some(self.single_frame(command.parameters).await),
        }
    }

    async fn start(&self, params: CommandParameters) -> SocketMessage {
        let defaults = self.state.defaults;
        let config = StreamConfig {
            fps: params.fps.unwrap_or(defaults.fps),
            quality: params.quality.unwrap_or(defaults.quality),
            width: params.width.unwrap_or(defaults.width),
            height: params.height.unwrap_or(defaults.height),
        };

        if let Err(e) = self.state.streams.ensure_stream(config).await {
            return SocketMessage::error(e);
        }
        // a stream started by this call already carries our sink
        self.join_active().await;
        SocketMessage::LiveviewStarted
    }

    /// No direct reply when this connection's own sink announces the stop.
    async fn stop(&self) -> Option<SocketMessage> {
        let Some(active) = self.state.streams.active_handle().await else {
            return Some(SocketMessage::LiveviewStopped { reason: None });
        };

        let attached = self.state.sockets.attached_to(self.id) == Some(active.id);
        self.state.streams.stop_stream(&active).await;
        if attached {
            None
        } else {
            Some(SocketMessage::LiveviewStopped { reason: None })
        }
    }

    async fn single_frame(&self, params: CommandParameters) -> SocketMessage {
        let quality = params.quality.unwrap_or(self.state.defaults.quality);
        let result = match (params.width, params.height) {
            (Some(width), Some(height)) => {
                self.state.streams.get_single_frame(width, height, quality).await
            }
            _ => self.state.streams.get_native_frame(quality).await,
        };
        match result {
            Ok(frame) => SocketMessage::frame(&frame),
            Err(e) => SocketMessage::error(e),
        }
    }

    /// Its sink is pruned on the next write once the writer is gone.
    fn close(self) {
        self.state.sockets.remove(self.id);
    }
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (out, mut outbound) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let connection = Connection::open(state, out).await;
    info!("Socket connection {} opened", connection.id);

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match serde_json::from_str::<SocketCommand>(text.as_str()) {
            Ok(command) => {
                debug!("Socket command: {:?}", command.action);
                connection.handle(command).await
            }
            Err(e) => Some(SocketMessage::error(format!("invalid command: {}", e))),
        };
        if let Some(reply) = reply {
            if !connection.reply(reply).await {
                break;
            }
        }
    }

    let id = connection.id;
    connection.close();
    writer.abort();
    info!("Socket connection {} closed", id);
}
