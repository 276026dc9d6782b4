/*!
 * Stream Manager
 *
 * Owns the single live view capture loop: acquisition, encoding, pacing and
 * hand-off to the broadcaster. Request handlers only start and stop the loop
 * and attach sinks to it.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broadcaster::{Broadcaster, FrameSink, SubscriptionId, SubscriptionInfo};
use super::{PipelineConfig, StopReason, StreamConfig, MIN_FRAME_DELAY};
use crate::error::{CameraError, Result};
use crate::session::{LiveRead, SessionManager, SessionStatus};
use crate::video::{EncodedFrame, FrameProcessor};

/// Identifies one run of the capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHandle {
    pub id: Uuid,
    pub config: StreamConfig,
}

/// Source of sinks attached to every new stream as it starts
pub trait AutoSubscriber: Send + Sync {
    /// Called under the stream lock, so no stream can start or end while
    /// the sinks are built.
    fn attach(&self, handle: &StreamHandle) -> Vec<Box<dyn FrameSink>>;
}

/// Stream statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub active: bool,
    pub stream: Option<StreamHandle>,
    /// Frames read from the device
    pub frames_captured: u64,
    /// Frames handed to the broadcaster
    pub frames_published: u64,
    /// Empty reads and transient per-frame errors
    pub frames_skipped: u64,
    /// Failed iterations
    pub errors: u64,
    /// Average acquisition plus encoding time (ms)
    pub avg_process_ms: f64,
    pub uptime_secs: u64,
    pub subscribers: Vec<SubscriptionInfo>,
}

#[derive(Debug, Default)]
struct Counters {
    captured: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    /// Total processing time in microseconds
    total_process_us: AtomicU64,
}

struct ActiveStream {
    handle: StreamHandle,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Cancelled once the loop has torn down and left the slot
    finished: CancellationToken,
    counters: Arc<Counters>,
    started_at: Instant,
}

type Slot = Arc<Mutex<Option<ActiveStream>>>;

/// Stream manager handles the live view pipeline
pub struct StreamManager {
    session: Arc<SessionManager>,
    processor: Arc<FrameProcessor>,
    pipeline: PipelineConfig,
    active: Slot,
    auto_subscribers: Vec<Arc<dyn AutoSubscriber>>,
}

impl StreamManager {
    pub fn new(session: Arc<SessionManager>, pipeline: PipelineConfig) -> Self {
        Self {
            session,
            processor: Arc::new(FrameProcessor::new()),
            pipeline,
            active: Arc::new(Mutex::new(None)),
            auto_subscribers: Vec::new(),
        }
    }

    pub fn with_processor(mut self, processor: FrameProcessor) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    pub fn with_auto_subscriber(mut self, subscriber: Arc<dyn AutoSubscriber>) -> Self {
        self.auto_subscribers.push(subscriber);
        self
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Start the capture loop. Rejected while another stream is running.
    pub async fn start_stream(&self, config: StreamConfig) -> Result<StreamHandle> {
        let mut slot = self.active.lock().await;
        self.reclaim_finished(&mut slot).await;
        if slot.is_some() {
            return Err(CameraError::StreamAlreadyActive);
        }
        self.start_locked(&mut slot, config).await
    }

    /// Join the running stream, or start one with `config` when idle.
    pub async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamHandle> {
        let mut slot = self.active.lock().await;
        self.reclaim_finished(&mut slot).await;
        if let Some(active) = slot.as_ref() {
            return Ok(active.handle);
        }
        self.start_locked(&mut slot, config).await
    }

    /// Join the running stream with `sink`, or start one with `config` and
    /// attach `sink` to it, under one lock hold. A stream that is winding
    /// down is waited out and replaced.
    pub async fn ensure_and_subscribe(
        &self,
        config: StreamConfig,
        sink: Box<dyn FrameSink>,
    ) -> Result<(StreamHandle, SubscriptionId)> {
        self.attach_or_start(config, sink, false).await
    }

    /// Start a stream with `sink` attached from its first frame. Rejected
    /// while another stream is running.
    pub async fn start_and_subscribe(
        &self,
        config: StreamConfig,
        sink: Box<dyn FrameSink>,
    ) -> Result<(StreamHandle, SubscriptionId)> {
        self.attach_or_start(config, sink, true).await
    }

    async fn attach_or_start(
        &self,
        config: StreamConfig,
        mut sink: Box<dyn FrameSink>,
        exclusive: bool,
    ) -> Result<(StreamHandle, SubscriptionId)> {
        loop {
            let finished = {
                let mut slot = self.active.lock().await;
                self.reclaim_finished(&mut slot).await;

                if slot.is_none() {
                    let handle = self.start_locked(&mut slot, config).await?;
                    let active = slot.as_ref().ok_or(CameraError::StreamNotActive)?;
                    let id = active
                        .broadcaster
                        .try_subscribe(sink)
                        .map_err(|_| CameraError::StreamNotActive)?;
                    return Ok((handle, id));
                }
                if exclusive {
                    return Err(CameraError::StreamAlreadyActive);
                }

                match slot.as_ref() {
                    Some(active) => match active.broadcaster.try_subscribe(sink) {
                        Ok(id) => return Ok((active.handle, id)),
                        Err(returned) => {
                            sink = returned;
                            active.finished.clone()
                        }
                    },
                    None => continue,
                }
            };

            debug!("Stream is winding down, waiting to start a new one");
            finished.cancelled().await;
        }
    }

    async fn start_locked(
        &self,
        slot: &mut Option<ActiveStream>,
        config: StreamConfig,
    ) -> Result<StreamHandle> {
        config.validate()?;
        if !self.session.is_open() {
            return Err(CameraError::NoSessionOpen);
        }

        let session = Arc::clone(&self.session);
        run_blocking(move || session.start_live_view()).await?;

        let handle = StreamHandle {
            id: Uuid::new_v4(),
            config,
        };
        let broadcaster = Arc::new(Broadcaster::new(
            self.pipeline.sink_buffer,
            self.pipeline.sink_write_timeout,
        ));
        for subscriber in &self.auto_subscribers {
            for sink in subscriber.attach(&handle) {
                if let Err(e) = broadcaster.subscribe(sink) {
                    warn!("Failed to attach automatic subscriber: {}", e);
                }
            }
        }

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let capture = CaptureLoop {
            session: Arc::clone(&self.session),
            processor: Arc::clone(&self.processor),
            broadcaster: Arc::clone(&broadcaster),
            cancel: cancel.clone(),
            finished: finished.clone(),
            config,
            max_consecutive_errors: self.pipeline.max_consecutive_errors.max(1),
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(capture.run(handle.id, Arc::clone(&self.active)));

        info!(
            "Stream {} started: {} fps, quality {}, {}x{}",
            handle.id, config.fps, config.quality, config.width, config.height
        );

        *slot = Some(ActiveStream {
            handle,
            broadcaster,
            cancel,
            task: Some(task),
            finished,
            counters,
            started_at: Instant::now(),
        });
        Ok(handle)
    }

    /// Clean up after a capture loop that died without running its own
    /// teardown.
    async fn reclaim_finished(&self, slot: &mut Option<ActiveStream>) {
        let finished = slot
            .as_ref()
            .and_then(|active| active.task.as_ref())
            .map_or(false, JoinHandle::is_finished);
        if !finished {
            return;
        }
        if let Some(active) = slot.take() {
            error!("Stream {} loop exited without cleanup", active.handle.id);
            self.abandon(active).await;
        }
    }

    async fn abandon(&self, active: ActiveStream) {
        let session = Arc::clone(&self.session);
        if let Err(e) = run_blocking(move || session.stop_live_view()).await {
            debug!("Live view stop after aborted stream: {}", e);
        }
        active
            .broadcaster
            .close(StopReason::Failed(CameraError::Device(
                "capture loop aborted".into(),
            )))
            .await;
        active.finished.cancel();
    }

    /// Cancel the stream and wait for its loop to finish. Stopping a stream
    /// that already ended is a no-op; a concurrent stopper waits for the
    /// first one's teardown.
    pub async fn stop_stream(&self, handle: &StreamHandle) {
        let (task, finished) = {
            let mut slot = self.active.lock().await;
            match slot.as_mut() {
                Some(active) if active.handle.id == handle.id => {
                    active.cancel.cancel();
                    (active.task.take(), Some(active.finished.clone()))
                }
                _ => (None, None),
            }
        };

        let Some(task) = task else {
            match finished {
                Some(finished) => {
                    debug!("Stream {} already stopping, waiting", handle.id);
                    finished.cancelled().await;
                }
                None => debug!("Stream {} is not running", handle.id),
            }
            return;
        };

        info!("Stopping stream {}", handle.id);
        if let Err(e) = task.await {
            error!("Stream {} loop failed: {}", handle.id, e);
            let active = {
                let mut slot = self.active.lock().await;
                match slot.as_ref() {
                    Some(active) if active.handle.id == handle.id => slot.take(),
                    _ => None,
                }
            };
            if let Some(active) = active {
                self.abandon(active).await;
            }
        }
    }

    /// Stop whatever stream is running. Returns false when idle.
    pub async fn stop_active(&self) -> bool {
        match self.active_handle().await {
            Some(handle) => {
                self.stop_stream(&handle).await;
                true
            }
            None => false,
        }
    }

    pub async fn active_handle(&self) -> Option<StreamHandle> {
        self.active.lock().await.as_ref().map(|active| active.handle)
    }

    pub async fn is_streaming(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Attach a sink to the stream identified by `handle`.
    pub async fn subscribe(
        &self,
        handle: &StreamHandle,
        sink: Box<dyn FrameSink>,
    ) -> Result<SubscriptionId> {
        let slot = self.active.lock().await;
        match slot.as_ref() {
            Some(active) if active.handle.id == handle.id => active
                .broadcaster
                .subscribe(sink)
                .map_err(|_| CameraError::StreamNotActive),
            _ => Err(CameraError::StreamNotActive),
        }
    }

    /// Attach the sink built by `make` to whatever stream is running.
    /// `make` runs under the stream lock and may decline with `None`.
    pub async fn subscribe_active_with<F>(&self, make: F) -> Option<(StreamHandle, SubscriptionId)>
    where
        F: FnOnce(&StreamHandle) -> Option<Box<dyn FrameSink>>,
    {
        let slot = self.active.lock().await;
        let active = slot.as_ref()?;
        let sink = make(&active.handle)?;
        let id = active.broadcaster.subscribe(sink).ok()?;
        Some((active.handle, id))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.active.lock().await.as_ref() {
            Some(active) => active.broadcaster.unsubscribe(id),
            None => false,
        }
    }

    /// Read and encode one frame outside the capture loop.
    pub async fn get_single_frame(&self, width: u32, height: u32, quality: u8) -> Result<EncodedFrame> {
        let session = Arc::clone(&self.session);
        let processor = Arc::clone(&self.processor);
        run_blocking(move || {
            let raw = session.next_frame()?;
            processor.process(&raw, width, height, quality)
        })
        .await
    }

    /// Read one frame and encode it at its native size.
    pub async fn get_native_frame(&self, quality: u8) -> Result<EncodedFrame> {
        let session = Arc::clone(&self.session);
        let processor = Arc::clone(&self.processor);
        run_blocking(move || {
            let raw = session.next_frame()?;
            processor.encode_native(&raw, quality)
        })
        .await
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Get stream statistics
    pub async fn stats(&self) -> StreamStats {
        let slot = self.active.lock().await;
        let Some(active) = slot.as_ref() else {
            return StreamStats::default();
        };

        let counters = &active.counters;
        let captured = counters.captured.load(Ordering::Relaxed);
        let total_us = counters.total_process_us.load(Ordering::Relaxed);
        let avg_process_ms = if captured > 0 {
            (total_us as f64 / captured as f64) / 1000.0
        } else {
            0.0
        };

        StreamStats {
            active: true,
            stream: Some(active.handle),
            frames_captured: captured,
            frames_published: counters.published.load(Ordering::Relaxed),
            frames_skipped: counters.skipped.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            avg_process_ms,
            uptime_secs: active.started_at.elapsed().as_secs(),
            subscribers: active.broadcaster.subscriptions(),
        }
    }

    /// Stop the stream, then close the session.
    pub async fn close_session(&self) -> Result<()> {
        self.stop_active().await;
        let session = Arc::clone(&self.session);
        run_blocking(move || session.close()).await
    }

    /// Graceful teardown on process exit
    pub async fn shutdown(&self) {
        info!("Shutting down stream manager");
        self.stop_active().await;
        if self.session.is_open() {
            if let Err(e) = self.close_session().await {
                warn!("Failed to close session on shutdown: {}", e);
            }
        }
    }
}

/// Run a device call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CameraError::Device(format!("device task failed: {}", e)))?
}

enum Step {
    Frame(EncodedFrame),
    Empty,
    Off,
}

struct CaptureLoop {
    session: Arc<SessionManager>,
    processor: Arc<FrameProcessor>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    finished: CancellationToken,
    config: StreamConfig,
    max_consecutive_errors: u32,
    counters: Arc<Counters>,
}

impl CaptureLoop {
    async fn run(self, id: Uuid, slot: Slot) {
        // fires last, and on unwind too
        let _finished = self.finished.clone().drop_guard();

        let reason = self.pump().await;
        match &reason {
            StopReason::Failed(e) => error!("Stream {} failed: {}", id, e),
            other => info!("Stream {} ended: {}", id, other),
        }

        // the loop is the only caller of this on termination
        let session = Arc::clone(&self.session);
        if let Err(e) = run_blocking(move || session.stop_live_view()).await {
            match e {
                CameraError::NoSessionOpen => debug!("Session already closed, live view stop skipped"),
                e => warn!("Failed to stop live view: {}", e),
            }
        }

        self.broadcaster.close(reason).await;

        let mut slot = slot.lock().await;
        if slot.as_ref().map_or(false, |active| active.handle.id == id) {
            *slot = None;
        }
    }

    async fn pump(&self) -> StopReason {
        let interval = self.config.frame_interval();
        let mut consecutive_errors = 0u32;
        let mut sequence = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            let t0 = time::Instant::now();
            let mut delay = interval;

            match self.capture().await {
                Ok(Step::Frame(mut frame)) => {
                    consecutive_errors = 0;
                    sequence += 1;
                    frame.sequence = sequence;
                    self.counters.captured.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .total_process_us
                        .fetch_add(t0.elapsed().as_micros() as u64, Ordering::Relaxed);

                    let report = self.broadcaster.publish(Arc::new(frame));
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    if report.lagging > 0 {
                        debug!("Frame {}: {} sink(s) lagging", sequence, report.lagging);
                    }
                    delay = interval.saturating_sub(t0.elapsed()).max(MIN_FRAME_DELAY);
                }
                Ok(Step::Empty) => {
                    consecutive_errors = 0;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Step::Off) => return StopReason::LiveViewOff,
                Err(CameraError::NoSessionOpen) => return StopReason::SessionClosed,
                Err(e) if e.is_transient() => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping frame: {}", e);
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_errors += 1;
                    if consecutive_errors >= self.max_consecutive_errors {
                        return StopReason::Failed(e);
                    }
                    warn!(
                        "Capture error ({}/{}): {}",
                        consecutive_errors, self.max_consecutive_errors, e
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                _ = time::sleep(delay) => {}
            }
        }
    }

    async fn capture(&self) -> Result<Step> {
        let session = Arc::clone(&self.session);
        let processor = Arc::clone(&self.processor);
        let StreamConfig {
            width,
            height,
            quality,
            ..
        } = self.config;

        run_blocking(move || match session.next_live_frame()? {
            LiveRead::Off => Ok(Step::Off),
            LiveRead::Empty => Ok(Step::Empty),
            LiveRead::Frame(raw) => processor
                .process(&raw, width, height, quality)
                .map(Step::Frame),
        })
        .await
    }
}
