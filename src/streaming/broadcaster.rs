/*!
 * Frame Broadcaster
 *
 * Registry of sinks attached to one stream. Each sink gets its own bounded
 * queue and delivery task, so `publish` never waits on a consumer: a full
 * queue means that sink misses the frame, a failed write removes the sink.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{StopReason, StreamEvent, TransportKind};
use crate::video::EncodedFrame;

pub type SubscriptionId = Uuid;

/// Failure writing to one consumer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("consumer disconnected")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Io(String),
}

/// Consumer-facing write capability attached to a stream
#[async_trait]
pub trait FrameSink: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Write one frame. Any error detaches the sink.
    async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), SinkError>;

    /// Terminal notification, sent once when the stream stops
    async fn close(&mut self, _reason: &StopReason) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SinkStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<Option<SinkError>>,
}

/// Snapshot of one subscription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub kind: TransportKind,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub last_error: Option<String>,
}

/// Result of one `publish`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Sinks the frame was queued for
    pub queued: usize,
    /// Sinks whose queue was full
    pub lagging: usize,
    /// Sinks found disconnected and removed
    pub pruned: usize,
}

struct SinkEntry {
    kind: TransportKind,
    tx: mpsc::Sender<StreamEvent>,
    stats: Arc<SinkStats>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    sinks: HashMap<SubscriptionId, SinkEntry>,
    closed: bool,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of encoded frames to every registered sink
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
    write_timeout: Duration,
}

impl Broadcaster {
    /// `buffer` frames are queued per sink; each write may take at most
    /// `write_timeout`.
    pub fn new(buffer: usize, write_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            buffer: buffer.max(1),
            write_timeout,
        }
    }

    /// Attach a sink. Fails with `SinkError::Closed` once the stream stopped.
    pub fn subscribe(&self, sink: Box<dyn FrameSink>) -> Result<SubscriptionId, SinkError> {
        self.try_subscribe(sink).map_err(|_| SinkError::Closed)
    }

    /// Attach a sink, handing it back if the stream already stopped.
    pub fn try_subscribe(
        &self,
        sink: Box<dyn FrameSink>,
    ) -> Result<SubscriptionId, Box<dyn FrameSink>> {
        let id = Uuid::new_v4();
        let kind = sink.kind();

        let mut registry = lock(&self.registry);
        if registry.closed {
            return Err(sink);
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let stats = Arc::new(SinkStats::default());
        let task = tokio::spawn(deliver(
            id,
            sink,
            rx,
            Arc::clone(&stats),
            self.write_timeout,
            Arc::downgrade(&self.registry),
        ));
        registry.sinks.insert(id, SinkEntry { kind, tx, stats, task });
        let count = registry.sinks.len();
        drop(registry);

        info!("Sink {} ({:?}) subscribed, {} active", id, kind, count);
        Ok(id)
    }

    /// Detach a sink. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let entry = lock(&self.registry).sinks.remove(&id);
        match entry {
            Some(entry) => {
                entry.task.abort();
                info!("Sink {} ({:?}) unsubscribed", id, entry.kind);
                true
            }
            None => false,
        }
    }

    /// Queue `frame` for every sink without waiting for any of them.
    pub fn publish(&self, frame: Arc<EncodedFrame>) -> PublishReport {
        let targets: Vec<_> = {
            let registry = lock(&self.registry);
            if registry.closed {
                return PublishReport::default();
            }
            registry
                .sinks
                .iter()
                .map(|(id, entry)| (*id, entry.tx.clone(), Arc::clone(&entry.stats)))
                .collect()
        };

        let mut report = PublishReport::default();
        let mut dead = Vec::new();
        for (id, tx, stats) in targets {
            match tx.try_send(StreamEvent::Frame(Arc::clone(&frame))) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(_)) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    report.lagging += 1;
                    debug!("Sink {} lagging, frame {} skipped", id, frame.sequence);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut registry = lock(&self.registry);
            for id in &dead {
                registry.sinks.remove(id);
            }
            report.pruned = dead.len();
            debug!("Pruned {} disconnected sink(s)", dead.len());
        }

        report
    }

    /// Stop accepting sinks, deliver the terminal notification to every
    /// current sink and wait for their delivery tasks to finish.
    pub async fn close(&self, reason: StopReason) {
        let entries: Vec<(SubscriptionId, SinkEntry)> = {
            let mut registry = lock(&self.registry);
            registry.closed = true;
            registry.sinks.drain().collect()
        };
        if entries.is_empty() {
            return;
        }

        info!("Closing {} sink(s): {}", entries.len(), reason);
        let budget = self.write_timeout;
        // queued frames plus the close itself
        let drain_budget = budget * (self.buffer as u32 + 2);

        let pending = entries.into_iter().map(|(id, entry)| {
            let reason = reason.clone();
            async move {
                let SinkEntry { tx, mut task, .. } = entry;
                if time::timeout(budget, tx.send(StreamEvent::Stopped(reason)))
                    .await
                    .is_err()
                {
                    warn!("Sink {} did not take the stop notification", id);
                }
                drop(tx);

                if time::timeout(drain_budget, &mut task).await.is_err() {
                    warn!("Sink {} did not finish in {:?}, aborting", id, drain_budget);
                    task.abort();
                }
            }
        });
        futures::future::join_all(pending).await;
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).sinks.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        lock(&self.registry)
            .sinks
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: *id,
                kind: entry.kind,
                frames_delivered: entry.stats.delivered.load(Ordering::Relaxed),
                frames_dropped: entry.stats.dropped.load(Ordering::Relaxed),
                last_error: entry
                    .stats
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map(|e| e.to_string()),
            })
            .collect()
    }
}

/// Delivery task of one sink
async fn deliver(
    id: SubscriptionId,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<StreamEvent>,
    stats: Arc<SinkStats>,
    write_timeout: Duration,
    registry: Weak<Mutex<Registry>>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Frame(frame) => {
                let result = match time::timeout(write_timeout, sink.write_frame(&frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout(write_timeout)),
                };
                if let Err(e) = result {
                    info!("Sink {} ({:?}) detached: {}", id, sink.kind(), e);
                    *stats.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                    if let Some(registry) = registry.upgrade() {
                        lock(&registry).sinks.remove(&id);
                    }
                    return;
                }
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            StreamEvent::Stopped(reason) => {
                match time::timeout(write_timeout, sink.close(&reason)).await {
                    Ok(Ok(())) => debug!("Sink {} notified: {}", id, reason),
                    Ok(Err(e)) => debug!("Sink {} stop notification failed: {}", id, e),
                    Err(_) => debug!("Sink {} stop notification timed out", id),
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::testing::{encoded, RecordingSink};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn fans_out_in_production_order() {
        let broadcaster = Broadcaster::new(32, TIMEOUT);
        let logs: Vec<_> = (0..3)
            .map(|_| {
                let (sink, log) = RecordingSink::new();
                broadcaster.subscribe(Box::new(sink)).unwrap();
                log
            })
            .collect();

        for seq in 1..=20 {
            let report = broadcaster.publish(encoded(seq));
            assert_eq!(report.queued, 3);
        }
        broadcaster.close(StopReason::Cancelled).await;

        let expected: Vec<u64> = (1..=20).collect();
        for log in logs {
            assert_eq!(log.sequences(), expected);
            assert_eq!(log.stopped(), Some(StopReason::Cancelled));
        }
    }

    #[tokio::test]
    async fn failing_sink_is_pruned() {
        let broadcaster = Broadcaster::new(16, TIMEOUT);
        let (healthy, healthy_log) = RecordingSink::new();
        let (broken, broken_log) = RecordingSink::failing_after(2);
        broadcaster.subscribe(Box::new(healthy)).unwrap();
        broadcaster.subscribe(Box::new(broken)).unwrap();

        for seq in 1..=5 {
            broadcaster.publish(encoded(seq));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(healthy_log.sequences(), vec![1, 2, 3, 4, 5]);
        assert_eq!(broken_log.sequences(), vec![1, 2]);

        // the removed sink gets no terminal notification
        broadcaster.close(StopReason::Cancelled).await;
        assert_eq!(broken_log.stopped(), None);
        assert_eq!(healthy_log.stopped(), Some(StopReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_only_loses_its_own_frames() {
        let broadcaster = Broadcaster::new(2, Duration::from_secs(5));
        let (fast, fast_log) = RecordingSink::new();
        let (slow, slow_log) = RecordingSink::slow(Duration::from_secs(1));
        broadcaster.subscribe(Box::new(fast)).unwrap();
        let slow_id = broadcaster.subscribe(Box::new(slow)).unwrap();

        for seq in 1..=10 {
            broadcaster.publish(encoded(seq));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(fast_log.sequences(), (1..=10).collect::<Vec<_>>());
        let slow_info = broadcaster
            .subscriptions()
            .into_iter()
            .find(|info| info.id == slow_id)
            .unwrap();
        assert!(slow_info.frames_dropped > 0);

        let seen = slow_log.sequences();
        assert!(seen.len() < 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_during_publish_is_safe() {
        let broadcaster = Arc::new(Broadcaster::new(256, TIMEOUT));
        let (stable, stable_log) = RecordingSink::new();
        broadcaster.subscribe(Box::new(stable)).unwrap();

        let churn = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let (sink, _log) = RecordingSink::new();
                    let id = broadcaster.subscribe(Box::new(sink)).unwrap();
                    tokio::task::yield_now().await;
                    broadcaster.unsubscribe(id);
                }
            })
        };

        for seq in 1..=200 {
            broadcaster.publish(encoded(seq));
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();
        broadcaster.close(StopReason::Cancelled).await;

        assert_eq!(stable_log.sequences(), (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broadcaster = Broadcaster::new(8, TIMEOUT);
        let (sink, log) = RecordingSink::new();
        let id = broadcaster.subscribe(Box::new(sink)).unwrap();

        broadcaster.publish(encoded(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));

        let report = broadcaster.publish(encoded(2));
        assert_eq!(report, PublishReport::default());
        assert_eq!(log.sequences(), vec![1]);
    }

    #[tokio::test]
    async fn closed_broadcaster_rejects_subscribers() {
        let broadcaster = Broadcaster::new(4, TIMEOUT);
        broadcaster.close(StopReason::LiveViewOff).await;

        let (sink, _log) = RecordingSink::new();
        assert_eq!(broadcaster.subscribe(Box::new(sink)).unwrap_err(), SinkError::Closed);
        assert!(broadcaster.is_closed());
        assert_eq!(broadcaster.publish(encoded(1)).queued, 0);

        let (sink, _log) = RecordingSink::new();
        let returned = broadcaster.try_subscribe(Box::new(sink)).err().unwrap();
        assert_eq!(returned.kind(), TransportKind::Socket);
    }
}
