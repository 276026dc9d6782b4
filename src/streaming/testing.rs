//! Sinks for exercising the pipeline in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{FrameSink, SinkError, StopReason, TransportKind};
use crate::video::EncodedFrame;

pub(crate) fn encoded(sequence: u64) -> Arc<EncodedFrame> {
    Arc::new(EncodedFrame {
        data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
        width: 4,
        height: 4,
        quality: 80,
        sequence,
        timestamp_ms: sequence,
    })
}

/// What a [`RecordingSink`] saw
#[derive(Debug, Default)]
pub(crate) struct SinkLog {
    frames: Mutex<Vec<(u64, Instant)>>,
    stopped: Mutex<Option<StopReason>>,
}

impl SinkLog {
    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|(seq, _)| *seq).collect()
    }

    pub(crate) fn times(&self) -> Vec<Instant> {
        self.frames.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub(crate) fn stopped(&self) -> Option<StopReason> {
        self.stopped.lock().unwrap().clone()
    }
}

pub(crate) struct RecordingSink {
    log: Arc<SinkLog>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl RecordingSink {
    pub(crate) fn new() -> (Self, Arc<SinkLog>) {
        let log = Arc::new(SinkLog::default());
        let sink = Self {
            log: Arc::clone(&log),
            delay: None,
            fail_after: None,
        };
        (sink, log)
    }

    /// Every write takes `delay`
    pub(crate) fn slow(delay: Duration) -> (Self, Arc<SinkLog>) {
        let (mut sink, log) = Self::new();
        sink.delay = Some(delay);
        (sink, log)
    }

    /// Writes fail once `count` frames went through
    pub(crate) fn failing_after(count: usize) -> (Self, Arc<SinkLog>) {
        let (mut sink, log) = Self::new();
        sink.fail_after = Some(count);
        (sink, log)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), SinkError> {
        if let Some(limit) = self.fail_after {
            if self.log.frames.lock().unwrap().len() >= limit {
                return Err(SinkError::Io("broken pipe".into()));
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log.frames.lock().unwrap().push((frame.sequence, Instant::now()));
        Ok(())
    }

    async fn close(&mut self, reason: &StopReason) -> Result<(), SinkError> {
        *self.log.stopped.lock().unwrap() = Some(reason.clone());
        Ok(())
    }
}
