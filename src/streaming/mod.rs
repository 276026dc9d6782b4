/*!
 * Streaming Module
 *
 * Live view capture loop and fan-out to connected consumers.
 * Coordinates acquisition, encoding, pacing and delivery.
 */

pub mod broadcaster;
pub mod stream_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{Broadcaster, FrameSink, SinkError, SubscriptionId, SubscriptionInfo};
pub use stream_manager::{AutoSubscriber, StreamHandle, StreamManager, StreamStats};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CameraError, Result};
use crate::video::{EncodedFrame, DEFAULT_QUALITY, MAX_OUTPUT_DIMENSION, MAX_QUALITY};

/// Shortest pause between two capture iterations
pub const MIN_FRAME_DELAY: Duration = Duration::from_millis(1);

/// Stream configuration requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Target frame rate (frames per second)
    pub fps: u32,
    /// JPEG quality (0-100)
    pub quality: u8,
    /// Output box width
    pub width: u32,
    /// Output box height
    pub height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            quality: DEFAULT_QUALITY,
            width: 640,
            height: 480,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 || self.fps > 1000 {
            return Err(CameraError::InvalidParameter(format!(
                "fps must be within 1..=1000, got {}",
                self.fps
            )));
        }
        if self.quality > MAX_QUALITY {
            return Err(CameraError::InvalidParameter(format!(
                "quality must be within 0..={}, got {}",
                MAX_QUALITY, self.quality
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::InvalidParameter(format!(
                "output size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > MAX_OUTPUT_DIMENSION || self.height > MAX_OUTPUT_DIMENSION {
            return Err(CameraError::InvalidParameter(format!(
                "output size must be at most {max}x{max}, got {}x{}",
                self.width,
                self.height,
                max = MAX_OUTPUT_DIMENSION
            )));
        }
        Ok(())
    }

    /// Nominal time between frames, whole milliseconds
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

/// Pipeline tuning shared by every stream
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Consecutive failed iterations before the loop gives up
    pub max_consecutive_errors: u32,
    /// Frames queued per sink before that sink starts missing frames
    pub sink_buffer: usize,
    /// Longest a single sink write may take
    pub sink_write_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            sink_buffer: 4,
            sink_write_timeout: Duration::from_secs(1),
        }
    }
}

/// Consumer transport shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Multipart,
    Socket,
    BroadcastChannel,
}

/// Why a stream stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on request
    Cancelled,
    /// The device left live view
    LiveViewOff,
    /// The session was closed underneath the stream
    SessionClosed,
    /// Too many consecutive failures
    Failed(CameraError),
}

impl StopReason {
    pub fn is_error(&self) -> bool {
        matches!(self, StopReason::Failed(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("stopped"),
            StopReason::LiveViewOff => f.write_str("live view turned off"),
            StopReason::SessionClosed => f.write_str("session closed"),
            StopReason::Failed(e) => write!(f, "stream failed: {}", e),
        }
    }
}

/// Item delivered to a sink
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Arc<EncodedFrame>),
    /// Terminal notification; nothing follows it
    Stopped(StopReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_default() {
        let config = StreamConfig::default();
        assert_eq!(config.fps, 30);
        assert_eq!(config.quality, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_interval() {
        let interval = |fps| StreamConfig { fps, ..Default::default() }.frame_interval();
        assert_eq!(interval(1), Duration::from_millis(1000));
        assert_eq!(interval(10), Duration::from_millis(100));
        assert_eq!(interval(30), Duration::from_millis(33));
        assert_eq!(interval(60), Duration::from_millis(16));
    }

    #[test]
    fn test_invalid_configs() {
        let base = StreamConfig::default();
        assert!(StreamConfig { fps: 0, ..base }.validate().is_err());
        assert!(StreamConfig { quality: 101, ..base }.validate().is_err());
        assert!(StreamConfig { width: 0, ..base }.validate().is_err());
        assert!(StreamConfig { width: 100_000, height: 100_000, ..base }.validate().is_err());
        assert!(StreamConfig { height: MAX_OUTPUT_DIMENSION, ..base }.validate().is_ok());
        assert!(StreamConfig { quality: 0, ..base }.validate().is_ok());
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::Cancelled.to_string(), "stopped");
        let failed = StopReason::Failed(CameraError::Device("usb".into()));
        assert!(failed.is_error());
        assert_eq!(failed.to_string(), "stream failed: Device error: usb");
    }
}
