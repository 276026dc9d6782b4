//! Command line and environment configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::streaming::{PipelineConfig, StreamConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "liveview-bridge")]
#[command(about = "Camera live view streaming bridge", long_about = None)]
pub struct Config {
    /// HTTP listen address
    #[arg(long, env = "LIVEVIEW_BIND", default_value = "0.0.0.0:7000")]
    pub bind: SocketAddr,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LIVEVIEW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Default target frame rate
    #[arg(long, env = "LIVEVIEW_FPS", default_value_t = 30)]
    pub fps: u32,

    /// Default JPEG quality (0-100)
    #[arg(long, env = "LIVEVIEW_QUALITY", default_value_t = 80,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    pub quality: u8,

    /// Default output box width
    #[arg(long, env = "LIVEVIEW_WIDTH", default_value_t = 640)]
    pub width: u32,

    /// Default output box height
    #[arg(long, env = "LIVEVIEW_HEIGHT", default_value_t = 480)]
    pub height: u32,

    /// Consecutive failed captures before a stream is stopped
    #[arg(long, env = "LIVEVIEW_MAX_CONSECUTIVE_ERRORS", default_value_t = 3)]
    pub max_consecutive_errors: u32,

    /// Frames queued per consumer before it starts missing frames
    #[arg(long, env = "LIVEVIEW_SINK_BUFFER", default_value_t = 4)]
    pub sink_buffer: usize,

    /// Longest a single consumer write may take (ms)
    #[arg(long, env = "LIVEVIEW_SINK_WRITE_TIMEOUT_MS", default_value_t = 1000)]
    pub sink_write_timeout_ms: u64,

    /// Pending messages per broadcast channel subscriber
    #[arg(long, env = "LIVEVIEW_HUB_CAPACITY", default_value_t = 16)]
    pub hub_capacity: usize,

    /// Simulated camera sensor width
    #[arg(long, env = "LIVEVIEW_SIM_WIDTH", default_value_t = 1920)]
    pub sim_width: u32,

    /// Simulated camera sensor height
    #[arg(long, env = "LIVEVIEW_SIM_HEIGHT", default_value_t = 1080)]
    pub sim_height: u32,
}

impl Config {
    /// Defaults applied to stream requests that omit parameters
    pub fn stream_defaults(&self) -> StreamConfig {
        StreamConfig {
            fps: self.fps,
            quality: self.quality,
            width: self.width,
            height: self.height,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_consecutive_errors: self.max_consecutive_errors,
            sink_buffer: self.sink_buffer,
            sink_write_timeout: Duration::from_millis(self.sink_write_timeout_ms),
        }
    }
}
