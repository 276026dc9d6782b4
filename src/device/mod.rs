//! Device driver boundary.
//!
//! The physical camera is an external collaborator. The pipeline only sees
//! it through [`SessionCommands`] and [`FrameSource`]; any driver that
//! implements both is a [`CameraDevice`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::video::RawFrame;

pub mod mock;
pub mod simulated;

pub use mock::{MockCamera, MockRead};
pub use simulated::SimulatedCamera;

/// Opaque handle naming one physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mode flags as reported by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub open: bool,
    pub live_view_on: bool,
    pub filming: bool,
}

/// Session and mode commands of the driver layer
pub trait SessionCommands: Send {
    /// Open an exclusive session. Fails with `DeviceNotFound` or `DeviceBusy`.
    fn open(&mut self, device: &DeviceId) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn status(&self) -> DeviceStatus;

    /// Device opened when the caller does not name one
    fn default_device(&self) -> Option<DeviceId>;

    fn start_filming(&mut self) -> Result<()>;

    fn stop_filming(&mut self) -> Result<()>;
}

/// Live view frame source. Never paced internally; callers decide when to
/// ask for the next frame.
pub trait FrameSource: Send {
    /// Whether the device is currently producing live view
    fn is_active(&self) -> bool;

    /// Turn live view on
    fn start(&mut self) -> Result<()>;

    /// Turn live view off
    fn stop(&mut self) -> Result<()>;

    /// Next frame, `Ok(None)` when nothing is available right now
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// A complete camera driver
pub trait CameraDevice: SessionCommands + FrameSource {}

impl<T: SessionCommands + FrameSource> CameraDevice for T {}
