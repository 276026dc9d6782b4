//! Device session and live view mode state.
//!
//! [`SessionManager`] is the single owner of the camera driver. Every
//! operation takes one lock, checks the session precondition and issues the
//! device call under the same hold, so a concurrent close can never slip in
//! between the check and the command. Status reads go to a snapshot behind
//! its own lock and never wait for a device call.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::{CameraDevice, DeviceId};
use crate::error::{CameraError, Result};
use crate::video::RawFrame;

/// Session status as reported to clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_open: bool,
    pub live_view_on: bool,
    pub is_filming: bool,
    pub main_camera: Option<String>,
}

/// Outcome of one live view read
#[derive(Debug)]
pub enum LiveRead {
    /// The device is no longer in live view
    Off,
    /// Live view is on but no frame was ready
    Empty,
    Frame(RawFrame),
}

struct SessionInner {
    device: Box<dyn CameraDevice>,
    active_device: Option<DeviceId>,
    live_view_on: bool,
    filming: bool,
}

impl SessionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.active_device.is_none() {
            return Err(CameraError::NoSessionOpen);
        }
        Ok(())
    }

    fn reset_modes(&mut self) {
        self.live_view_on = false;
        self.filming = false;
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            session_open: self.active_device.is_some(),
            live_view_on: self.live_view_on,
            is_filming: self.filming,
            main_camera: self.active_device.as_ref().map(|d| d.to_string()),
        }
    }
}

/// Process-wide owner of the camera session
pub struct SessionManager {
    inner: Mutex<SessionInner>,
    /// Mirror of the mode flags, updated before `inner` is released
    status: Mutex<SessionStatus>,
}

impl SessionManager {
    pub fn new(device: Box<dyn CameraDevice>) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                device,
                active_device: None,
                live_view_on: false,
                filming: false,
            }),
            status: Mutex::new(SessionStatus::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &SessionInner) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = inner.snapshot();
    }

    /// Open a session on `device`, or on the driver's default device.
    pub fn open(&self, device: Option<DeviceId>) -> Result<DeviceId> {
        let mut inner = self.lock();
        if let Some(active) = &inner.active_device {
            return Err(CameraError::DeviceBusy(format!(
                "session already open on {}",
                active
            )));
        }

        let device = match device {
            Some(device) => device,
            None => inner
                .device
                .default_device()
                .ok_or_else(|| CameraError::DeviceNotFound("no camera connected".into()))?,
        };

        inner.device.open(&device)?;
        inner.active_device = Some(device.clone());
        inner.reset_modes();
        self.publish(&inner);
        info!("Session opened on {}", device);
        Ok(device)
    }

    /// Close the session, leaving live view first if needed.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;

        if inner.live_view_on {
            if let Err(e) = inner.device.stop() {
                warn!("Failed to stop live view while closing session: {}", e);
            }
        }
        inner.device.close()?;

        let device = inner.active_device.take();
        inner.reset_modes();
        self.publish(&inner);
        info!("Session closed on {}", device.map(|d| d.to_string()).unwrap_or_default());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status().session_open
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Turn live view on. Idempotent while already on.
    pub fn start_live_view(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if inner.live_view_on && inner.device.is_active() {
            debug!("Live view already on");
            return Ok(());
        }
        inner.device.start()?;
        inner.live_view_on = true;
        self.publish(&inner);
        info!("Live view started");
        Ok(())
    }

    /// Turn live view (and filming with it) off. Always reaches the device.
    pub fn stop_live_view(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if inner.filming {
            if let Err(e) = inner.device.stop_filming() {
                warn!("Failed to stop filming before live view: {}", e);
            }
        }
        let result = inner.device.stop();
        inner.reset_modes();
        self.publish(&inner);
        result?;
        info!("Live view stopped");
        Ok(())
    }

    /// Start filming; live view must already be on.
    pub fn start_filming(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if !inner.live_view_on {
            return Err(CameraError::DeviceNotReady(
                "live view must be on before filming".into(),
            ));
        }
        inner.device.start_filming()?;
        inner.filming = true;
        self.publish(&inner);
        info!("Filming started");
        Ok(())
    }

    pub fn stop_filming(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.device.stop_filming()?;
        inner.filming = false;
        self.publish(&inner);
        info!("Filming stopped");
        Ok(())
    }

    /// One read for the capture loop: reports `Off` once the device has left
    /// live view.
    pub fn next_live_frame(&self) -> Result<LiveRead> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if !inner.live_view_on || !inner.device.is_active() {
            inner.reset_modes();
            self.publish(&inner);
            return Ok(LiveRead::Off);
        }
        Ok(match inner.device.next_frame()? {
            Some(frame) => LiveRead::Frame(frame),
            None => LiveRead::Empty,
        })
    }

    /// One read outside the capture loop.
    pub fn next_frame(&self) -> Result<RawFrame> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.device.next_frame()?.ok_or(CameraError::NoFrameAvailable)
    }
}
