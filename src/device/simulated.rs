//! Simulated camera producing a moving test pattern, for running the server
//! without hardware attached.

use tracing::{debug, info};

use super::{DeviceId, DeviceStatus, FrameSource, SessionCommands};
use crate::error::{CameraError, Result};
use crate::video::{PixelFormat, RawFrame};

pub const SIMULATED_DEVICE_ID: &str = "sim-0";

/// Six bands of 32 pixels
const BAND_PERIOD: u64 = 192;

pub struct SimulatedCamera {
    id: DeviceId,
    width: u32,
    height: u32,
    session_open: bool,
    live_view: bool,
    filming: bool,
    sequence: u64,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        info!("Creating simulated camera {} ({}x{})", SIMULATED_DEVICE_ID, width, height);
        Self {
            id: DeviceId::new(SIMULATED_DEVICE_ID),
            width: width.max(1),
            height: height.max(1),
            session_open: false,
            live_view: false,
            filming: false,
            sequence: 0,
        }
    }

    /// Diagonal colour bars that scroll one step per frame
    fn render(&self) -> Vec<u8> {
        // the pattern repeats every BAND_PERIOD pixels
        let shift = (self.sequence % (BAND_PERIOD / 4)) * 4;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as u64 {
            for x in 0..self.width as u64 {
                let band = ((x + y + shift) / 32) % 6;
                let pixel = match band {
                    0 => [230, 60, 60],
                    1 => [230, 200, 60],
                    2 => [60, 200, 90],
                    3 => [60, 180, 230],
                    4 => [90, 70, 230],
                    _ => [200, 60, 200],
                };
                data.extend_from_slice(&pixel);
            }
        }
        data
    }
}

impl SessionCommands for SimulatedCamera {
    fn open(&mut self, device: &DeviceId) -> Result<()> {
        if device != &self.id {
            return Err(CameraError::DeviceNotFound(device.to_string()));
        }
        if self.session_open {
            return Err(CameraError::DeviceBusy(device.to_string()));
        }
        self.session_open = true;
        info!("Simulated camera session opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.session_open {
            return Err(CameraError::NoSessionOpen);
        }
        self.session_open = false;
        self.live_view = false;
        self.filming = false;
        info!("Simulated camera session closed");
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            open: self.session_open,
            live_view_on: self.live_view,
            filming: self.filming,
        }
    }

    fn default_device(&self) -> Option<DeviceId> {
        Some(self.id.clone())
    }

    fn start_filming(&mut self) -> Result<()> {
        if !self.live_view {
            return Err(CameraError::DeviceNotReady("Camera is not in film mode".into()));
        }
        self.filming = true;
        Ok(())
    }

    fn stop_filming(&mut self) -> Result<()> {
        self.filming = false;
        Ok(())
    }
}

impl FrameSource for SimulatedCamera {
    fn is_active(&self) -> bool {
        self.session_open && self.live_view
    }

    fn start(&mut self) -> Result<()> {
        if !self.session_open {
            return Err(CameraError::NoSessionOpen);
        }
        self.live_view = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.live_view = false;
        self.filming = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.is_active() {
            return Ok(None);
        }
        self.sequence += 1;
        debug!("Simulated frame {}", self.sequence);
        Ok(Some(RawFrame::new(
            self.render(),
            self.width,
            self.height,
            PixelFormat::RGB24,
            self.sequence,
        )))
    }
}
