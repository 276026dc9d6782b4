//! Scripted camera used by the test suites.
//!
//! Clones share state, so a test can hand one clone to the session manager
//! and keep another to script reads and inspect call counts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{DeviceId, DeviceStatus, FrameSource, SessionCommands};
use crate::error::{CameraError, Result};
use crate::video::{PixelFormat, RawFrame};

pub const MOCK_DEVICE_ID: &str = "mock-0";

/// One scripted answer to `next_frame`
#[derive(Debug, Clone)]
pub enum MockRead {
    /// A well-formed frame
    Frame,
    /// Nothing available this time
    Empty,
    /// A frame whose buffer does not match its geometry
    Garbage,
    /// The driver call fails
    Fail(CameraError),
    /// The device drops out of live view
    LiveViewOff,
}

/// Number of calls made into each driver entry point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open: u32,
    pub close: u32,
    pub start: u32,
    pub stop: u32,
    pub next_frame: u32,
    pub start_filming: u32,
    pub stop_filming: u32,
}

impl CallCounts {
    /// Calls that reach the device (status queries excluded)
    pub fn total(&self) -> u32 {
        self.open
            + self.close
            + self.start
            + self.stop
            + self.next_frame
            + self.start_filming
            + self.stop_filming
    }
}

#[derive(Debug)]
struct MockState {
    status: DeviceStatus,
    script: VecDeque<MockRead>,
    fallback: MockRead,
    /// Time every `next_frame` blocks before answering
    read_delay: Duration,
    width: u32,
    height: u32,
    sequence: u64,
    calls: CallCounts,
}

#[derive(Debug, Clone)]
pub struct MockCamera {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(32, 18)
    }
}

impl MockCamera {
    /// Camera producing `width`x`height` RGB frames once the script runs out
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                status: DeviceStatus::default(),
                script: VecDeque::new(),
                fallback: MockRead::Frame,
                read_delay: Duration::ZERO,
                width,
                height,
                sequence: 0,
                calls: CallCounts::default(),
            })),
        }
    }

    /// Queue reads served before the fallback
    pub fn script(&self, reads: impl IntoIterator<Item = MockRead>) {
        self.lock().script.extend(reads);
    }

    /// Answer used once the script is exhausted
    pub fn set_fallback(&self, read: MockRead) {
        self.lock().fallback = read;
    }

    /// Make every read block like a slow USB transfer
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(MOCK_DEVICE_ID)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionCommands for MockCamera {
    fn open(&mut self, device: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        state.calls.open += 1;
        if device.as_str() != MOCK_DEVICE_ID {
            return Err(CameraError::DeviceNotFound(device.to_string()));
        }
        if state.status.open {
            return Err(CameraError::DeviceBusy(device.to_string()));
        }
        state.status.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.close += 1;
        state.status = DeviceStatus::default();
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        self.lock().status
    }

    fn default_device(&self) -> Option<DeviceId> {
        Some(self.device_id())
    }

    fn start_filming(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.start_filming += 1;
        state.status.filming = true;
        Ok(())
    }

    fn stop_filming(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.stop_filming += 1;
        state.status.filming = false;
        Ok(())
    }
}

impl FrameSource for MockCamera {
    fn is_active(&self) -> bool {
        let state = self.lock();
        state.status.open && state.status.live_view_on
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.start += 1;
        state.status.live_view_on = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.stop += 1;
        state.status.live_view_on = false;
        state.status.filming = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        state.calls.next_frame += 1;
        let read = match state.script.pop_front() {
            Some(read) => read,
            None => state.fallback.clone(),
        };

        match read {
            MockRead::Frame => {
                state.sequence += 1;
                let (width, height) = (state.width, state.height);
                let shade = (state.sequence % 256) as u8;
                let data = vec![shade; (width * height * 3) as usize];
                Ok(Some(RawFrame::new(data, width, height, PixelFormat::RGB24, state.sequence)))
            }
            MockRead::Empty => Ok(None),
            MockRead::Garbage => {
                state.sequence += 1;
                Ok(Some(RawFrame::new(
                    vec![0u8; 7],
                    state.width,
                    state.height,
                    PixelFormat::RGB24,
                    state.sequence,
                )))
            }
            MockRead::Fail(err) => Err(err),
            MockRead::LiveViewOff => {
                state.status.live_view_on = false;
                Ok(None)
            }
        }
    }
}
