/*!
 * LiveView Bridge Library
 *
 * Camera session control and live view streaming to browsers and socket
 * clients.
 */

pub mod config;
pub mod device;
pub mod error;
pub mod server;
pub mod session;
pub mod streaming;
pub mod video;

// Re-export commonly used types
pub use config::Config;
pub use device::{CameraDevice, DeviceId, SimulatedCamera};
pub use error::{CameraError, Result};
pub use server::{router, AppState};
pub use session::{SessionManager, SessionStatus};
pub use streaming::{StreamConfig, StreamManager};
pub use video::{EncodedFrame, FrameProcessor, RawFrame};
