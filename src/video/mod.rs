/*!
 * Video Module
 *
 * Raw frame representation and the resize/encode stage of the live view
 * pipeline.
 */

pub mod frame;
pub mod processor;

pub use frame::{PixelFormat, RawFrame};
pub use processor::{fit_dimensions, EncodedFrame, FrameProcessor};

/// Default JPEG quality for live view frames
pub const DEFAULT_QUALITY: u8 = 80;

/// Highest accepted JPEG quality
pub const MAX_QUALITY: u8 = 100;

/// Largest accepted output width or height
pub const MAX_OUTPUT_DIMENSION: u32 = 4096;
