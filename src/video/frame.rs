/*!
 * Video Frame Representation
 *
 * Raw frames as delivered by the device driver layer.
 */

use image::{ImageFormat, RgbImage};

use crate::error::{CameraError, Result};

/// Pixel format for raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA 8-bit per channel
    BGRA,
    /// RGBA 8-bit per channel
    RGBA,
    /// RGB 24-bit
    RGB24,
    /// Compressed JPEG (most live view drivers hand these out as-is)
    JPEG,
}

impl PixelFormat {
    /// Get bytes per pixel, `None` for compressed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::BGRA | PixelFormat::RGBA => Some(4),
            PixelFormat::RGB24 => Some(3),
            PixelFormat::JPEG => None,
        }
    }

    /// Check if this format has an alpha channel
    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::BGRA | PixelFormat::RGBA)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::JPEG)
    }
}

/// Raw frame as read from the device
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// Timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
    /// Frame sequence number
    pub sequence: u64,
}

impl RawFrame {
    /// Create a new raw frame stamped with the current time
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            timestamp_ms: now_ms(),
            sequence,
        }
    }

    /// Get expected data size for this frame (`None` when compressed)
    pub fn expected_size(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }

    /// Validate frame data size
    pub fn is_valid(&self) -> bool {
        if self.width == 0 || self.height == 0 || self.data.is_empty() {
            return false;
        }
        match self.expected_size() {
            Some(expected) => self.data.len() == expected,
            None => true,
        }
    }

    /// Decode into a packed RGB image.
    ///
    /// Fails with `FrameDecode` when the buffer does not match its declared
    /// geometry or the compressed payload is corrupt.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        if !self.is_valid() {
            return Err(CameraError::FrameDecode(format!(
                "frame {} has {} bytes for {}x{} {:?}",
                self.sequence,
                self.data.len(),
                self.width,
                self.height,
                self.format
            )));
        }

        let rgb = match self.format {
            PixelFormat::RGB24 => self.data.clone(),
            PixelFormat::RGBA => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::BGRA => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::JPEG => {
                let decoded = image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)
                    .map_err(|e| CameraError::FrameDecode(e.to_string()))?;
                return Ok(decoded.to_rgb8());
            }
        };

        RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| {
            CameraError::FrameDecode(format!("frame {} buffer too small", self.sequence))
        })
    }
}

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format() {
        assert_eq!(PixelFormat::BGRA.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::RGBA.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::RGB24.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::JPEG.bytes_per_pixel(), None);
        assert!(PixelFormat::BGRA.has_alpha());
        assert!(!PixelFormat::RGB24.has_alpha());
        assert!(PixelFormat::JPEG.is_compressed());
    }

    #[test]
    fn test_raw_frame_creation() {
        let data = vec![0u8; 1920 * 1080 * 3];
        let frame = RawFrame::new(data, 1920, 1080, PixelFormat::RGB24, 0);

        assert_eq!(frame.width, 1920);
        assert_eq!(frame.height, 1080);
        assert!(frame.is_valid());
        assert!(frame.timestamp_ms > 0);
    }

    #[test]
    fn test_bgra_to_rgb() {
        let data = vec![10, 20, 30, 40, 255, 128, 64, 255]; // 2 BGRA pixels
        let frame = RawFrame::new(data, 2, 1, PixelFormat::BGRA, 0);

        let rgb = frame.to_rgb_image().unwrap();
        assert_eq!(rgb.as_raw(), &vec![30, 20, 10, 64, 128, 255]);
    }

    #[test]
    fn test_frame_validation() {
        let data = vec![0u8; 100]; // Too small
        let frame = RawFrame::new(data, 1920, 1080, PixelFormat::BGRA, 7);
        assert!(!frame.is_valid());
        assert!(matches!(frame.to_rgb_image(), Err(CameraError::FrameDecode(_))));
    }

    #[test]
    fn test_corrupt_jpeg() {
        let frame = RawFrame::new(vec![0xFF, 0xD8, 0x00, 0x01], 4, 4, PixelFormat::JPEG, 1);
        assert!(frame.is_valid());
        assert!(matches!(frame.to_rgb_image(), Err(CameraError::FrameDecode(_))));
    }
}
