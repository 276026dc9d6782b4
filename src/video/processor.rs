/*!
 * Frame Processor
 *
 * Aspect-preserving resize and JPEG encode of raw live view frames.
 */

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::ColorType;
use tracing::debug;

use super::frame::{now_ms, RawFrame};
use super::{MAX_OUTPUT_DIMENSION, MAX_QUALITY};
use crate::error::{CameraError, Result};

/// Encoded frame ready for the wire
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG data
    pub data: Bytes,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// JPEG quality used (0-100)
    pub quality: u8,
    /// Sequence number of the source frame
    pub sequence: u64,
    /// Capture timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fit a `src_w`x`src_h` image inside a `target_w`x`target_h` box.
///
/// A box wider than the source fits to height, otherwise to width. The
/// result is the fitted box itself, never letterboxed.
pub fn fit_dimensions(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    let (sw, sh) = (src_w as u64, src_h as u64);
    let (tw, th) = (target_w as u64, target_h as u64);

    // tw/th > sw/sh, cross-multiplied to stay exact
    if tw * sh > sw * th {
        let width = (th * sw / sh).max(1);
        (width as u32, target_h)
    } else {
        let height = (tw * sh / sw).max(1);
        (target_w, height as u32)
    }
}

/// Resizes and encodes raw frames. Stateless, safe to share across tasks.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    filter: FilterType,
}

impl Default for FrameProcessor {
    fn default() -> Self {
        // Closest match to high quality bicubic
        Self { filter: FilterType::CatmullRom }
    }
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    /// Resize `frame` into the target box and encode it at `quality`.
    pub fn process(
        &self,
        frame: &RawFrame,
        target_width: u32,
        target_height: u32,
        quality: u8,
    ) -> Result<EncodedFrame> {
        validate_request(target_width, target_height, quality)?;

        let rgb = frame.to_rgb_image()?;
        let (width, height) = fit_dimensions(rgb.width(), rgb.height(), target_width, target_height);

        let resized = if (width, height) == rgb.dimensions() {
            rgb
        } else {
            imageops::resize(&rgb, width, height, self.filter)
        };

        let mut jpeg = Vec::with_capacity(width as usize * height as usize / 4);
        // The JPEG encoder's scale starts at 1
        JpegEncoder::new_with_quality(&mut jpeg, quality.max(1))
            .encode(resized.as_raw(), width, height, ColorType::Rgb8)
            .map_err(|e| CameraError::Encode(e.to_string()))?;

        debug!(
            "Encoded frame {}: {}x{} -> {}x{} q{} ({} bytes)",
            frame.sequence,
            frame.width,
            frame.height,
            width,
            height,
            quality,
            jpeg.len()
        );

        Ok(EncodedFrame {
            data: Bytes::from(jpeg),
            width,
            height,
            quality,
            sequence: frame.sequence,
            timestamp_ms: if frame.timestamp_ms > 0 { frame.timestamp_ms } else { now_ms() },
        })
    }

    /// Encode without resizing.
    pub fn encode_native(&self, frame: &RawFrame, quality: u8) -> Result<EncodedFrame> {
        let rgb_dims = if frame.format.is_compressed() {
            let rgb = frame.to_rgb_image()?;
            rgb.dimensions()
        } else {
            (frame.width, frame.height)
        };
        self.process(frame, rgb_dims.0.max(1), rgb_dims.1.max(1), quality)
    }
}

fn validate_request(width: u32, height: u32, quality: u8) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(CameraError::InvalidParameter(format!(
            "output size must be positive, got {}x{}",
            width, height
        )));
    }
    if width > MAX_OUTPUT_DIMENSION || height > MAX_OUTPUT_DIMENSION {
        return Err(CameraError::InvalidParameter(format!(
            "output size must be at most {max}x{max}, got {}x{}",
            width,
            height,
            max = MAX_OUTPUT_DIMENSION
        )));
    }
    if quality > MAX_QUALITY {
        return Err(CameraError::InvalidParameter(format!(
            "quality must be within 0..={}, got {}",
            MAX_QUALITY, quality
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PixelFormat;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128]);
            }
        }
        RawFrame::new(data, width, height, PixelFormat::RGB24, 1)
    }

    #[test]
    fn fit_width_bound() {
        assert_eq!(fit_dimensions(1920, 1080, 640, 480), (640, 360));
        assert_eq!(fit_dimensions(1920, 1080, 640, 1080), (640, 360));
    }

    #[test]
    fn fit_height_bound() {
        assert_eq!(fit_dimensions(1080, 1920, 640, 480), (270, 480));
        assert_eq!(fit_dimensions(1920, 1080, 1920, 480), (853, 480));
    }

    #[test]
    fn fit_same_aspect_keeps_box() {
        assert_eq!(fit_dimensions(1600, 1200, 800, 600), (800, 600));
    }

    #[test]
    fn fit_never_collapses_to_zero() {
        assert_eq!(fit_dimensions(10_000, 1, 100, 100), (100, 1));
        assert_eq!(fit_dimensions(1, 10_000, 100, 100), (1, 100));
    }

    #[test]
    fn process_resizes_and_encodes_jpeg() {
        let processor = FrameProcessor::new();
        let encoded = processor.process(&gradient(192, 108), 64, 48, 70).unwrap();

        assert_eq!((encoded.width, encoded.height), (64, 36));
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
        assert_eq!(encoded.sequence, 1);

        let decoded = image::load_from_memory(&encoded.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 36));
    }

    #[test]
    fn quality_changes_size() {
        let processor = FrameProcessor::new();
        let frame = gradient(160, 120);
        let low = processor.process(&frame, 160, 120, 5).unwrap();
        let high = processor.process(&frame, 160, 120, 95).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn zero_quality_is_accepted() {
        let processor = FrameProcessor::new();
        assert!(processor.process(&gradient(16, 16), 16, 16, 0).is_ok());
    }

    #[test]
    fn rejects_invalid_requests() {
        let processor = FrameProcessor::new();
        let frame = gradient(16, 16);
        assert!(matches!(
            processor.process(&frame, 0, 16, 80),
            Err(CameraError::InvalidParameter(_))
        ));
        assert!(matches!(
            processor.process(&frame, 16, 16, 101),
            Err(CameraError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_oversized_box() {
        let processor = FrameProcessor::new();
        let frame = gradient(192, 108);
        assert!(matches!(
            processor.process(&frame, 100_000, 100_000, 80),
            Err(CameraError::InvalidParameter(_))
        ));
        assert!(matches!(
            processor.process(&frame, 64, MAX_OUTPUT_DIMENSION + 1, 80),
            Err(CameraError::InvalidParameter(_))
        ));

        let largest = processor.process(&frame, MAX_OUTPUT_DIMENSION, 48, 80).unwrap();
        assert_eq!((largest.width, largest.height), (85, 48));
    }

    #[test]
    fn malformed_frame_is_decode_error() {
        let processor = FrameProcessor::new();
        let frame = RawFrame::new(vec![1, 2, 3], 640, 480, PixelFormat::RGB24, 9);
        assert!(matches!(
            processor.process(&frame, 64, 48, 80),
            Err(CameraError::FrameDecode(_))
        ));
    }

    #[test]
    fn jpeg_source_is_reencoded_at_native_size() {
        let processor = FrameProcessor::new();
        let first = processor.process(&gradient(80, 60), 80, 60, 90).unwrap();
        let jpeg = RawFrame::new(first.data.to_vec(), 80, 60, PixelFormat::JPEG, 2);

        let native = processor.encode_native(&jpeg, 50).unwrap();
        assert_eq!((native.width, native.height), (80, 60));
        assert_eq!(native.quality, 50);
    }
}
