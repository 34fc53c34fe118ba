//! Raw buffer to bitmap conversion.
//!
//! The converter reads a locked `RawFrame` through a `BitmapContext`, which interprets the
//! memory with explicit layout parameters (colour space, bits per component, 32-bit word
//! order, alpha convention) and the buffer's own row stride. Rows may carry padding; only
//! the first `width * 4` bytes of each row are pixel data.
//!
//! Output is an owned RGBA8 image with straight alpha. The raw buffer is free to be
//! recycled as soon as `convert` returns.

use image::{Rgba, RgbaImage};
use thiserror::Error;

use crate::frame::{BitmapImage, LockedPixels, Orientation, PixelFormat, RawFrame};

const BYTES_PER_PIXEL: usize = 4;

/// Per-frame conversion errors. Neither is fatal to the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("could not create a bitmap context: {0}")]
    ContextCreation(String),
    #[error("could not extract an image from the bitmap context: {0}")]
    ImageExtraction(String),
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    DeviceRgb,
}

/// Order of the four bytes of a 32-bit pixel word in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big32,
    Little32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaInfo {
    PremultipliedFirst,
    PremultipliedLast,
    First,
    Last,
    NoneSkipFirst,
    NoneSkipLast,
}

impl AlphaInfo {
    fn alpha_first(self) -> bool {
        matches!(
            self,
            AlphaInfo::PremultipliedFirst | AlphaInfo::First | AlphaInfo::NoneSkipFirst
        )
    }

    fn premultiplied(self) -> bool {
        matches!(
            self,
            AlphaInfo::PremultipliedFirst | AlphaInfo::PremultipliedLast
        )
    }

    fn skipped(self) -> bool {
        matches!(self, AlphaInfo::NoneSkipFirst | AlphaInfo::NoneSkipLast)
    }
}

/// How the bytes of a locked buffer are to be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapInfo {
    pub color_space: ColorSpace,
    pub bits_per_component: u8,
    pub byte_order: ByteOrder,
    pub alpha: AlphaInfo,
}

impl BitmapInfo {
    /// Layout of a 32-bit BGRA capture buffer: little-endian premultiplied ARGB words.
    pub const CAPTURE_BGRA: BitmapInfo = BitmapInfo {
        color_space: ColorSpace::DeviceRgb,
        bits_per_component: 8,
        byte_order: ByteOrder::Little32,
        alpha: AlphaInfo::PremultipliedFirst,
    };

    /// Memory offsets of (r, g, b, a) within one pixel.
    fn channel_offsets(&self) -> [usize; 4] {
        // Logical word order, most significant byte first.
        let (r, g, b, a) = if self.alpha.alpha_first() {
            (1, 2, 3, 0)
        } else {
            (0, 1, 2, 3)
        };
        match self.byte_order {
            ByteOrder::Big32 => [r, g, b, a],
            ByteOrder::Little32 => [3 - r, 3 - g, 3 - b, 3 - a],
        }
    }
}

impl Default for BitmapInfo {
    fn default() -> Self {
        Self::CAPTURE_BGRA
    }
}

// ----------------------------------------------------------------------------
// BitmapContext: validated view over locked memory
// ----------------------------------------------------------------------------

/// A drawing surface over locked buffer memory. Only lives as long as the lock.
struct BitmapContext<'a> {
    bytes: &'a [u8],
    width: u32,
    height: u32,
    bytes_per_row: usize,
    info: BitmapInfo,
}

impl<'a> BitmapContext<'a> {
    fn new(locked: &LockedPixels<'a>, info: BitmapInfo) -> Result<Self, ConvertError> {
        if locked.format() != PixelFormat::Bgra32 {
            return Err(ConvertError::ContextCreation(format!(
                "unsupported pixel format {}",
                locked.format().name()
            )));
        }
        if info.bits_per_component != 8 {
            return Err(ConvertError::ContextCreation(format!(
                "unsupported bits per component {}",
                info.bits_per_component
            )));
        }
        let (width, height) = (locked.width(), locked.height());
        if width == 0 || height == 0 {
            return Err(ConvertError::ContextCreation(format!(
                "empty surface {}x{}",
                width, height
            )));
        }
        let row_len = (width as usize)
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or_else(|| ConvertError::ContextCreation("row length overflow".to_string()))?;
        let bytes_per_row = locked.bytes_per_row();
        if bytes_per_row < row_len {
            return Err(ConvertError::ContextCreation(format!(
                "bytes per row {} below minimum {} for width {}",
                bytes_per_row, row_len, width
            )));
        }
        let required = bytes_per_row
            .checked_mul(height as usize - 1)
            .and_then(|v| v.checked_add(row_len))
            .ok_or_else(|| ConvertError::ContextCreation("buffer size overflow".to_string()))?;
        let bytes = locked.bytes();
        if bytes.len() < required {
            return Err(ConvertError::ContextCreation(format!(
                "buffer holds {} bytes, {}x{} at stride {} needs {}",
                bytes.len(),
                width,
                height,
                bytes_per_row,
                required
            )));
        }
        Ok(Self {
            bytes,
            width,
            height,
            bytes_per_row,
            info,
        })
    }

    /// Copy the surface into an owned RGBA image with straight alpha.
    fn make_image(&self) -> Result<RgbaImage, ConvertError> {
        let [r, g, b, a] = self.info.channel_offsets();
        let row_len = self.width as usize * BYTES_PER_PIXEL;
        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for row in self
            .bytes
            .chunks(self.bytes_per_row)
            .take(self.height as usize)
        {
            for px in row[..row_len].chunks_exact(BYTES_PER_PIXEL) {
                let alpha = if self.info.alpha.skipped() {
                    u8::MAX
                } else {
                    px[a]
                };
                let rgba = if self.info.alpha.premultiplied() {
                    unpremultiply([px[r], px[g], px[b]], alpha)
                } else {
                    Rgba([px[r], px[g], px[b], alpha])
                };
                out.extend_from_slice(&rgba.0);
            }
        }
        RgbaImage::from_raw(self.width, self.height, out).ok_or_else(|| {
            ConvertError::ImageExtraction(format!(
                "pixel data does not fill {}x{}",
                self.width, self.height
            ))
        })
    }
}

fn unpremultiply(rgb: [u8; 3], alpha: u8) -> Rgba<u8> {
    if alpha == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    if alpha == u8::MAX {
        return Rgba([rgb[0], rgb[1], rgb[2], alpha]);
    }
    let scale = |c: u8| -> u8 {
        let straight = (c as u32 * 255 + alpha as u32 / 2) / alpha as u32;
        straight.min(255) as u8
    };
    Rgba([scale(rgb[0]), scale(rgb[1]), scale(rgb[2]), alpha])
}

// ----------------------------------------------------------------------------
// FrameConverter
// ----------------------------------------------------------------------------

/// Converts locked capture buffers into owned bitmaps.
#[derive(Clone, Debug, Default)]
pub struct FrameConverter {
    info: BitmapInfo,
    orientation: Orientation,
}

impl FrameConverter {
    pub fn new(info: BitmapInfo) -> Self {
        Self {
            info,
            orientation: Orientation::Up,
        }
    }

    /// Tag produced images with the sensor's mount orientation.
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Convert one raw buffer. The read lock is held only inside this call and is
    /// released on every return path.
    pub fn convert(&self, frame: &RawFrame) -> Result<BitmapImage, ConvertError> {
        let locked = frame.lock_read();
        let context = BitmapContext::new(&locked, self.info)?;
        let pixels = context.make_image()?;
        Ok(BitmapImage::new(pixels, self.orientation))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_layout_reads_bgra_bytes() {
        assert_eq!(BitmapInfo::CAPTURE_BGRA.channel_offsets(), [2, 1, 0, 3]);
        let big_last = BitmapInfo {
            byte_order: ByteOrder::Big32,
            alpha: AlphaInfo::Last,
            ..BitmapInfo::CAPTURE_BGRA
        };
        assert_eq!(big_last.channel_offsets(), [0, 1, 2, 3]);
    }

    #[test]
    fn converts_uniform_grey_frame() -> Result<(), ConvertError> {
        let frame = RawFrame::filled_bgra(640, 480, 0, [128, 128, 128, 255]);
        let image = FrameConverter::default().convert(&frame)?;
        assert_eq!((image.width(), image.height()), (640, 480));
        assert_eq!(image.uniform_colour(), Some(Rgba([128, 128, 128, 255])));
        assert_eq!(image.orientation(), Orientation::Up);
        Ok(())
    }

    #[test]
    fn respects_padded_stride() -> Result<(), ConvertError> {
        // 2x2 frame, 4 bytes of garbage padding per row.
        let data = vec![
            10, 20, 30, 255, 11, 21, 31, 255, 0xAA, 0xAA, 0xAA, 0xAA, //
            12, 22, 32, 255, 13, 23, 33, 255, 0xBB, 0xBB, 0xBB, 0xBB,
        ];
        let frame = RawFrame::new(data, 2, 2, 12, PixelFormat::Bgra32);
        let image = FrameConverter::default().convert(&frame)?;
        assert_eq!(image.pixel(0, 0), Rgba([30, 20, 10, 255]));
        assert_eq!(image.pixel(1, 0), Rgba([31, 21, 11, 255]));
        assert_eq!(image.pixel(0, 1), Rgba([32, 22, 12, 255]));
        assert_eq!(image.pixel(1, 1), Rgba([33, 23, 13, 255]));
        Ok(())
    }

    #[test]
    fn last_row_needs_no_padding() -> Result<(), ConvertError> {
        let mut data = vec![0u8; 8 + 4];
        data[8..12].copy_from_slice(&[1, 2, 3, 255]);
        let frame = RawFrame::new(data, 1, 2, 8, PixelFormat::Bgra32);
        let image = FrameConverter::default().convert(&frame)?;
        assert_eq!(image.pixel(0, 1), Rgba([3, 2, 1, 255]));
        Ok(())
    }

    #[test]
    fn premultiplied_alpha_is_undone() -> Result<(), ConvertError> {
        let frame = RawFrame::filled_bgra(1, 1, 0, [128, 64, 0, 128]);
        let image = FrameConverter::default().convert(&frame)?;
        assert_eq!(image.pixel(0, 0), Rgba([0, 128, 255, 128]));

        let clear = RawFrame::filled_bgra(1, 1, 0, [40, 40, 40, 0]);
        let image = FrameConverter::default().convert(&clear)?;
        assert_eq!(image.pixel(0, 0), Rgba([0, 0, 0, 0]));
        Ok(())
    }

    #[test]
    fn skipped_alpha_reads_opaque() -> Result<(), ConvertError> {
        let info = BitmapInfo {
            alpha: AlphaInfo::NoneSkipFirst,
            ..BitmapInfo::CAPTURE_BGRA
        };
        let frame = RawFrame::filled_bgra(1, 1, 0, [1, 2, 3, 0]);
        let image = FrameConverter::new(info).convert(&frame)?;
        assert_eq!(image.pixel(0, 0), Rgba([3, 2, 1, 255]));
        Ok(())
    }

    #[test]
    fn stride_below_row_length_fails_context_creation() {
        let frame = RawFrame::new(vec![0u8; 64], 4, 4, 12, PixelFormat::Bgra32);
        let err = FrameConverter::default().convert(&frame).unwrap_err();
        assert!(matches!(err, ConvertError::ContextCreation(_)));
        assert_eq!(frame.lock_count(), 0);
    }

    #[test]
    fn zero_width_frame_fails_context_creation() {
        let frame = RawFrame::filled_bgra(0, 4, 0, [1, 1, 1, 255]);
        let err = FrameConverter::default().convert(&frame).unwrap_err();
        assert!(matches!(err, ConvertError::ContextCreation(_)));
        assert_eq!(frame.lock_count(), 0);
    }

    #[test]
    fn short_buffer_fails_context_creation() {
        let frame = RawFrame::new(vec![0u8; 60], 4, 4, 16, PixelFormat::Bgra32);
        let err = FrameConverter::default().convert(&frame).unwrap_err();
        assert!(matches!(err, ConvertError::ContextCreation(_)));
        assert_eq!(frame.lock_count(), 0);
    }

    #[test]
    fn non_bgra_buffers_are_rejected() {
        let frame = RawFrame::new(vec![0u8; 24], 4, 4, 4, PixelFormat::Yuv420BiPlanar);
        let err = FrameConverter::default().convert(&frame).unwrap_err();
        assert!(matches!(err, ConvertError::ContextCreation(_)));
    }

    #[test]
    fn unsupported_component_depth_is_rejected() {
        let info = BitmapInfo {
            bits_per_component: 16,
            ..BitmapInfo::CAPTURE_BGRA
        };
        let frame = RawFrame::filled_bgra(2, 2, 0, [0, 0, 0, 255]);
        let err = FrameConverter::new(info).convert(&frame).unwrap_err();
        assert!(matches!(err, ConvertError::ContextCreation(_)));
    }

    #[test]
    fn lock_is_released_after_success() -> Result<(), ConvertError> {
        let frame = RawFrame::filled_bgra(8, 8, 16, [5, 5, 5, 255]);
        FrameConverter::default().convert(&frame)?;
        assert_eq!(frame.lock_count(), 0);
        Ok(())
    }

    #[test]
    fn sensor_orientation_is_tagged() -> Result<(), ConvertError> {
        let frame = RawFrame::filled_bgra(2, 2, 0, [0, 0, 0, 255]);
        let image = FrameConverter::default()
            .with_orientation(Orientation::Right)
            .convert(&frame)?;
        assert_eq!(image.orientation(), Orientation::Right);
        Ok(())
    }
}
