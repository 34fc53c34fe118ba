//! Frame memory and image types.
//!
//! - `RawFrame`: hardware-owned pixel buffer for one capture instant. Bytes are private.
//! - `LockedPixels`: scoped read lock over a `RawFrame`. The only path to the bytes.
//! - `Sample`: one frame-arrival event as delivered by the capture subsystem.
//! - `BitmapImage`: immutable, software-owned image that flows through the pipeline.
//!
//! A `RawFrame` is never cloned and never outlives the frame callback that received it.
//! Dropping it hands the pixel memory back to the `FramePool` it came from so the
//! capture subsystem can reuse it for the next tick.

use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Number of idle buffers a pool keeps for reuse.
pub const POOL_CAPACITY: usize = 4;

/// Per-event buffer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("sample {sequence} carries no image buffer")]
    MissingImageBuffer { sequence: u64 },
    #[error("driver buffer holds {actual} bytes, frame needs {expected}")]
    ShortBuffer { expected: usize, actual: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit BGRA, one plane. The only format the converter accepts.
    Bgra32,
    /// Bi-planar 4:2:0 YCbCr, the usual sensor default before an output format is set.
    Yuv420BiPlanar,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Bgra32 => "32BGRA",
            PixelFormat::Yuv420BiPlanar => "420YpCbCr8BiPlanar",
        }
    }
}

// ----------------------------------------------------------------------------
// FramePool: recycled hardware memory
// ----------------------------------------------------------------------------

/// Bounded pool of pixel buffers owned by a capture backend.
#[derive(Clone, Default)]
pub struct FramePool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a zeroed buffer of `len` bytes, reusing idle memory when available.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }

    /// Copy one driver buffer into pooled memory. Fails rather than padding when
    /// `bytes` is shorter than `bytes_per_row * height`.
    pub fn frame_from(
        &self,
        bytes: &[u8],
        width: u32,
        height: u32,
        bytes_per_row: usize,
        format: PixelFormat,
    ) -> Result<RawFrame, BufferError> {
        let expected = bytes_per_row * height as usize;
        if bytes.len() < expected {
            return Err(BufferError::ShortBuffer {
                expected,
                actual: bytes.len(),
            });
        }
        let mut data = self.acquire(expected);
        data.copy_from_slice(&bytes[..expected]);
        Ok(RawFrame::new(data, width, height, bytes_per_row, format).recycled_into(self))
    }

    /// Number of idle buffers ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn recycle(&self, buf: Vec<u8>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < POOL_CAPACITY {
                idle.push(buf);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame: hardware-owned pixel buffer
// ----------------------------------------------------------------------------

/// Hardware-owned pixel buffer. There is no `Clone` and no byte accessor; read access
/// goes through [`RawFrame::lock_read`], whose guard borrows the frame.
///
/// A locked view cannot escape the frame it was taken from:
///
/// ```compile_fail
/// use capture_kernel::{PixelFormat, RawFrame};
///
/// fn escape() -> &'static [u8] {
///     let frame = RawFrame::new(vec![0u8; 16], 2, 2, 8, PixelFormat::Bgra32);
///     let locked = frame.lock_read();
///     locked.bytes()
/// }
/// ```
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: usize,
    pub format: PixelFormat,
    lock_count: AtomicUsize,
    pool: Option<FramePool>,
}

impl RawFrame {
    /// Wrap a buffer as delivered by the hardware layer. No layout validation happens
    /// here; the converter decides whether the geometry is usable.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        bytes_per_row: usize,
        format: PixelFormat,
    ) -> Self {
        Self {
            data,
            width,
            height,
            bytes_per_row,
            format,
            lock_count: AtomicUsize::new(0),
            pool: None,
        }
    }

    /// A BGRA frame filled with one colour, given as `[b, g, r, a]` memory order.
    /// `row_padding` extra bytes are appended to every row.
    pub fn filled_bgra(width: u32, height: u32, row_padding: usize, bgra: [u8; 4]) -> Self {
        let bytes_per_row = width as usize * 4 + row_padding;
        let mut data = vec![0u8; bytes_per_row * height as usize];
        fill_bgra_rows(&mut data, width, bytes_per_row, bgra);
        Self::new(data, width, height, bytes_per_row, PixelFormat::Bgra32)
    }

    /// Return memory to `pool` when this frame is dropped.
    pub(crate) fn recycled_into(mut self, pool: &FramePool) -> Self {
        self.pool = Some(pool.clone());
        self
    }

    /// Acquire a read-only lock on the pixel memory. Released when the guard drops.
    pub fn lock_read(&self) -> LockedPixels<'_> {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
        LockedPixels { frame: self }
    }

    /// Outstanding read locks.
    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::Acquire)
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

pub(crate) fn fill_bgra_rows(data: &mut [u8], width: u32, bytes_per_row: usize, bgra: [u8; 4]) {
    if bytes_per_row == 0 {
        return;
    }
    for row in data.chunks_mut(bytes_per_row) {
        for px in row.chunks_exact_mut(4).take(width as usize) {
            px.copy_from_slice(&bgra);
        }
    }
}

/// Scoped read access to a `RawFrame`'s memory.
pub struct LockedPixels<'a> {
    frame: &'a RawFrame,
}

impl<'a> LockedPixels<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        &self.frame.data
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn bytes_per_row(&self) -> usize {
        self.frame.bytes_per_row
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }
}

impl Drop for LockedPixels<'_> {
    fn drop(&mut self) {
        self.frame.lock_count.fetch_sub(1, Ordering::AcqRel);
    }
}

// ----------------------------------------------------------------------------
// Sample: one frame-arrival event
// ----------------------------------------------------------------------------

/// One frame-arrival event. A sample may arrive without an image buffer.
pub struct Sample {
    pub sequence: u64,
    image_buffer: Option<RawFrame>,
}

impl Sample {
    pub fn new(sequence: u64, frame: RawFrame) -> Self {
        Self {
            sequence,
            image_buffer: Some(frame),
        }
    }

    pub fn without_buffer(sequence: u64) -> Self {
        Self {
            sequence,
            image_buffer: None,
        }
    }

    pub fn image_buffer(&self) -> Result<&RawFrame, BufferError> {
        self.image_buffer
            .as_ref()
            .ok_or(BufferError::MissingImageBuffer {
                sequence: self.sequence,
            })
    }
}

// ----------------------------------------------------------------------------
// BitmapImage: software-owned image
// ----------------------------------------------------------------------------

/// Clockwise quarter turns the stored pixels still need to display upright.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Up,
    Right,
    Down,
    Left,
}

impl Orientation {
    fn quarter_turns(self) -> i64 {
        match self {
            Orientation::Up => 0,
            Orientation::Right => 1,
            Orientation::Down => 2,
            Orientation::Left => 3,
        }
    }

    fn from_quarter_turns(turns: i64) -> Self {
        match turns.rem_euclid(4) {
            0 => Orientation::Up,
            1 => Orientation::Right,
            2 => Orientation::Down,
            _ => Orientation::Left,
        }
    }

    /// Tag after rotating the pixels by `degrees` (counter-clockwise positive).
    /// Angles that are not a multiple of 90 leave the tag unchanged.
    pub fn rotated_by(self, degrees: f64) -> Self {
        let turns = degrees / 90.0;
        if !turns.is_finite() || (turns - turns.round()).abs() > 1e-9 {
            return self;
        }
        let clockwise = -(turns.round() as i64);
        Self::from_quarter_turns(self.quarter_turns() - clockwise)
    }
}

/// Immutable RGBA8 image with straight (non-premultiplied) alpha.
#[derive(Clone, Debug, PartialEq)]
pub struct BitmapImage {
    pixels: RgbaImage,
    orientation: Orientation,
}

impl BitmapImage {
    pub fn new(pixels: RgbaImage, orientation: Orientation) -> Self {
        Self {
            pixels,
            orientation,
        }
    }

    pub fn filled(width: u32, height: u32, colour: Rgba<u8>) -> Self {
        Self::new(
            RgbaImage::from_pixel(width, height, colour),
            Orientation::Up,
        )
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.pixels.get_pixel(x, y)
    }

    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }

    /// The single colour of the image, if every pixel shares it.
    pub fn uniform_colour(&self) -> Option<Rgba<u8>> {
        let mut iter = self.pixels.pixels();
        let first = *iter.next()?;
        iter.all(|px| *px == first).then_some(first)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guard_tracks_outstanding_locks() {
        let frame = RawFrame::filled_bgra(4, 2, 0, [1, 2, 3, 255]);
        assert_eq!(frame.lock_count(), 0);
        {
            let locked = frame.lock_read();
            assert_eq!(frame.lock_count(), 1);
            assert_eq!(locked.bytes().len(), 32);
            assert_eq!(locked.bytes_per_row(), 16);
        }
        assert_eq!(frame.lock_count(), 0);
    }

    #[test]
    fn filled_frame_leaves_row_padding_untouched() {
        let frame = RawFrame::filled_bgra(2, 2, 4, [9, 9, 9, 9]);
        let locked = frame.lock_read();
        let bytes = locked.bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(&bytes[12..20], &[9; 8]);
    }

    #[test]
    fn dropped_frames_return_memory_to_pool() {
        let pool = FramePool::new();
        let frame = RawFrame::new(pool.acquire(64), 4, 4, 16, PixelFormat::Bgra32)
            .recycled_into(&pool);
        assert_eq!(pool.idle_count(), 0);
        drop(frame);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire(16);
        assert_eq!(reused, vec![0u8; 16]);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn zero_width_fill_produces_empty_frame() {
        let frame = RawFrame::filled_bgra(0, 3, 0, [1, 2, 3, 4]);
        assert_eq!(frame.bytes_per_row, 0);
        assert!(frame.lock_read().bytes().is_empty());
    }

    #[test]
    fn driver_buffer_is_copied_into_pooled_frame() -> anyhow::Result<()> {
        let pool = FramePool::new();
        // Drivers may hand back a buffer larger than the negotiated image.
        let driver = vec![7u8; 40];
        let frame = pool.frame_from(&driver, 2, 2, 16, PixelFormat::Bgra32)?;
        assert_eq!(frame.lock_read().bytes(), &[7u8; 32][..]);
        drop(frame);
        assert_eq!(pool.idle_count(), 1);
        Ok(())
    }

    #[test]
    fn short_driver_buffer_is_rejected() {
        let pool = FramePool::new();
        let result = pool.frame_from(&[0u8; 20], 2, 2, 16, PixelFormat::Bgra32);
        assert_eq!(
            result.err(),
            Some(BufferError::ShortBuffer {
                expected: 32,
                actual: 20
            })
        );
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn pool_keeps_a_bounded_number_of_buffers() {
        let pool = FramePool::new();
        let frames: Vec<_> = (0..POOL_CAPACITY + 3)
            .map(|_| RawFrame::new(vec![0u8; 4], 1, 1, 4, PixelFormat::Bgra32).recycled_into(&pool))
            .collect();
        drop(frames);
        assert_eq!(pool.idle_count(), POOL_CAPACITY);
    }

    #[test]
    fn sample_without_buffer_reports_missing_image_buffer() {
        let sample = Sample::without_buffer(7);
        assert_eq!(
            sample.image_buffer().err(),
            Some(BufferError::MissingImageBuffer { sequence: 7 })
        );
    }

    #[test]
    fn orientation_follows_quarter_turns() {
        assert_eq!(Orientation::Right.rotated_by(-90.0), Orientation::Up);
        assert_eq!(Orientation::Up.rotated_by(90.0), Orientation::Right);
        assert_eq!(Orientation::Up.rotated_by(-180.0), Orientation::Down);
        assert_eq!(Orientation::Left.rotated_by(-90.0), Orientation::Down);
        assert_eq!(Orientation::Up.rotated_by(360.0), Orientation::Up);
        assert_eq!(Orientation::Right.rotated_by(45.0), Orientation::Right);
    }

    #[test]
    fn uniform_colour_detects_mixed_images() {
        let grey = Rgba([128, 128, 128, 255]);
        let image = BitmapImage::filled(3, 3, grey);
        assert_eq!(image.uniform_colour(), Some(grey));

        let mut pixels = image.into_pixels();
        pixels.put_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let mixed = BitmapImage::new(pixels, Orientation::Up);
        assert_eq!(mixed.uniform_colour(), None);
    }
}
