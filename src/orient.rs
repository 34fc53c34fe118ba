//! Orientation correction.
//!
//! Draws the source into a fresh canvas of the same size: origin moved to the canvas
//! centre, vertical axis flipped from the top-left bitmap convention to a bottom-left
//! drawing convention, rotation applied, source drawn centred on the origin. The image
//! pivots about its centre. Canvas pixels the rotated source does not cover stay fully
//! transparent.

use image::{Rgba, RgbaImage};

use crate::frame::BitmapImage;

/// Fixed correction for a rear sensor mounted at 90 degrees to the display.
pub const SENSOR_CORRECTION_DEGREES: f64 = -90.0;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Inverse-mapped affine transform from canvas to source, both in centred,
/// y-up drawing coordinates.
#[derive(Clone, Copy, Debug)]
struct CentredRotation {
    sin: f64,
    cos: f64,
}

impl CentredRotation {
    fn new(degrees: f64) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self {
            sin: snap(sin),
            cos: snap(cos),
        }
    }

    /// Source point drawn at canvas point `(x, y)`.
    fn source_of(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.cos * x + self.sin * y,
            -self.sin * x + self.cos * y,
        )
    }
}

/// Quarter turns must map pixel centres onto pixel centres exactly.
fn snap(value: f64) -> f64 {
    let rounded = value.round();
    if (value - rounded).abs() < 1e-12 {
        rounded
    } else {
        value
    }
}

/// Canvas that owns the destination pixels while drawing.
struct DrawingCanvas {
    pixels: RgbaImage,
}

impl DrawingCanvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbaImage::from_pixel(width, height, TRANSPARENT),
        }
    }

    fn draw_rotated(&mut self, source: &RgbaImage, rotation: CentredRotation) {
        let (w, h) = (source.width() as f64, source.height() as f64);
        let (canvas_w, canvas_h) = (self.pixels.width() as f64, self.pixels.height() as f64);
        for (x, y, px) in self.pixels.enumerate_pixels_mut() {
            // Pixel centre, translated to the canvas centre with y flipped up.
            let cx = x as f64 + 0.5 - canvas_w / 2.0;
            let cy = canvas_h / 2.0 - (y as f64 + 0.5);
            let (sx, sy) = rotation.source_of(cx, cy);
            // Back to top-left source coordinates.
            let col = (sx + w / 2.0).floor();
            let row = (h / 2.0 - sy).floor();
            if col >= 0.0 && row >= 0.0 && col < w && row < h {
                *px = *source.get_pixel(col as u32, row as u32);
            }
        }
    }

    fn into_image(self) -> RgbaImage {
        self.pixels
    }
}

/// Rotates bitmaps about their centre.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrientationCorrector;

impl OrientationCorrector {
    pub fn new() -> Self {
        Self
    }

    /// Rotate `image` by `angle_degrees` (counter-clockwise positive). Output has the
    /// input's dimensions.
    pub fn rotate(&self, image: BitmapImage, angle_degrees: f64) -> BitmapImage {
        let orientation = image.orientation().rotated_by(angle_degrees);
        let source = image.into_pixels();
        let mut canvas = DrawingCanvas::new(source.width(), source.height());
        canvas.draw_rotated(&source, CentredRotation::new(angle_degrees));
        BitmapImage::new(canvas.into_image(), orientation)
    }

    /// Apply the fixed sensor correction.
    pub fn correct(&self, image: BitmapImage) -> BitmapImage {
        self.rotate(image, SENSOR_CORRECTION_DEGREES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
