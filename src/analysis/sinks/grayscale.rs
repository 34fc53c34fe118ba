use image::{Pixel, Rgba, RgbaImage};

use crate::analysis::sink::AnalysisSink;
use crate::frame::BitmapImage;

/// Grayscale preview. Luma replaces colour; alpha and orientation are kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct GrayscaleAnalyzer;

impl AnalysisSink for GrayscaleAnalyzer {
    fn name(&self) -> &'static str {
        "grayscale"
    }

    fn analyze(&mut self, image: BitmapImage) -> BitmapImage {
        let orientation = image.orientation();
        let source = image.into_pixels();
        let gray = RgbaImage::from_fn(source.width(), source.height(), |x, y| {
            let px = source.get_pixel(x, y);
            let luma = px.to_luma()[0];
            Rgba([luma, luma, luma, px[3]])
        });
        BitmapImage::new(gray, orientation)
    }
}
