use crate::analysis::sink::AnalysisSink;
use crate::frame::BitmapImage;

/// Passes frames through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityAnalyzer;

impl AnalysisSink for IdentityAnalyzer {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn analyze(&mut self, image: BitmapImage) -> BitmapImage {
        image
    }
}
