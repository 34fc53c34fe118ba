use anyhow::{anyhow, Result};

use crate::frame::BitmapImage;

use super::sinks::{GrayscaleAnalyzer, IdentityAnalyzer};

/// Vision analysis stage.
///
/// Receives the corrected frame and returns the annotated result. Runs on the capture
/// context, synchronously, once per processed frame. Implementations are assumed
/// infallible; a slow implementation only delays the start of the next frame, and the
/// late-frame discard policy keeps the backlog bounded.
pub trait AnalysisSink: Send {
    /// Analyzer identifier, for logs.
    fn name(&self) -> &'static str {
        "external"
    }

    fn analyze(&mut self, image: BitmapImage) -> BitmapImage;
}

impl<F> AnalysisSink for F
where
    F: FnMut(BitmapImage) -> BitmapImage + Send,
{
    fn analyze(&mut self, image: BitmapImage) -> BitmapImage {
        self(image)
    }
}

/// Built-in analyzers selectable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalyzerKind {
    Identity,
    Grayscale,
}

impl AnalyzerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(AnalyzerKind::Identity),
            "grayscale" | "greyscale" => Ok(AnalyzerKind::Grayscale),
            other => Err(anyhow!("unknown analyzer '{}'", other)),
        }
    }

    pub fn build(self) -> BuiltinAnalyzer {
        match self {
            AnalyzerKind::Identity => BuiltinAnalyzer::Identity(IdentityAnalyzer),
            AnalyzerKind::Grayscale => BuiltinAnalyzer::Grayscale(GrayscaleAnalyzer),
        }
    }
}

/// One of the built-in analyzers, chosen at runtime.
pub enum BuiltinAnalyzer {
    Identity(IdentityAnalyzer),
    Grayscale(GrayscaleAnalyzer),
}

impl AnalysisSink for BuiltinAnalyzer {
    fn name(&self) -> &'static str {
        match self {
            BuiltinAnalyzer::Identity(inner) => inner.name(),
            BuiltinAnalyzer::Grayscale(inner) => inner.name(),
        }
    }

    fn analyze(&mut self, image: BitmapImage) -> BitmapImage {
        match self {
            BuiltinAnalyzer::Identity(inner) => inner.analyze(image),
            BuiltinAnalyzer::Grayscale(inner) => inner.analyze(image),
        }
    }
}
