mod sink;
mod sinks;

pub use sink::{AnalysisSink, AnalyzerKind, BuiltinAnalyzer};
pub use sinks::{GrayscaleAnalyzer, IdentityAnalyzer};
