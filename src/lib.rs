//! Capture Kernel
//!
//! This crate implements a real-time camera frame pipeline: frames are acquired from a
//! rear-facing camera, converted from hardware pixel buffers into owned bitmaps, rotated
//! to compensate for the sensor's mount, passed through a vision analysis stage and
//! handed to a display surface.
//!
//! # Architecture
//!
//! The pipeline holds these guarantees by construction:
//!
//! 1. **Scoped buffer access**: hardware pixel memory is read only through a lock guard
//!    that cannot outlive the frame and is released on every exit path.
//! 2. **No backlog**: a frame the capture context has not picked up yet is replaced by
//!    the next one. Memory in flight stays bounded regardless of analysis latency.
//! 3. **Frame-local failures**: a frame that cannot be converted is dropped and logged;
//!    the next frame is processed normally.
//! 4. **UI confinement**: only the UI context calls the presentation sink.
//! 5. **Single owner**: one `CaptureSession` owns the camera connection.
//!
//! # Module Structure
//!
//! - `frame`: raw frames, locked views, samples and bitmaps
//! - `convert`: BGRA buffer to bitmap conversion
//! - `orient`: centred rotation and sensor correction
//! - `capture`: hardware backends (synthetic, V4L2)
//! - `session`: capture session setup and lifecycle
//! - `analysis`: analysis stage trait and built-in analyzers
//! - `present`: UI context hand-off
//! - `pipeline`: capture context orchestration and statistics
//! - `config`: daemon configuration

pub mod analysis;
pub mod capture;
pub mod config;
pub mod convert;
pub mod frame;
mod latest;
pub mod orient;
pub mod pipeline;
pub mod present;
pub mod session;

pub use analysis::{AnalysisSink, AnalyzerKind, GrayscaleAnalyzer, IdentityAnalyzer};
pub use capture::{CaptureBackend, DeviceInfo, Position, SyntheticBackend, SyntheticFeed};
#[cfg(feature = "capture-v4l2")]
pub use capture::V4l2Backend;
pub use convert::{BitmapInfo, ConvertError, FrameConverter};
pub use frame::{BitmapImage, BufferError, Orientation, PixelFormat, RawFrame, Sample};
pub use orient::OrientationCorrector;
pub use pipeline::{CapturePipeline, FrameError, PipelineState, StatsSnapshot};
pub use present::{ui_context, PresentationSink, UiContext, UiDispatcher};
pub use session::{CaptureSession, ConfigError, SessionSettings};
