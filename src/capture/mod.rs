//! Capture hardware layer.
//!
//! A `CaptureBackend` stands in for the camera subsystem:
//! - enumerates devices with their mounting position
//! - attaches a device as input and a frame output to the session
//! - accepts frame-rate configuration under an exclusive configuration lock
//! - delivers one `Sample` per capture tick into the registered `FrameSink`
//!
//! Backends produce frames on their own thread. The `FrameSink` is a single-slot
//! overwrite channel: a sample the capture context has not picked up yet is replaced by
//! the next one. Backends never queue.
//!
//! Backends:
//! - `SyntheticBackend` for `stub://` sources (tests, demos)
//! - `V4l2Backend` for local V4L2 devices (feature: capture-v4l2)

pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::{PixelFormat, RawFrame, Sample};
use crate::latest::LatestSender;
use crate::pipeline::PipelineStats;

pub use synthetic::{SyntheticBackend, SyntheticFaults, SyntheticFeed};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Backend;

/// Where a capture device faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Front,
    Back,
    Unspecified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub position: Position,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position,
        }
    }
}

/// Capture resolution preset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionPreset {
    #[default]
    Vga640x480,
    Hd1280x720,
    Hd1920x1080,
}

impl SessionPreset {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vga640x480" => Ok(SessionPreset::Vga640x480),
            "hd1280x720" => Ok(SessionPreset::Hd1280x720),
            "hd1920x1080" => Ok(SessionPreset::Hd1920x1080),
            other => Err(anyhow!("unknown session preset '{}'", other)),
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            SessionPreset::Vga640x480 => (640, 480),
            SessionPreset::Hd1280x720 => (1280, 720),
            SessionPreset::Hd1920x1080 => (1920, 1080),
        }
    }
}

/// Rational time value: `value / timescale` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDuration {
    pub value: u32,
    pub timescale: u32,
}

impl FrameDuration {
    pub const fn new(value: u32, timescale: u32) -> Self {
        Self { value, timescale }
    }

    /// Minimum frame duration for a frame-rate cap of `fps` frames per second.
    pub const fn per_second(fps: u32) -> Self {
        Self::new(1, fps)
    }

    pub fn as_duration(self) -> std::time::Duration {
        if self.timescale == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_nanos(self.value as u64 * 1_000_000_000 / self.timescale as u64)
    }
}

/// Output configuration the session requests from the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputSettings {
    pub pixel_format: PixelFormat,
    pub discard_late_frames: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Bgra32,
            discard_late_frames: true,
        }
    }
}

/// Camera subsystem seen by a `CaptureSession`.
///
/// Setup calls happen in order: `attach_input`, `attach_output`, then the frame-rate
/// configuration bracketed by `lock_for_configuration` / `unlock_for_configuration`.
/// `start` registers the sink; from then on the backend delivers samples from its own
/// thread until `stop`, which must drop the sink and release the device.
pub trait CaptureBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn devices(&self) -> Vec<DeviceInfo>;

    fn attach_input(&mut self, device: &DeviceInfo, preset: SessionPreset) -> Result<()>;

    fn attach_output(&mut self, output: OutputSettings) -> Result<()>;

    fn lock_for_configuration(&mut self, device: &DeviceInfo) -> Result<()>;

    fn set_min_frame_duration(&mut self, duration: FrameDuration) -> Result<()>;

    fn unlock_for_configuration(&mut self);

    fn start(&mut self, sink: FrameSink) -> Result<()>;

    fn stop(&mut self);
}

// ----------------------------------------------------------------------------
// FrameSink: producer half of the capture context's inbox
// ----------------------------------------------------------------------------

/// Where a backend delivers samples. Holds at most one undelivered sample.
pub struct FrameSink {
    tx: LatestSender<Sample>,
    stats: Arc<PipelineStats>,
}

impl FrameSink {
    pub(crate) fn new(tx: LatestSender<Sample>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    /// Hand a sample to the capture context. Returns false once the pipeline is gone.
    pub fn deliver(&self, sample: Sample) -> bool {
        match self.tx.send(sample) {
            Ok(None) => {
                self.stats.record_delivered();
                true
            }
            Ok(Some(stale)) => {
                self.stats.record_delivered();
                self.stats.record_discarded_late();
                log::debug!("FrameSink: discarded late frame {}", stale.sequence);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Producer loop shared by backends
// ----------------------------------------------------------------------------

/// Pull frames from `next_frame` and hand them to `deliver` until `shutdown` is set,
/// `deliver` reports a closed pipeline, or the source fails.
///
/// `Ok(None)` skips a tick. A source error ends the loop. Returns the number of
/// frames delivered.
pub(crate) fn pump_frames(
    source: &str,
    shutdown: &AtomicBool,
    mut next_frame: impl FnMut() -> Result<Option<RawFrame>>,
    mut deliver: impl FnMut(RawFrame) -> bool,
) -> u64 {
    let mut delivered = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        let frame = match next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                log::error!("capture: {} failed, stopping producer: {:#}", source, err);
                break;
            }
        };
        if !deliver(frame) {
            break;
        }
        delivered += 1;
    }
    delivered
}
