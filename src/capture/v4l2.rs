//! V4L2 capture backend.
//!
//! This module provides `V4l2Backend` for capturing from local V4L2 device nodes.
//!
//! The V4L2 backend is responsible for:
//! - Enumerating `/dev/video*` nodes (the configured node is the rear sensor)
//! - Negotiating `AR24` (BGRA in memory) at the preset size
//! - Applying the frame-rate cap as an exact capture interval
//! - Copying each mmap buffer into a pooled `RawFrame` with the driver's stride
//! - Skipping buffers shorter than one full frame
//!
//! The V4L2 backend MUST NOT:
//! - Queue frames (delivery goes through the overwrite slot)
//! - Hand driver-owned mmap memory past the producer thread
//! - Retry a failing stream (an unplugged device ends the producer)

use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{
    pump_frames, CaptureBackend, DeviceInfo, FrameDuration, FrameSink, OutputSettings, Position,
    SessionPreset,
};
use crate::frame::{FramePool, PixelFormat, Sample};

const MMAP_BUFFERS: u32 = 4;

fn bgra_fourcc() -> v4l::FourCC {
    v4l::FourCC::new(b"AR24")
}

/// Capture interval in seconds per frame, kept as the rational it was configured as.
fn frame_interval(duration: FrameDuration) -> Result<v4l::Fraction> {
    if duration.value == 0 || duration.timescale == 0 {
        bail!(
            "frame duration {}/{} is not a usable interval",
            duration.value,
            duration.timescale
        );
    }
    Ok(v4l::Fraction::new(duration.value, duration.timescale))
}

struct Negotiated {
    width: u32,
    height: u32,
    stride: usize,
}

struct Producer {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct V4l2Backend {
    path: String,
    pool: FramePool,
    device: Option<v4l::Device>,
    input: Option<DeviceInfo>,
    negotiated: Option<Negotiated>,
    config_locked: bool,
    producer: Option<Producer>,
}

impl V4l2Backend {
    /// Backend treating the node at `path` (e.g. "/dev/video0") as the rear camera.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pool: FramePool::new(),
            device: None,
            input: None,
            negotiated: None,
            config_locked: false,
            producer: None,
        }
    }

    fn device_mut(&mut self) -> Result<&mut v4l::Device> {
        self.device
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} not attached", self.path))
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        v4l::context::enum_devices()
            .into_iter()
            .map(|node| {
                let path = node.path().display().to_string();
                let position = if path == self.path {
                    Position::Back
                } else {
                    Position::Unspecified
                };
                let name = node.name().unwrap_or_else(|| path.clone());
                DeviceInfo::new(path, name, position)
            })
            .collect()
    }

    fn attach_input(&mut self, device: &DeviceInfo, preset: SessionPreset) -> Result<()> {
        use v4l::video::Capture;

        let handle = v4l::Device::with_path(&device.id)
            .with_context(|| format!("open v4l2 device {}", device.id))?;
        let (width, height) = preset.dimensions();
        let mut format = handle.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        if let Err(err) = handle.set_format(&format) {
            log::warn!("V4l2Backend: failed to set size on {}: {}", device.id, err);
        }
        self.device = Some(handle);
        self.input = Some(device.clone());
        Ok(())
    }

    fn attach_output(&mut self, output: OutputSettings) -> Result<()> {
        use v4l::video::Capture;

        if output.pixel_format != PixelFormat::Bgra32 {
            bail!(
                "v4l2 backend only delivers {}, not {}",
                PixelFormat::Bgra32.name(),
                output.pixel_format.name()
            );
        }
        let path = self.path.clone();
        let device = self.device_mut()?;
        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = bgra_fourcc();
        let format = device
            .set_format(&format)
            .with_context(|| format!("set AR24 format on {}", path))?;
        if format.fourcc != bgra_fourcc() {
            bail!("{} does not support AR24 (driver chose {})", path, format.fourcc);
        }
        self.negotiated = Some(Negotiated {
            width: format.width,
            height: format.height,
            stride: format.stride as usize,
        });
        Ok(())
    }

    fn lock_for_configuration(&mut self, device: &DeviceInfo) -> Result<()> {
        if self.input.as_ref() != Some(device) {
            bail!("device {} is not the attached input", device.id);
        }
        if self.config_locked {
            bail!("device {} is already locked for configuration", device.id);
        }
        self.config_locked = true;
        Ok(())
    }

    fn set_min_frame_duration(&mut self, duration: FrameDuration) -> Result<()> {
        use v4l::video::Capture;

        if !self.config_locked {
            bail!("frame rate changed without a configuration lock");
        }
        let params = v4l::video::capture::Parameters::new(frame_interval(duration)?);
        let path = self.path.clone();
        self.device_mut()?.set_params(&params).with_context(|| {
            format!(
                "set frame interval {}/{}s on {}",
                duration.value, duration.timescale, path
            )
        })?;
        Ok(())
    }

    fn unlock_for_configuration(&mut self) {
        self.config_locked = false;
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| anyhow!("start requested before the frame output was attached"))?;
        let (width, height, stride) = (negotiated.width, negotiated.height, negotiated.stride);
        let mut device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("v4l2 device {} not attached", self.path))?;
        let pool = self.pool.clone();
        let path = self.path.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();

        let join = std::thread::Builder::new()
            .name("v4l2-producer".to_string())
            .spawn(move || {
                use v4l::buffer::Type;
                use v4l::io::traits::CaptureStream;

                let mut stream = match v4l::prelude::MmapStream::with_buffers(
                    &mut device,
                    Type::VideoCapture,
                    MMAP_BUFFERS,
                ) {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::error!("V4l2Backend: failed to create stream on {}: {}", path, err);
                        return;
                    }
                };
                log::info!("V4l2Backend: streaming {} ({}x{})", path, width, height);

                let mut sequence = 0u64;
                let delivered = pump_frames(
                    &path,
                    &shutdown_thread,
                    || {
                        let (buf, _meta) = stream
                            .next()
                            .with_context(|| format!("dequeue buffer on {}", path))?;
                        match pool.frame_from(buf, width, height, stride, PixelFormat::Bgra32) {
                            Ok(frame) => Ok(Some(frame)),
                            Err(err) => {
                                log::warn!("V4l2Backend: skipping frame on {}: {}", path, err);
                                Ok(None)
                            }
                        }
                    },
                    |frame| {
                        let accepted = sink.deliver(Sample::new(sequence, frame));
                        sequence += 1;
                        accepted
                    },
                );
                log::debug!(
                    "V4l2Backend: producer for {} stopped after {} frames",
                    path,
                    delivered
                );
            })
            .context("spawn v4l2 producer")?;
        self.producer = Some(Producer { shutdown, join });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.shutdown.store(true, Ordering::SeqCst);
            if producer.join.join().is_err() {
                log::warn!("V4l2Backend: producer thread panicked");
            }
        }
        self.device = None;
        self.input = None;
        self.negotiated = None;
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        self.stop();
    }
}
