//! Synthetic capture backend.
//!
//! Backs `stub://` sources. Devices, setup faults and frame delivery are all under the
//! caller's control:
//! - `SyntheticFaults` makes individual setup steps fail
//! - `SyntheticFeed` pushes hand-built samples into the registered sink
//! - `generating()` adds a producer thread emitting BGRA test frames (rows padded to a
//!   64-byte stride) paced by the configured minimum frame duration
//!
//! Frame memory comes from a `FramePool`, so buffers are recycled once the capture
//! context is done with them.

use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{
    pump_frames, CaptureBackend, DeviceInfo, FrameDuration, FrameSink, OutputSettings, Position,
    SessionPreset,
};
use crate::frame::{fill_bgra_rows, FramePool, PixelFormat, RawFrame, Sample};

const STRIDE_ALIGN: usize = 64;
const DEFAULT_FPS: u32 = 30;

/// Setup steps that should fail.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticFaults {
    pub input: bool,
    pub output: bool,
    pub device_lock: bool,
    pub frame_rate: bool,
    pub start: bool,
}

// ----------------------------------------------------------------------------
// SyntheticFeed: manual delivery handle
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FeedState {
    sink: Mutex<Option<FrameSink>>,
    sequence: AtomicU64,
    registrations: AtomicU64,
}

/// Handle for pushing samples into whatever sink the backend currently has registered.
#[derive(Clone, Default)]
pub struct SyntheticFeed {
    state: Arc<FeedState>,
}

impl SyntheticFeed {
    /// True while a sink is registered (between `start` and `stop`).
    pub fn is_registered(&self) -> bool {
        self.state
            .sink
            .lock()
            .map(|sink| sink.is_some())
            .unwrap_or(false)
    }

    /// How many times a sink has been registered.
    pub fn registrations(&self) -> u64 {
        self.state.registrations.load(Ordering::Acquire)
    }

    /// Deliver `frame` as the next sample. Returns false when nothing is listening.
    pub fn push(&self, frame: RawFrame) -> bool {
        let sequence = self.state.sequence.fetch_add(1, Ordering::AcqRel);
        self.push_sample(Sample::new(sequence, frame))
    }

    /// Deliver a sample that carries no image buffer.
    pub fn push_empty(&self) -> bool {
        let sequence = self.state.sequence.fetch_add(1, Ordering::AcqRel);
        self.push_sample(Sample::without_buffer(sequence))
    }

    pub fn push_sample(&self, sample: Sample) -> bool {
        let Ok(guard) = self.state.sink.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(sink) => sink.deliver(sample),
            None => false,
        }
    }

    fn register(&self, sink: FrameSink) -> Result<()> {
        let mut guard = self
            .state
            .sink
            .lock()
            .map_err(|_| anyhow!("synthetic feed lock poisoned"))?;
        *guard = Some(sink);
        self.state.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unregister(&self) {
        if let Ok(mut guard) = self.state.sink.lock() {
            guard.take();
        }
    }
}

// ----------------------------------------------------------------------------
// SyntheticBackend
// ----------------------------------------------------------------------------

struct Generator {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct SyntheticBackend {
    devices: Vec<DeviceInfo>,
    faults: SyntheticFaults,
    feed: SyntheticFeed,
    pool: FramePool,
    generate: bool,
    input: Option<(DeviceInfo, SessionPreset)>,
    output: Option<OutputSettings>,
    config_locked: bool,
    min_frame_duration: FrameDuration,
    generator: Option<Generator>,
}

impl SyntheticBackend {
    /// Backend exposing exactly `devices`. Frames are only delivered through the feed.
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            faults: SyntheticFaults::default(),
            feed: SyntheticFeed::default(),
            pool: FramePool::new(),
            generate: false,
            input: None,
            output: None,
            config_locked: false,
            min_frame_duration: FrameDuration::per_second(DEFAULT_FPS),
            generator: None,
        }
    }

    /// A front camera and a rear camera, like a phone.
    pub fn front_and_rear() -> Self {
        Self::new(vec![
            DeviceInfo::new("stub://front_camera", "Synthetic front camera", Position::Front),
            DeviceInfo::new("stub://rear_camera", "Synthetic rear camera", Position::Back),
        ])
    }

    /// Generating backend for a `stub://<name>` source with one rear device.
    pub fn from_source(source: &str) -> Result<Self> {
        let Some(name) = source.strip_prefix("stub://") else {
            bail!("synthetic source must start with stub://, got '{}'", source);
        };
        if name.is_empty() {
            bail!("synthetic source needs a device name");
        }
        Ok(Self::new(vec![DeviceInfo::new(
            source,
            format!("Synthetic {}", name),
            Position::Back,
        )])
        .generating())
    }

    pub fn with_faults(mut self, faults: SyntheticFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Emit test frames from a producer thread once started.
    pub fn generating(mut self) -> Self {
        self.generate = true;
        self
    }

    pub fn feed(&self) -> SyntheticFeed {
        self.feed.clone()
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn attached_input(&self) -> Option<&DeviceInfo> {
        self.input.as_ref().map(|(device, _)| device)
    }

    pub fn output(&self) -> Option<OutputSettings> {
        self.output
    }

    pub fn min_frame_duration(&self) -> FrameDuration {
        self.min_frame_duration
    }

    pub fn is_config_locked(&self) -> bool {
        self.config_locked
    }

    fn spawn_generator(&mut self) {
        let Some((device, preset)) = self.input.clone() else {
            return;
        };
        let (width, height) = preset.dimensions();
        let interval = self.min_frame_duration.as_duration();
        let feed = self.feed.clone();
        let pool = self.pool.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            let mut tick = 0u64;
            let generated = pump_frames(
                &device.id,
                &shutdown_thread,
                || {
                    if tick > 0 {
                        std::thread::sleep(interval.max(Duration::from_millis(1)));
                    }
                    let frame = test_pattern(&pool, width, height, tick);
                    tick += 1;
                    Ok(Some(frame))
                },
                |frame| feed.push(frame),
            );
            log::debug!(
                "SyntheticBackend: generator for {} stopped after {} frames",
                device.id,
                generated
            );
        });
        self.generator = Some(Generator { shutdown, join });
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn attach_input(&mut self, device: &DeviceInfo, preset: SessionPreset) -> Result<()> {
        if self.faults.input {
            bail!("device {} refused input attachment", device.id);
        }
        if !self.devices.contains(device) {
            bail!("unknown device {}", device.id);
        }
        self.input = Some((device.clone(), preset));
        Ok(())
    }

    fn attach_output(&mut self, output: OutputSettings) -> Result<()> {
        if self.faults.output {
            bail!("frame output cannot be added to the session");
        }
        self.output = Some(output);
        Ok(())
    }

    fn lock_for_configuration(&mut self, device: &DeviceInfo) -> Result<()> {
        if self.faults.device_lock {
            bail!("device {} is locked by another client", device.id);
        }
        if self.config_locked {
            bail!("device {} is already locked for configuration", device.id);
        }
        self.config_locked = true;
        Ok(())
    }

    fn set_min_frame_duration(&mut self, duration: FrameDuration) -> Result<()> {
        if !self.config_locked {
            bail!("frame rate changed without a configuration lock");
        }
        if self.faults.frame_rate {
            bail!(
                "frame duration {}/{} unsupported",
                duration.value,
                duration.timescale
            );
        }
        self.min_frame_duration = duration;
        Ok(())
    }

    fn unlock_for_configuration(&mut self) {
        self.config_locked = false;
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.faults.start {
            bail!("capture hardware failed to start");
        }
        if self.input.is_none() || self.output.is_none() {
            bail!("start requested before input and output were attached");
        }
        self.feed.register(sink)?;
        if self.generate {
            self.spawn_generator();
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.shutdown.store(true, Ordering::SeqCst);
            if generator.join.join().is_err() {
                log::warn!("SyntheticBackend: generator thread panicked");
            }
        }
        self.feed.unregister();
        self.input = None;
    }
}

impl Drop for SyntheticBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Grey background with a bright vertical bar that moves one step per tick.
fn test_pattern(pool: &FramePool, width: u32, height: u32, tick: u64) -> RawFrame {
    let row_len = width as usize * 4;
    let bytes_per_row = row_len.div_ceil(STRIDE_ALIGN) * STRIDE_ALIGN;
    let mut data = pool.acquire(bytes_per_row * height as usize);
    fill_bgra_rows(&mut data, width, bytes_per_row, [96, 96, 96, 255]);

    let bar_width = (width / 16).max(1) as usize;
    let bar_start = (tick as usize * bar_width) % width as usize;
    for row in data.chunks_mut(bytes_per_row) {
        let end = (bar_start + bar_width).min(width as usize);
        for px in row[bar_start * 4..end * 4].chunks_exact_mut(4) {
            px.copy_from_slice(&[230, 230, 230, 255]);
        }
    }
    RawFrame::new(data, width, height, bytes_per_row, PixelFormat::Bgra32).recycled_into(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latest::latest;
    use crate::pipeline::PipelineStats;

    fn attach(backend: &mut SyntheticBackend) -> Result<()> {
        let rear = backend
            .devices()
            .into_iter()
            .find(|d| d.position == Position::Back)
            .ok_or_else(|| anyhow!("no rear device"))?;
        backend.attach_input(&rear, SessionPreset::Vga640x480)?;
        backend.attach_output(OutputSettings::default())
    }

    #[test]
    fn source_names_map_to_rear_devices() -> Result<()> {
        let backend = SyntheticBackend::from_source("stub://dock")?;
        let devices = backend.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "stub://dock");
        assert_eq!(devices[0].position, Position::Back);
        assert!(SyntheticBackend::from_source("/dev/video0").is_err());
        assert!(SyntheticBackend::from_source("stub://").is_err());
        Ok(())
    }

    #[test]
    fn frame_rate_requires_configuration_lock() -> Result<()> {
        let mut backend = SyntheticBackend::front_and_rear();
        let rear = backend.devices()[1].clone();
        assert!(backend
            .set_min_frame_duration(FrameDuration::per_second(20))
            .is_err());

        backend.lock_for_configuration(&rear)?;
        assert!(backend.lock_for_configuration(&rear).is_err());
        backend.set_min_frame_duration(FrameDuration::per_second(20))?;
        backend.unlock_for_configuration();

        assert!(!backend.is_config_locked());
        assert_eq!(backend.min_frame_duration(), FrameDuration::new(1, 20));
        Ok(())
    }

    #[test]
    fn start_requires_attached_input_and_output() {
        let mut backend = SyntheticBackend::front_and_rear();
        let (tx, _rx) = latest();
        let sink = FrameSink::new(tx, Arc::new(PipelineStats::default()));
        assert!(backend.start(sink).is_err());
        assert!(!backend.feed().is_registered());
    }

    #[test]
    fn feed_delivers_into_registered_sink() -> Result<()> {
        let mut backend = SyntheticBackend::front_and_rear();
        attach(&mut backend)?;
        let feed = backend.feed();
        assert!(!feed.push(RawFrame::filled_bgra(2, 2, 0, [0, 0, 0, 255])));

        let (tx, rx) = latest();
        backend.start(FrameSink::new(tx, Arc::new(PipelineStats::default())))?;
        assert_eq!(feed.registrations(), 1);
        assert!(feed.push(RawFrame::filled_bgra(2, 2, 0, [0, 0, 0, 255])));
        let sample = rx
            .try_recv()
            .map_err(|_| anyhow!("sample not delivered"))?;
        assert_eq!(sample.sequence, 1);

        backend.stop();
        assert!(!feed.is_registered());
        assert!(backend.attached_input().is_none());
        Ok(())
    }

    #[test]
    fn generator_emits_padded_bgra_frames() -> Result<()> {
        let mut backend = SyntheticBackend::front_and_rear().generating();
        attach(&mut backend)?;
        let (tx, rx) = latest();
        backend.start(FrameSink::new(tx, Arc::new(PipelineStats::default())))?;

        let sample = rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| anyhow!("no generated frame"))?;
        let frame = sample.image_buffer()?;
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.format, PixelFormat::Bgra32);
        assert_eq!(frame.bytes_per_row % STRIDE_ALIGN, 0);
        assert!(frame.bytes_per_row >= 640 * 4);

        backend.stop();
        Ok(())
    }

    #[test]
    fn generated_frames_recycle_pool_memory() -> Result<()> {
        let pool = FramePool::new();
        let frame = test_pattern(&pool, 8, 4, 3);
        assert_eq!(pool.idle_count(), 0);
        drop(frame);
        assert_eq!(pool.idle_count(), 1);
        Ok(())
    }

    #[test]
    fn setup_faults_fail_their_step() {
        let faults = SyntheticFaults {
            input: true,
            ..SyntheticFaults::default()
        };
        let mut backend = SyntheticBackend::front_and_rear().with_faults(faults);
        let rear = backend.devices()[1].clone();
        assert!(backend
            .attach_input(&rear, SessionPreset::Vga640x480)
            .is_err());
        assert!(backend.attach_output(OutputSettings::default()).is_ok());
    }
}
