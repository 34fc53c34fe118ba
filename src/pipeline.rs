//! Capture pipeline orchestration.
//!
//! `CapturePipeline` owns the capture session and runs the capture context: a single
//! dedicated thread that takes the newest sample from the backend and runs
//! convert -> rotate -> analyze before handing the result to the UI context.
//!
//! The capture context is responsible for:
//! - processing samples strictly one at a time, in arrival order
//! - dropping a frame that fails to convert, logging it, and moving on
//! - releasing the raw buffer before rotation and analysis start
//!
//! The capture context MUST NOT:
//! - queue samples (the backend's overwrite slot is the only buffer)
//! - call `PresentationSink::present` (only the UI context does)

use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::analysis::AnalysisSink;
use crate::capture::{CaptureBackend, DeviceInfo, FrameSink};
use crate::convert::{BitmapInfo, ConvertError, FrameConverter};
use crate::frame::{BitmapImage, BufferError, Orientation, Sample};
use crate::latest::{latest, LatestReceiver, Wait};
use crate::orient::OrientationCorrector;
use crate::present::UiDispatcher;
use crate::session::{CaptureSession, ConfigError, SessionSettings, SessionState};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a single frame was dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters shared between the backend, the capture context and observers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    delivered: AtomicU64,
    discarded_late: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    processing: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Samples handed over by the backend.
    pub delivered: u64,
    /// Samples replaced before the capture context picked them up.
    pub discarded_late: u64,
    /// Frames dropped on a buffer or conversion error.
    pub dropped: u64,
    /// Images handed to the UI context.
    pub dispatched: u64,
    pub processing: bool,
}

impl PipelineStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded_late(&self) {
        self.discarded_late.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::Release);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded_late: self.discarded_late.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            processing: self.is_processing(),
        }
    }
}

// ----------------------------------------------------------------------------
// FrameProcessor: the per-frame stage chain
// ----------------------------------------------------------------------------

/// Convert, correct and analyze one sample.
pub struct FrameProcessor<A: AnalysisSink> {
    converter: FrameConverter,
    corrector: OrientationCorrector,
    analysis: A,
}

impl<A: AnalysisSink> FrameProcessor<A> {
    /// Stage chain for the rear sensor: BGRA premultiplied little-endian input, frames
    /// tagged `Right` and corrected by the fixed sensor rotation.
    pub fn new(analysis: A) -> Self {
        Self {
            converter: FrameConverter::new(BitmapInfo::CAPTURE_BGRA)
                .with_orientation(Orientation::Right),
            corrector: OrientationCorrector::new(),
            analysis,
        }
    }

    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    /// The raw buffer is released before rotation starts.
    pub fn process(&mut self, sample: Sample) -> Result<BitmapImage, FrameError> {
        let image = self.converter.convert(sample.image_buffer()?)?;
        drop(sample);
        let corrected = self.corrector.correct(image);
        Ok(self.analysis.analyze(corrected))
    }
}

// ----------------------------------------------------------------------------
// CapturePipeline
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configured,
    Running,
    /// Running, with a frame currently on the capture context.
    Processing,
    Stopped,
}

struct CaptureContext {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct CapturePipeline<B: CaptureBackend, A: AnalysisSink + 'static> {
    session: CaptureSession<B>,
    stages: Option<(FrameProcessor<A>, UiDispatcher)>,
    stats: Arc<PipelineStats>,
    context: Option<CaptureContext>,
}

impl<B: CaptureBackend, A: AnalysisSink + 'static> CapturePipeline<B, A> {
    pub fn new(
        backend: B,
        settings: SessionSettings,
        analysis: A,
        dispatcher: UiDispatcher,
    ) -> Self {
        Self {
            session: CaptureSession::new(backend, settings),
            stages: Some((FrameProcessor::new(analysis), dispatcher)),
            stats: Arc::new(PipelineStats::default()),
            context: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        match self.session.state() {
            SessionState::Idle => PipelineState::Idle,
            SessionState::Configured => PipelineState::Configured,
            SessionState::Running if self.stats.is_processing() => PipelineState::Processing,
            SessionState::Running => PipelineState::Running,
            SessionState::Stopped => PipelineState::Stopped,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session(&self) -> &CaptureSession<B> {
        &self.session
    }

    /// Set up the capture session. On failure the pipeline stays `Idle` and no frame
    /// will ever be processed.
    pub fn configure(&mut self) -> Result<DeviceInfo, ConfigError> {
        self.session.configure().map_err(|err| {
            log::error!("CapturePipeline: setup failed: {}", err);
            err
        })
    }

    /// Spawn the capture context and begin hardware delivery.
    pub fn start(&mut self) -> Result<()> {
        if self.session.state() != SessionState::Configured {
            bail!(
                "capture pipeline is {:?}; start requires a configured session",
                self.state()
            );
        }
        let (processor, dispatcher) = self
            .stages
            .take()
            .ok_or_else(|| anyhow!("capture pipeline stages already in use"))?;

        let (tx, rx) = latest();
        if let Err(err) = self.session.start(FrameSink::new(tx, self.stats.clone())) {
            self.stages = Some((processor, dispatcher));
            return Err(err.context("starting capture session"));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let stats = self.stats.clone();
        let spawned = std::thread::Builder::new()
            .name("capture-context".to_string())
            .spawn(move || run_capture_context(rx, processor, dispatcher, stats, shutdown_thread));
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                self.session.stop();
                return Err(err).context("spawning capture context");
            }
        };
        self.context = Some(CaptureContext { shutdown, join });
        Ok(())
    }

    /// Tear the session down. Waits for the frame in flight, if any. Terminal.
    pub fn stop(&mut self) {
        let context = self.context.take();
        if let Some(context) = &context {
            context.shutdown.store(true, Ordering::SeqCst);
        }
        self.session.stop();
        if let Some(context) = context {
            if context.join.join().is_err() {
                log::warn!("CapturePipeline: capture context panicked");
            }
        }
    }
}

impl<B: CaptureBackend, A: AnalysisSink + 'static> Drop for CapturePipeline<B, A> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_context<A: AnalysisSink>(
    rx: LatestReceiver<Sample>,
    mut processor: FrameProcessor<A>,
    dispatcher: UiDispatcher,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
) {
    log::info!(
        "CapturePipeline: capture context running ({} analyzer)",
        processor.analysis().name()
    );
    while !shutdown.load(Ordering::SeqCst) {
        let sample = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(sample) => sample,
            Err(Wait::Timeout) => continue,
            Err(Wait::Disconnected) => break,
        };
        let sequence = sample.sequence;

        stats.set_processing(true);
        let outcome = processor.process(sample);
        stats.set_processing(false);

        match outcome {
            Ok(image) => {
                if dispatcher.dispatch(image) {
                    stats.record_dispatched();
                } else {
                    log::debug!("CapturePipeline: UI context gone, frame {} not shown", sequence);
                }
            }
            Err(err) => {
                stats.record_dropped();
                log::warn!("CapturePipeline: dropped frame {}: {}", sequence, err);
            }
        }
    }
    log::info!("CapturePipeline: capture context exiting");
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
