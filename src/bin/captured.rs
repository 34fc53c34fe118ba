//! captured - Capture Kernel daemon
//!
//! This daemon:
//! 1. Loads configuration (CAPTURE_CONFIG file plus CAPTURE_* overrides)
//! 2. Opens the configured source (stub:// synthetic camera or a V4L2 node)
//! 3. Configures and starts the capture pipeline
//! 4. Runs the UI context on the main thread with a logging display surface
//! 5. Logs pipeline stats periodically and tears down on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_kernel::{
    analysis::BuiltinAnalyzer, config::CaptureConfig, ui_context, AnalysisSink, BitmapImage,
    CaptureBackend, CapturePipeline, PresentationSink, SyntheticBackend, UiContext,
};

const UI_TICK: Duration = Duration::from_millis(100);

/// Display surface for a headless host: logs what would be drawn.
struct LogDisplay {
    shown: u64,
}

impl PresentationSink for LogDisplay {
    fn present(&mut self, image: BitmapImage) {
        self.shown += 1;
        log::debug!(
            "display: frame #{} {}x{} orientation={:?}",
            self.shown,
            image.width(),
            image.height(),
            image.orientation()
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = CaptureConfig::load()?;
    log::info!(
        "captured starting: source={} preset={:?} max_fps={} analyzer={:?}",
        cfg.source,
        cfg.preset,
        cfg.max_fps,
        cfg.analyzer
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    let (ui, dispatcher) = ui_context(LogDisplay { shown: 0 });
    let analyzer = cfg.analyzer.build();

    if cfg.source.starts_with("stub://") {
        let backend = SyntheticBackend::from_source(&cfg.source)?;
        let pipeline = CapturePipeline::new(backend, cfg.session_settings(), analyzer, dispatcher);
        run(pipeline, ui, &cfg, &running)
    } else {
        open_device(&cfg, analyzer, dispatcher, ui, &running)
    }
}

#[cfg(feature = "capture-v4l2")]
fn open_device(
    cfg: &CaptureConfig,
    analyzer: BuiltinAnalyzer,
    dispatcher: capture_kernel::UiDispatcher,
    ui: UiContext<LogDisplay>,
    running: &AtomicBool,
) -> Result<()> {
    let backend = capture_kernel::V4l2Backend::new(cfg.source.clone());
    let pipeline = CapturePipeline::new(backend, cfg.session_settings(), analyzer, dispatcher);
    run(pipeline, ui, cfg, running)
}

#[cfg(not(feature = "capture-v4l2"))]
fn open_device(
    cfg: &CaptureConfig,
    _analyzer: BuiltinAnalyzer,
    _dispatcher: capture_kernel::UiDispatcher,
    _ui: UiContext<LogDisplay>,
    _running: &AtomicBool,
) -> Result<()> {
    Err(anyhow!(
        "source {} needs the capture-v4l2 feature; use stub://<name> otherwise",
        cfg.source
    ))
}

fn run<B: CaptureBackend, A: AnalysisSink + 'static>(
    mut pipeline: CapturePipeline<B, A>,
    mut ui: UiContext<LogDisplay>,
    cfg: &CaptureConfig,
    running: &AtomicBool,
) -> Result<()> {
    match pipeline.configure() {
        Ok(device) => {
            log::info!("capturing from {} ({})", device.name, device.id);
            pipeline.start()?;
        }
        Err(err) => {
            // Setup failure is not fatal: stay up with an empty display.
            log::error!("capture unavailable: {}", err);
        }
    }

    let mut last_stats_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        ui.run_for(UI_TICK);

        if last_stats_log.elapsed() >= cfg.stats_interval {
            let stats = pipeline.stats();
            log::info!(
                "pipeline state={:?} delivered={} late={} dropped={} shown={}",
                pipeline.state(),
                stats.delivered,
                stats.discarded_late,
                stats.dropped,
                ui.presented()
            );
            last_stats_log = Instant::now();
        }
    }

    log::info!("shutdown signal received, stopping capture...");
    pipeline.stop();
    ui.run_pending();
    log::info!("captured stopped after {} frames shown", ui.sink().shown);
    Ok(())
}
