use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use capture_kernel::capture::{FrameDuration, SessionPreset};
use capture_kernel::config::CaptureConfig;
use capture_kernel::AnalyzerKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_SOURCE",
        "CAPTURE_PRESET",
        "CAPTURE_MAX_FPS",
        "CAPTURE_ANALYZER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": "/dev/video2",
        "preset": "hd1280x720",
        "max_fps": 15,
        "analyzer": "grayscale",
        "stats_interval_secs": 30
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_SOURCE", "stub://bench_camera");
    std::env::set_var("CAPTURE_MAX_FPS", "30");

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!(cfg.source, "stub://bench_camera");
    assert_eq!(cfg.preset, SessionPreset::Hd1280x720);
    assert_eq!(cfg.max_fps, 30);
    assert_eq!(cfg.analyzer, AnalyzerKind::Grayscale);
    assert_eq!(cfg.stats_interval, Duration::from_secs(30));
    let settings = cfg.session_settings();
    assert_eq!(settings.preset, SessionPreset::Hd1280x720);
    assert_eq!(settings.min_frame_duration, FrameDuration::new(1, 30));
    assert!(settings.output.discard_late_frames);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load().expect("load defaults");
    assert_eq!(cfg.source, "stub://rear_camera");
    assert_eq!(cfg.preset, SessionPreset::Vga640x480);
    assert_eq!(cfg.max_fps, 20);
    assert_eq!(cfg.analyzer, AnalyzerKind::Identity);

    clear_env();
}

#[test]
fn rejects_invalid_frame_rate_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_MAX_FPS", "fast");
    assert!(CaptureConfig::load().is_err());
    std::env::set_var("CAPTURE_MAX_FPS", "0");
    assert!(CaptureConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());
    assert!(CaptureConfig::load().is_err());

    std::env::set_var("CAPTURE_CONFIG", "/nonexistent/capture.json");
    assert!(CaptureConfig::load().is_err());

    clear_env();
}
