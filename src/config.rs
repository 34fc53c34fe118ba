use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::analysis::AnalyzerKind;
use crate::capture::{FrameDuration, OutputSettings, SessionPreset};
use crate::session::{SessionSettings, DEFAULT_MAX_FPS};

const DEFAULT_SOURCE: &str = "stub://rear_camera";
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
const MAX_FPS_LIMIT: u32 = 240;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    preset: Option<String>,
    max_fps: Option<u32>,
    analyzer: Option<String>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// `stub://<name>` or a V4L2 device path.
    pub source: String,
    pub preset: SessionPreset,
    pub max_fps: u32,
    pub analyzer: AnalyzerKind,
    pub stats_interval: Duration,
}

impl CaptureConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let preset = match file.preset.as_deref() {
            Some(name) => SessionPreset::from_name(name)?,
            None => SessionPreset::default(),
        };
        let analyzer = match file.analyzer.as_deref() {
            Some(name) => AnalyzerKind::from_name(name)?,
            None => AnalyzerKind::Identity,
        };
        Ok(Self {
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            preset,
            max_fps: file.max_fps.unwrap_or(DEFAULT_MAX_FPS),
            analyzer,
            stats_interval: Duration::from_secs(
                file.stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("CAPTURE_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source.trim().to_string();
            }
        }
        if let Ok(preset) = std::env::var("CAPTURE_PRESET") {
            if !preset.trim().is_empty() {
                self.preset = SessionPreset::from_name(&preset)?;
            }
        }
        if let Ok(fps) = std::env::var("CAPTURE_MAX_FPS") {
            self.max_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_MAX_FPS must be an integer frame rate"))?;
        }
        if let Ok(analyzer) = std::env::var("CAPTURE_ANALYZER") {
            if !analyzer.trim().is_empty() {
                self.analyzer = AnalyzerKind::from_name(&analyzer)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        if !(1..=MAX_FPS_LIMIT).contains(&self.max_fps) {
            return Err(anyhow!(
                "max_fps must be between 1 and {} (got {})",
                MAX_FPS_LIMIT,
                self.max_fps
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        Ok(())
    }

    /// Session settings for this configuration: BGRA output with late-frame discard,
    /// frame rate capped at `max_fps`.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            preset: self.preset,
            min_frame_duration: FrameDuration::per_second(self.max_fps),
            output: OutputSettings::default(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cap_rear_camera_at_twenty_fps() -> Result<()> {
        let cfg = CaptureConfig::from_file(CaptureConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.source, "stub://rear_camera");
        assert_eq!(cfg.analyzer, AnalyzerKind::Identity);
        assert_eq!(cfg.stats_interval, Duration::from_secs(5));
        assert_eq!(cfg.session_settings(), SessionSettings::default());
        Ok(())
    }

    #[test]
    fn unknown_names_in_file_are_rejected() {
        let file = CaptureConfigFile {
            preset: Some("4k".to_string()),
            ..CaptureConfigFile::default()
        };
        assert!(CaptureConfig::from_file(file).is_err());

        let file = CaptureConfigFile {
            analyzer: Some("faces".to_string()),
            ..CaptureConfigFile::default()
        };
        assert!(CaptureConfig::from_file(file).is_err());
    }

    #[test]
    fn frame_rate_out_of_range_fails_validation() -> Result<()> {
        for fps in [0, 241] {
            let file = CaptureConfigFile {
                max_fps: Some(fps),
                ..CaptureConfigFile::default()
            };
            assert!(CaptureConfig::from_file(file)?.validate().is_err());
        }
        Ok(())
    }

    #[test]
    fn zero_stats_interval_fails_validation() -> Result<()> {
        let file = CaptureConfigFile {
            stats_interval_secs: Some(0),
            ..CaptureConfigFile::default()
        };
        assert!(CaptureConfig::from_file(file)?.validate().is_err());
        Ok(())
    }
}
