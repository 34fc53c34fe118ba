//! Capture session setup and lifecycle.
//!
//! A `CaptureSession` is the single owner of a capture backend. It selects the first
//! rear-facing device, attaches it as input, attaches a BGRA frame output with the
//! late-frame discard policy, and caps the frame rate under the device's configuration
//! lock. The session is not `Clone`; whoever holds it owns the hardware connection.
//!
//! Setup failures are terminal for the attempt: the session stays `Idle` and never
//! registers a frame sink.

use anyhow::{bail, Result};
use thiserror::Error;

use crate::capture::{
    CaptureBackend, DeviceInfo, FrameDuration, FrameSink, OutputSettings, Position, SessionPreset,
};

/// Frame-rate cap applied to the hardware unless configured otherwise.
pub const DEFAULT_MAX_FPS: u32 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no rear-facing capture device found")]
    NoDeviceFound,
    #[error("could not attach {device} as capture input: {reason}")]
    InputAttach { device: String, reason: String },
    #[error("could not attach the frame output: {0}")]
    OutputAttach(String),
    #[error("could not configure {device}: {reason}")]
    DeviceLock { device: String, reason: String },
    #[error("capture session has already been torn down")]
    TornDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub preset: SessionPreset,
    pub min_frame_duration: FrameDuration,
    pub output: OutputSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            preset: SessionPreset::Vga640x480,
            min_frame_duration: FrameDuration::per_second(DEFAULT_MAX_FPS),
            output: OutputSettings::default(),
        }
    }
}

/// Holds a device's configuration lock; unlocks on drop.
struct ConfigurationLock<'a, B: CaptureBackend> {
    backend: &'a mut B,
}

impl<'a, B: CaptureBackend> ConfigurationLock<'a, B> {
    fn acquire(backend: &'a mut B, device: &DeviceInfo) -> Result<Self> {
        backend.lock_for_configuration(device)?;
        Ok(Self { backend })
    }

    fn set_min_frame_duration(&mut self, duration: FrameDuration) -> Result<()> {
        self.backend.set_min_frame_duration(duration)
    }
}

impl<B: CaptureBackend> Drop for ConfigurationLock<'_, B> {
    fn drop(&mut self) {
        self.backend.unlock_for_configuration();
    }
}

pub struct CaptureSession<B: CaptureBackend> {
    backend: B,
    settings: SessionSettings,
    state: SessionState,
    device: Option<DeviceInfo>,
}

impl<B: CaptureBackend> CaptureSession<B> {
    pub fn new(backend: B, settings: SessionSettings) -> Self {
        Self {
            backend,
            settings,
            state: SessionState::Idle,
            device: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The device selected by a successful `configure`.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Select and configure the rear-facing device. Leaves the session `Idle` on failure.
    pub fn configure(&mut self) -> Result<DeviceInfo, ConfigError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Stopped => return Err(ConfigError::TornDown),
            SessionState::Configured | SessionState::Running => {
                if let Some(device) = &self.device {
                    return Ok(device.clone());
                }
            }
        }

        let device = match self.setup() {
            Ok(device) => device,
            Err(err) => {
                // Release whatever the failed attempt attached.
                self.backend.stop();
                return Err(err);
            }
        };
        log::info!(
            "CaptureSession: configured {} ({}) via {} backend, {:?} at {}/{} s per frame",
            device.name,
            device.id,
            self.backend.name(),
            self.settings.preset,
            self.settings.min_frame_duration.value,
            self.settings.min_frame_duration.timescale
        );
        self.device = Some(device.clone());
        self.state = SessionState::Configured;
        Ok(device)
    }

    fn setup(&mut self) -> Result<DeviceInfo, ConfigError> {
        let device = self
            .backend
            .devices()
            .into_iter()
            .find(|device| device.position == Position::Back)
            .ok_or(ConfigError::NoDeviceFound)?;

        self.backend
            .attach_input(&device, self.settings.preset)
            .map_err(|err| ConfigError::InputAttach {
                device: device.id.clone(),
                reason: err.to_string(),
            })?;

        self.backend
            .attach_output(self.settings.output)
            .map_err(|err| ConfigError::OutputAttach(err.to_string()))?;

        let lock_error = |err: anyhow::Error| ConfigError::DeviceLock {
            device: device.id.clone(),
            reason: err.to_string(),
        };
        let mut lock = ConfigurationLock::acquire(&mut self.backend, &device).map_err(lock_error)?;
        lock.set_min_frame_duration(self.settings.min_frame_duration)
            .map_err(lock_error)?;
        drop(lock);

        Ok(device)
    }

    /// Register `sink` and begin frame delivery.
    pub fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.state != SessionState::Configured {
            bail!(
                "capture session is {:?}; start requires a configured session",
                self.state
            );
        }
        self.backend.start(sink)?;
        self.state = SessionState::Running;
        log::info!("CaptureSession: running");
        Ok(())
    }

    /// Stop delivery and release the device. Terminal.
    pub fn stop(&mut self) {
        if self.state != SessionState::Stopped {
            self.backend.stop();
            log::info!("CaptureSession: stopped");
        }
        self.device = None;
        self.state = SessionState::Stopped;
    }
}

impl<B: CaptureBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
