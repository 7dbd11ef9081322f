//! Configuration.
//!
//! Two layers with different owners:
//!
//! - [`ExperimentSettings`] is the operator's settings file (what to capture).
//!   It is checked by [`validation::validate`] and becomes an immutable
//!   [`ExperimentConfig`].
//! - [`RigConfig`] describes the machine the run executes on (which device
//!   backends, GPIO chip, settle delays, logging). It is loaded with figment
//!   from built-in defaults, then `rig.toml`, then the environment.
//!
//! # Environment Variable Overrides
//!
//! Variables with the `RIG_` prefix override file values. Nested keys are
//! separated by a double underscore:
//!
//! ```text
//! RIG_APPLICATION__LOG_LEVEL=debug
//! RIG_DEVICES__CAMERA=rpicam
//! RIG_TIMING__ILLUMINATED_SETTLE_MS=500
//! ```

pub mod experiment;
pub mod settings;
pub mod validation;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, RigError};

pub use experiment::{
    BurstSettings, CameraSettings, CaptureKind, ExperimentConfig, LedSettings, ScaleSettings,
    ShutterSweep, SingleCapture,
};
pub use settings::ExperimentSettings;
pub use validation::{validate, validate_single};

/// File read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "rig.toml";

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    /// Name and logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device backends.
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Output image size.
    #[serde(default)]
    pub camera: CameraOutputConfig,
    /// Settle delays.
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Written into logs and the run manifest.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "capture-rig".into(),
            log_level: "info".into(),
            log_format: "pretty".into(),
        }
    }
}

/// Camera implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    /// Placeholder files, no hardware.
    Simulated,
    /// `rpicam-still` on a Raspberry Pi.
    Rpicam,
}

/// Implementation of the lamp, LED and scale lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineBackend {
    /// In-memory lines and a scripted scale.
    Simulated,
    /// Linux GPIO character device; also used for the HX711.
    Gpio,
}

/// Which device implementations a run uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Camera implementation.
    pub camera: CameraBackend,
    /// Line and scale implementation.
    pub lines: LineBackend,
    /// GPIO character device name, e.g. `gpiochip0`.
    pub gpio_chip: String,
    /// Path or name of the still-capture executable.
    pub rpicam_binary: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            camera: CameraBackend::Simulated,
            lines: LineBackend::Simulated,
            gpio_chip: "gpiochip0".into(),
            rpicam_binary: PathBuf::from("rpicam-still"),
        }
    }
}

impl DeviceConfig {
    /// Every device simulated.
    pub fn simulated() -> Self {
        Self::default()
    }
}

/// Output image size. Both unset means full sensor resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraOutputConfig {
    /// Output width in pixels.
    #[serde(default)]
    pub width: Option<u32>,
    /// Output height in pixels.
    #[serde(default)]
    pub height: Option<u32>,
}

impl CameraOutputConfig {
    /// `(width, height)` when both are set.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// Settle delays after controls change, before a burst starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// After new camera controls, before the noise burst.
    #[serde(default = "default_control_settle")]
    pub control_settle_ms: u64,
    /// After the noise burst, before the LED burst.
    #[serde(default = "default_led_settle")]
    pub led_settle_ms: u64,
    /// After new camera controls, before each illuminated burst.
    #[serde(default = "default_illuminated_settle")]
    pub illuminated_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            control_settle_ms: default_control_settle(),
            led_settle_ms: default_led_settle(),
            illuminated_settle_ms: default_illuminated_settle(),
        }
    }
}

impl TimingConfig {
    /// Wait before each noise burst.
    pub fn noise_settle(&self) -> Duration {
        Duration::from_millis(self.control_settle_ms)
    }

    /// Wait before each LED burst.
    pub fn led_settle(&self) -> Duration {
        Duration::from_millis(self.led_settle_ms)
    }

    /// Wait before each illuminated burst.
    pub fn illuminated_settle(&self) -> Duration {
        Duration::from_millis(self.illuminated_settle_ms)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_control_settle() -> u64 {
    1000
}

fn default_led_settle() -> u64 {
    1000
}

fn default_illuminated_settle() -> u64 {
    2000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RigConfig {
    /// Loads defaults, then `path` (or `rig.toml` if present), then `RIG_*`
    /// environment variables, and validates the result.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if let Some(explicit) = path {
            if !explicit.exists() {
                return Err(RigError::Settings(format!(
                    "configuration file {} not found",
                    explicit.display()
                )));
            }
        }
        Self::from_figment(
            Figment::from(Serialized::defaults(RigConfig::default()))
                .merge(Toml::file(file))
                .merge(Env::prefixed("RIG_").split("__")),
        )
    }

    /// Extracts and validates a configuration from any figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values figment cannot check by type alone.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RigError::Settings(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(RigError::Settings(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.camera.width.is_some() != self.camera.height.is_some() {
            return Err(RigError::Settings(
                "camera.width and camera.height must be set together".into(),
            ));
        }
        if self.camera.width == Some(0) || self.camera.height == Some(0) {
            return Err(RigError::Settings("camera resolution must be non-zero".into()));
        }

        if self.devices.gpio_chip.trim().is_empty() {
            return Err(RigError::Settings("devices.gpio_chip cannot be empty".into()));
        }

        Ok(())
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| RigError::Settings(e.to_string()))
    }
}
