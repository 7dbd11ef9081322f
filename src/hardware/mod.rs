//! Device capability traits and shared device types.
//!
//! The sequencer talks to three kinds of hardware, each behind a capability
//! trait with a simulated and a hardware implementation:
//!
//! - [`CameraController`] - still camera with manual exposure control
//! - [`IlluminationController`] - digital output lines switching the lamp and LEDs
//! - [`MassSensorController`] - load-cell ADC used to weigh the sample
//!
//! Control values travel as [`ControlMap`]s keyed by the camera stack's
//! control names (`ExposureTime`, `AnalogueGain`, ...), which is also the
//! shape written to metadata sidecars.

pub mod mock;
pub mod pins;
pub mod rpicam;

#[cfg(feature = "hardware_gpio")]
pub mod gpio;
#[cfg(feature = "hardware_gpio")]
pub mod hx711;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::acquisition::burst::{self, BurstRequest, CaptureBurst, ProgressFn};
use crate::acquisition::cancel::CancelToken;
use crate::config::{CameraBackend, DeviceConfig, ExperimentConfig, LineBackend};
use crate::error::{AppResult, RigError};

pub use pins::{LinePin, PIN_TABLE};

// =============================================================================
// Control values
// =============================================================================

/// A single camera control or metadata value.
///
/// Tuple-like values (colour gains, crop rectangles) are stored as [`ControlValue::List`]
/// so they serialize as plain JSON arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// Reported but unset.
    Null,
    /// On/off control, e.g. `AeEnable`.
    Bool(bool),
    /// Integer control or metadata value.
    Int(i64),
    /// Floating-point control or metadata value.
    Float(f64),
    /// Tuple or array value.
    List(Vec<ControlValue>),
    /// Nested metadata block.
    Map(BTreeMap<String, ControlValue>),
    /// Anything else the camera reports as text.
    Text(String),
}

/// Control name → value, ordered by name.
pub type ControlMap = BTreeMap<String, ControlValue>;

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

impl From<i64> for ControlValue {
    fn from(v: i64) -> Self {
        ControlValue::Int(v)
    }
}

impl From<u32> for ControlValue {
    fn from(v: u32) -> Self {
        ControlValue::Int(i64::from(v))
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        ControlValue::Float(v)
    }
}

impl From<(f64, f64)> for ControlValue {
    fn from((a, b): (f64, f64)) -> Self {
        ControlValue::List(vec![ControlValue::Float(a), ControlValue::Float(b)])
    }
}

impl From<serde_json::Value> for ControlValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ControlValue::Null,
            Value::Bool(b) => ControlValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ControlValue::Int(i),
                None => ControlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ControlValue::Text(s),
            Value::Array(items) => {
                ControlValue::List(items.into_iter().map(ControlValue::from).collect())
            }
            Value::Object(map) => ControlValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ControlValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Control names used by the camera stack.
pub mod control_names {
    /// Exposure in microseconds.
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    /// Sensor analogue gain.
    pub const ANALOGUE_GAIN: &str = "AnalogueGain";
    /// `[red, blue]` white-balance gains.
    pub const COLOUR_GAINS: &str = "ColourGains";
    /// Lens focus position.
    pub const LENS_POSITION: &str = "LensPosition";
    /// `[x, y, width, height]` crop on the sensor.
    pub const SCALER_CROP: &str = "ScalerCrop";
}

/// A partial set of camera controls. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraControls {
    /// Exposure time in microseconds.
    pub exposure_us: Option<u32>,
    /// Sensor analogue gain.
    pub analogue_gain: Option<f64>,
    /// (red, blue) white-balance gains.
    pub colour_gains: Option<(f64, f64)>,
    /// Lens position in dioptres.
    pub lens_position: Option<f64>,
}

impl CameraControls {
    /// Overlays the `Some` fields of `other` onto `self`.
    pub fn merge(&mut self, other: &CameraControls) {
        if other.exposure_us.is_some() {
            self.exposure_us = other.exposure_us;
        }
        if other.analogue_gain.is_some() {
            self.analogue_gain = other.analogue_gain;
        }
        if other.colour_gains.is_some() {
            self.colour_gains = other.colour_gains;
        }
        if other.lens_position.is_some() {
            self.lens_position = other.lens_position;
        }
    }

    /// Only the fields that are set, under their camera-stack names.
    pub fn to_control_map(&self) -> ControlMap {
        let mut map = ControlMap::new();
        if let Some(v) = self.exposure_us {
            map.insert(control_names::EXPOSURE_TIME.into(), v.into());
        }
        if let Some(v) = self.analogue_gain {
            map.insert(control_names::ANALOGUE_GAIN.into(), v.into());
        }
        if let Some(v) = self.colour_gains {
            map.insert(control_names::COLOUR_GAINS.into(), v.into());
        }
        if let Some(v) = self.lens_position {
            map.insert(control_names::LENS_POSITION.into(), v.into());
        }
        map
    }
}

/// Full still-capture configuration applied once at run start.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraSetup {
    /// Initial controls.
    pub controls: CameraControls,
    /// Output size; `None` captures at full sensor resolution.
    pub resolution: Option<(u32, u32)>,
}

/// Controls pinned for every still: no auto exposure or white balance, neutral
/// tone curve, noise reduction off.
pub fn fixed_still_controls() -> ControlMap {
    let mut map = ControlMap::new();
    map.insert("AeEnable".into(), false.into());
    map.insert("AwbEnable".into(), false.into());
    map.insert("Brightness".into(), 0.0.into());
    map.insert("Contrast".into(), 1.0.into());
    map.insert("Saturation".into(), 1.0.into());
    map.insert("Sharpness".into(), 1.0.into());
    map.insert("NoiseReductionMode".into(), 0i64.into());
    map
}

/// Where a single frame goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StillTarget {
    /// JPEG path.
    pub image_path: PathBuf,
    /// DNG sidecar path when RAW capture is requested.
    pub raw_path: Option<PathBuf>,
}

// =============================================================================
// Capability traits
// =============================================================================

/// Still camera under manual control.
///
/// Lifecycle: `configure` → `start` → (`set_controls` / `capture_still`)* → `stop`.
#[async_trait]
pub trait CameraController: Send + Sync {
    /// Applies the full capture configuration. Must precede `start`.
    async fn configure(&mut self, setup: &CameraSetup) -> AppResult<()>;

    /// Starts streaming with the configured setup.
    async fn start(&mut self) -> AppResult<()>;

    /// Changes a subset of controls. Only called between bursts.
    async fn set_controls(&mut self, controls: &CameraControls) -> AppResult<()>;

    /// Captures one frame and returns the controls the camera reports for it.
    async fn capture_still(&mut self, target: &StillTarget) -> AppResult<ControlMap>;

    /// Captures a whole burst; see [`burst::drive`].
    async fn capture_burst(
        &mut self,
        request: &BurstRequest,
        cancel: &CancelToken,
        progress: &ProgressFn,
    ) -> AppResult<CaptureBurst> {
        burst::drive(self, request, cancel, progress).await
    }

    /// Stops streaming. Idempotent.
    async fn stop(&mut self) -> AppResult<()>;

    /// True between `start` and `stop`.
    fn is_active(&self) -> bool;
}

/// Digital output lines driving the lamp and auxiliary LEDs.
#[async_trait]
pub trait IlluminationController: Send + Sync {
    /// Claims `line` as an output, initially low, for the rest of the run.
    async fn reserve(&mut self, line: LinePin) -> AppResult<()>;

    /// Drives a reserved line high.
    async fn assert_high(&mut self, line: LinePin) -> AppResult<()>;

    /// Drives a reserved line low.
    async fn assert_low(&mut self, line: LinePin) -> AppResult<()>;

    /// Drives every reserved line low and gives the lines back.
    async fn release_all(&mut self) -> AppResult<()>;
}

/// Load-cell ADC.
#[async_trait]
pub trait MassSensorController: Send + Sync {
    /// Wakes the ADC.
    async fn power_up(&mut self) -> AppResult<()>;

    /// Sets the counts-per-gram divisor.
    async fn set_reference(&mut self, unit: f64) -> AppResult<()>;

    /// Mean of `count` conversions, in grams.
    async fn sample(&mut self, count: usize) -> AppResult<f64>;

    /// Puts the ADC to sleep. Idempotent.
    async fn power_down(&mut self) -> AppResult<()>;

    /// True between `power_up` and `power_down`.
    fn is_powered(&self) -> bool;
}

/// Camera handle shared between the sequencer and the burst task it spawns.
pub type SharedCamera = Arc<Mutex<Box<dyn CameraController>>>;

/// Every device handle a run owns.
pub struct DeviceSet {
    /// Still camera.
    pub camera: Box<dyn CameraController>,
    /// Lamp and LED lines.
    pub illumination: Box<dyn IlluminationController>,
    /// Present only when the experiment weighs the sample.
    pub mass_sensor: Option<Box<dyn MassSensorController>>,
}

/// Opens only the camera selected in `devices`.
pub fn open_camera(devices: &DeviceConfig) -> Box<dyn CameraController> {
    match devices.camera {
        CameraBackend::Simulated => Box::new(mock::SimulatedCamera::new()),
        CameraBackend::Rpicam => Box::new(rpicam::RpicamCamera::new(&devices.rpicam_binary)),
    }
}

/// Opens the devices selected in `devices` for `experiment`.
///
/// Backends that need hardware support compiled out of this build return
/// [`RigError::DeviceUnavailable`].
pub fn open_devices(devices: &DeviceConfig, experiment: &ExperimentConfig) -> AppResult<DeviceSet> {
    let camera = open_camera(devices);

    let illumination: Box<dyn IlluminationController> = match devices.lines {
        LineBackend::Simulated => Box::new(mock::SimulatedIllumination::new()),
        LineBackend::Gpio => open_gpio_lines(devices)?,
    };

    let mass_sensor: Option<Box<dyn MassSensorController>> = match &experiment.scale {
        None => None,
        Some(scale) => Some(match devices.lines {
            LineBackend::Simulated => {
                Box::new(mock::SimulatedScale::new()) as Box<dyn MassSensorController>
            }
            LineBackend::Gpio => open_hx711(devices, scale.data_pin, scale.clock_pin)?,
        }),
    };

    info!(
        camera = ?devices.camera,
        lines = ?devices.lines,
        mass_sensor = mass_sensor.is_some(),
        "Devices opened"
    );

    Ok(DeviceSet {
        camera,
        illumination,
        mass_sensor,
    })
}

#[cfg(feature = "hardware_gpio")]
fn open_gpio_lines(devices: &DeviceConfig) -> AppResult<Box<dyn IlluminationController>> {
    Ok(Box::new(gpio::GpioIllumination::open(&devices.gpio_chip)?))
}

#[cfg(not(feature = "hardware_gpio"))]
fn open_gpio_lines(_devices: &DeviceConfig) -> AppResult<Box<dyn IlluminationController>> {
    Err(RigError::DeviceUnavailable(
        "GPIO support not enabled. Rebuild with --features hardware_gpio".into(),
    ))
}

#[cfg(feature = "hardware_gpio")]
fn open_hx711(
    devices: &DeviceConfig,
    data: LinePin,
    clock: LinePin,
) -> AppResult<Box<dyn MassSensorController>> {
    Ok(Box::new(hx711::Hx711::open(&devices.gpio_chip, data, clock)?))
}

#[cfg(not(feature = "hardware_gpio"))]
fn open_hx711(
    _devices: &DeviceConfig,
    _data: LinePin,
    _clock: LinePin,
) -> AppResult<Box<dyn MassSensorController>> {
    Err(RigError::DeviceUnavailable(
        "HX711 support not enabled. Rebuild with --features hardware_gpio".into(),
    ))
}
