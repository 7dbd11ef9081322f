//! Validated experiment configuration.
//!
//! Built only by [`validate`](crate::config::validation::validate) and never
//! modified afterwards; the sequencer shares it as `Arc<ExperimentConfig>`.
//! [`SingleCapture`] is the smaller configuration behind a one-off burst.

use serde::Serialize;
use std::time::Duration;

use crate::experiment::scale::TRIM_EACH_END;
use crate::hardware::{CameraControls, LinePin};

/// Exposure values visited at every stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ShutterSweep {
    /// One fixed exposure.
    Single {
        /// Exposure in microseconds.
        shutter_us: u32,
    },
    /// `from, from+by, ..., to` inclusive. `to - from` is a multiple of `by`.
    Range {
        /// First exposure, µs.
        from_us: u32,
        /// Last exposure, µs.
        to_us: u32,
        /// Step, µs.
        by_us: u32,
    },
}

impl ShutterSweep {
    /// Every exposure value in visiting order.
    pub fn values(&self) -> Vec<u32> {
        match *self {
            ShutterSweep::Single { shutter_us } => vec![shutter_us],
            ShutterSweep::Range { from_us, to_us, by_us } => {
                (from_us..=to_us).step_by(by_us.max(1) as usize).collect()
            }
        }
    }

    /// Exposure used to configure the camera at acquisition time.
    pub fn first(&self) -> u32 {
        match *self {
            ShutterSweep::Single { shutter_us } => shutter_us,
            ShutterSweep::Range { from_us, .. } => from_us,
        }
    }
}

/// Camera values applied at every shutter iteration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraSettings {
    /// Lens position in dioptres, 0..=10.
    pub lens_position: f64,
    /// Red white-balance gain, 1..=8.
    pub colour_gain_red: f64,
    /// Blue white-balance gain, 1..=8.
    pub colour_gain_blue: f64,
    /// Sensor analogue gain, 1..=8.
    pub analog_gain: f64,
}

impl CameraSettings {
    /// The four per-iteration controls at the given exposure.
    pub fn controls(&self, shutter_us: u32) -> CameraControls {
        CameraControls {
            exposure_us: Some(shutter_us),
            analogue_gain: Some(self.analog_gain),
            colour_gains: Some((self.colour_gain_red, self.colour_gain_blue)),
            lens_position: Some(self.lens_position),
        }
    }
}

/// One kind of burst: file prefix, frame count and spacing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BurstSettings {
    /// Filename prefix, e.g. `noise_`.
    pub prefix: String,
    /// Frames per burst.
    pub image_count: u32,
    /// Pause between consecutive frames.
    #[serde(with = "duration_secs")]
    pub pause: Duration,
    /// Also write a `.dng` per frame.
    pub save_raw: bool,
}

/// LED capture block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedSettings {
    /// LED1 and LED2, both driven high during an LED burst.
    pub lines: [LinePin; 2],
    /// Burst taken with the LEDs on.
    pub burst: BurstSettings,
}

/// Load-cell block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScaleSettings {
    /// HX711 DOUT line.
    pub data_pin: LinePin,
    /// HX711 PD_SCK line.
    pub clock_pin: LinePin,
    /// Counts per gram.
    pub reference_unit: f64,
    /// Conversions kept per weighing, before trimming.
    pub samples: usize,
}

/// Everything a sequenced run needs, range-checked.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExperimentConfig {
    /// Per-iteration camera values.
    pub camera: CameraSettings,
    /// Exposures visited at every stage.
    pub sweep: ShutterSweep,
    /// Lamp-off burst at each exposure.
    pub noise: BurstSettings,
    /// Lamp-on burst at each exposure.
    pub illuminated: BurstSettings,
    /// Present when LED capture is enabled.
    pub led: Option<LedSettings>,
    /// Present when the sample is weighed every stage.
    pub scale: Option<ScaleSettings>,
    /// Line switching the main lamp.
    pub lamp: LinePin,
    /// Write a `.json` sidecar per frame.
    pub save_metadata: bool,
    /// Number of stages, 1..=100.
    pub stage_count: u32,
    /// Minutes between stage starts, 0..=120.
    pub interval_minutes: f64,
    /// Lamp-on dwell before the illuminated pass.
    #[serde(with = "duration_secs")]
    pub preheat: Duration,
}

impl ExperimentConfig {
    /// Settings that pass validation but will fail or misbehave at run time.
    ///
    /// The caller decides how to surface them; validation itself stays silent.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(scale) = &self.scale {
            if scale.samples <= 2 * TRIM_EACH_END {
                warnings.push(format!(
                    "Scale sample count {} leaves nothing after trimming {} from each end; \
                     the scale phase will fail",
                    scale.samples, TRIM_EACH_END
                ));
            }
        }
        warnings
    }
}

/// Which one-off burst to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// The noise block of the settings file.
    Noise,
    /// The illuminated block of the settings file.
    Illuminated,
}

impl CaptureKind {
    /// Word used in messages, e.g. "noise".
    pub fn name(self) -> &'static str {
        match self {
            CaptureKind::Noise => "noise",
            CaptureKind::Illuminated => "illuminated",
        }
    }
}

/// A single validated burst at the typed shutter speed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SingleCapture {
    /// Which settings block this came from.
    pub kind: CaptureKind,
    /// Camera values for the burst.
    pub camera: CameraSettings,
    /// Exposure in microseconds.
    pub shutter_us: u32,
    /// Prefix, count, pause and RAW flag.
    pub burst: BurstSettings,
    /// Write a `.json` sidecar per frame.
    pub save_metadata: bool,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
