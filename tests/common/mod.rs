//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use capture_rig::config::{validate, ExperimentConfig, ExperimentSettings};
use capture_rig::experiment::{RecordingReporter, SequencerOptions, StageSequencer};
use capture_rig::hardware::mock::SimulatedRig;
use capture_rig::hardware::LinePin;
use tempfile::TempDir;

pub const LAMP: &str = "GPIO17 (Pin 11)";
pub const LED1: &str = "GPIO22 (Pin 15)";
pub const LED2: &str = "GPIO23 (Pin 16)";
pub const DAT: &str = "GPIO5 (Pin 29)";
pub const CLK: &str = "GPIO6 (Pin 31)";

pub fn pin(label: &str) -> LinePin {
    LinePin::from_label(label).unwrap()
}

/// Two stages ten minutes apart, sweep 100..=200 step 100, no LEDs, no scale.
pub fn base_settings() -> ExperimentSettings {
    ExperimentSettings {
        shutter_speed: "20000".into(),
        lens_position: "2.5".into(),
        colour_gain_red: "2.0".into(),
        colour_gain_blue: "1.8".into(),
        analog_gain: "1.0".into(),
        preheat: "60".into(),
        image_capture: "3".into(),
        pause_between_capture: "1.0".into(),
        illuminated_image_name: "img_".into(),
        lamp_drive: LAMP.into(),
        noise_image_capture: "2".into(),
        noise_image_name: "noise_".into(),
        pause_between_noise_capture: "1.0".into(),
        shutter_speed_from: "100".into(),
        shutter_speed_to: "200".into(),
        shutter_speed_by: "100".into(),
        number_experiments: "2".into(),
        time_between_experiments: "10".into(),
        ..Default::default()
    }
}

pub fn with_leds(mut settings: ExperimentSettings) -> ExperimentSettings {
    settings.led_capture_checkbox = true;
    settings.led1_combobox = LED1.into();
    settings.led2_combobox = LED2.into();
    settings.led_image_count = "1".into();
    settings.pause_between_led_capture = "1".into();
    settings.led_image_name = "led_".into();
    settings
}

pub fn with_scale(mut settings: ExperimentSettings, samples: u32) -> ExperimentSettings {
    settings.scale_check = true;
    settings.dat = DAT.into();
    settings.clk = CLK.into();
    settings.ref_unit = "2817".into();
    settings.scale_num = samples.to_string();
    settings
}

pub fn config(settings: &ExperimentSettings) -> Arc<ExperimentConfig> {
    Arc::new(validate(settings).unwrap())
}

/// A sequencer over `rig` writing into a fresh temp dir.
pub fn sequencer(
    config: Arc<ExperimentConfig>,
    rig: SimulatedRig,
) -> (StageSequencer, RecordingReporter, TempDir, SimulatedMonitors) {
    let dir = TempDir::new().unwrap();
    let recorder = RecordingReporter::new();
    let monitors = SimulatedMonitors {
        camera: rig.camera,
        lines: rig.lines,
        scale: rig.scale,
    };
    let sequencer = StageSequencer::new(
        config,
        rig.devices,
        dir.path().join("run"),
        SequencerOptions::default(),
    )
    .with_reporter(Arc::new(recorder.clone()));
    (sequencer, recorder, dir, monitors)
}

pub struct SimulatedMonitors {
    pub camera: capture_rig::hardware::mock::CameraMonitor,
    pub lines: capture_rig::hardware::mock::LineMonitor,
    pub scale: capture_rig::hardware::mock::ScaleMonitor,
}

impl SimulatedMonitors {
    /// Lamp and LEDs low, nothing reserved, camera stopped, scale asleep.
    pub async fn assert_safe(&self) {
        for label in [LAMP, LED1, LED2] {
            let line = pin(label);
            assert_ne!(self.lines.level(line).await, Some(true), "{label} left high");
            assert!(!self.lines.is_reserved(line).await, "{label} still reserved");
        }
        assert!(!self.camera.is_active().await, "camera still active");
        assert!(!self.scale.is_powered().await, "scale still powered");
    }
}
