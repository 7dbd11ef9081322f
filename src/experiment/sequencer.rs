//! Stage sequencer.
//!
//! Drives one run: for every stage it optionally weighs the sample, walks the
//! shutter sweep capturing a noise burst (and an LED burst) at each exposure,
//! preheats the lamp once, then walks the sweep again capturing illuminated
//! bursts. Between stages it idles until the next stage is due.
//!
//! ```text
//! [SCALE] -> INIT_CAMERA -> (NOISE_CAPTURE [-> LED_CAPTURE]) x sweep
//!         -> PREHEAT_LAMP -> (IMAGE_CAPTURE) x sweep -> IDLE -> next stage
//! ... -> COMPLETE
//! ```
//!
//! The sequencer owns every device for the whole run. Teardown (lamp and
//! LEDs low, camera stopped, load cell asleep, lines released) runs exactly
//! once when [`StageSequencer::run`] finishes, however it finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::acquisition::{BurstRequest, BurstTask, CancelToken, CaptureBurst, ProgressFn};
use crate::config::{BurstSettings, ExperimentConfig, RigConfig, TimingConfig};
use crate::error::{AppResult, RigError};
use crate::experiment::manifest::{RunManifest, RunOutcome};
use crate::experiment::scale::{self, MassReading};
use crate::experiment::schedule::{self, StagePlan};
use crate::experiment::status::{Phase, SequencerEvent, StatusReporter, TracingReporter};
use crate::hardware::{
    CameraSetup, DeviceSet, IlluminationController, LinePin, MassSensorController, SharedCamera,
};

/// Machine-side settings for a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SequencerOptions {
    /// Settle delays.
    pub timing: TimingConfig,
    /// Output size; `None` for full sensor resolution.
    pub resolution: Option<(u32, u32)>,
}

impl SequencerOptions {
    /// Timing and resolution from the runtime configuration.
    pub fn from_rig(rig: &RigConfig) -> Self {
        Self {
            timing: rig.timing.clone(),
            resolution: rig.camera.resolution(),
        }
    }
}

/// What a finished run produced.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Same id as the manifest.
    pub run_id: Uuid,
    /// Dataset root.
    pub root: PathBuf,
    /// Stages that ran to the end.
    pub stages_completed: u32,
    /// Frames across every burst.
    pub frames_captured: u32,
    /// One entry per weighed stage.
    pub weights: Vec<MassReading>,
    /// Where the manifest was written, if it could be.
    pub manifest: Option<PathBuf>,
}

/// Drives a validated experiment through every stage on one device set.
///
/// Consumed by [`run`](Self::run); every line is low and the camera and scale
/// are stopped when it returns, on success or not.
pub struct StageSequencer {
    config: Arc<ExperimentConfig>,
    camera: SharedCamera,
    illumination: Box<dyn IlluminationController>,
    mass_sensor: Option<Box<dyn MassSensorController>>,
    root: PathBuf,
    options: SequencerOptions,
    reporter: Arc<dyn StatusReporter>,
    cancel: CancelToken,
    /// Lines reserved so far, in reservation order.
    reserved: Vec<LinePin>,
    stages_completed: u32,
    frames_captured: u32,
    weights: Vec<MassReading>,
}

impl StageSequencer {
    /// Builds a sequencer writing under `root`. Nothing touches hardware yet.
    pub fn new(
        config: Arc<ExperimentConfig>,
        devices: DeviceSet,
        root: impl Into<PathBuf>,
        options: SequencerOptions,
    ) -> Self {
        Self {
            config,
            camera: Arc::new(Mutex::new(devices.camera)),
            illumination: devices.illumination,
            mass_sensor: devices.mass_sensor,
            root: root.into(),
            options,
            reporter: Arc::new(TracingReporter),
            cancel: CancelToken::new(),
            reserved: Vec::new(),
            stages_completed: 0,
            frames_captured: 0,
            weights: Vec::new(),
        }
    }

    /// Replaces the default tracing reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Shares an existing token instead of a fresh one.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next frame or phase boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs every stage, then tears down.
    ///
    /// The first error wins: a teardown failure is only returned (as
    /// [`RigError::TeardownFailed`]) when the run itself succeeded.
    pub async fn run(mut self) -> AppResult<RunSummary> {
        let mut manifest = RunManifest::begin(&self.config);
        info!(
            run_id = %manifest.run_id,
            root = %self.root.display(),
            stages = self.config.stage_count,
            "Run started"
        );

        let result = self.execute().await;
        let teardown = self.teardown().await;

        let outcome = match (&result, &teardown) {
            (Ok(()), Ok(())) => RunOutcome::Completed,
            (Err(RigError::Cancelled), _) => RunOutcome::Cancelled,
            (Err(e), _) => RunOutcome::Failed {
                error: e.to_string(),
            },
            (Ok(()), Err(e)) => RunOutcome::Failed {
                error: e.to_string(),
            },
        };
        manifest.finish(outcome, self.stages_completed);
        let manifest_path = match manifest.save(&self.root).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Could not write run manifest");
                None
            }
        };

        match (result, teardown) {
            (Ok(()), Ok(())) => {
                self.reporter.report(SequencerEvent::PhaseChanged {
                    phase: Phase::Complete,
                });
                info!(
                    stages = self.stages_completed,
                    frames = self.frames_captured,
                    "Run complete"
                );
                Ok(RunSummary {
                    run_id: manifest.run_id,
                    root: self.root.clone(),
                    stages_completed: self.stages_completed,
                    frames_captured: self.frames_captured,
                    weights: std::mem::take(&mut self.weights),
                    manifest: manifest_path,
                })
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), _) => {
                if matches!(e, RigError::Cancelled) {
                    info!(stages = self.stages_completed, "Run cancelled");
                } else {
                    error!(error = %e, "Run failed");
                }
                Err(e)
            }
        }
    }

    fn report_phase(&self, phase: Phase) {
        self.reporter.report(SequencerEvent::PhaseChanged { phase });
    }

    async fn pause(&self, duration: Duration) -> AppResult<()> {
        if self.cancel.sleep(duration).await {
            Ok(())
        } else {
            Err(RigError::Cancelled)
        }
    }

    fn check_cancelled(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            Err(RigError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn create_dir(path: &Path) -> AppResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| RigError::io(path, e))
    }

    async fn execute(&mut self) -> AppResult<()> {
        Self::create_dir(&self.root).await?;
        self.acquire().await?;

        let config = self.config.clone();
        for stage in schedule::plan(&config) {
            self.check_cancelled()?;
            self.run_stage(&stage).await?;

            self.report_phase(Phase::Idle);
            self.stages_completed += 1;
            self.reporter.report(SequencerEvent::StageCompleted {
                done: self.stages_completed,
                total: config.stage_count,
            });

            if let Some(wait) = stage.wait_after {
                info!(wait_s = wait.as_secs_f64(), "Waiting for next stage");
                self.pause(wait).await?;
            }
        }
        Ok(())
    }

    /// Claims lines and starts the camera.
    async fn acquire(&mut self) -> AppResult<()> {
        let config = self.config.clone();

        if config.scale.is_some() && self.mass_sensor.is_none() {
            return Err(RigError::DeviceUnavailable(
                "scale measurement enabled but no mass sensor was opened".into(),
            ));
        }

        self.reserve(config.lamp).await?;
        if let Some(led) = &config.led {
            for line in led.lines {
                self.reserve(line).await?;
            }
        }

        let setup = CameraSetup {
            controls: config.camera.controls(config.sweep.first()),
            resolution: self.options.resolution,
        };
        let mut camera = self.camera.lock().await;
        camera.configure(&setup).await?;
        camera.start().await?;
        info!(shutter_us = config.sweep.first(), "Camera started");
        Ok(())
    }

    async fn reserve(&mut self, line: LinePin) -> AppResult<()> {
        self.illumination.reserve(line).await?;
        self.reserved.push(line);
        self.illumination.assert_low(line).await
    }

    async fn leds_low(&mut self) -> AppResult<()> {
        if let Some(led) = &self.config.led {
            for line in led.lines {
                self.illumination.assert_low(line).await?;
            }
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage: &StagePlan) -> AppResult<()> {
        let config = self.config.clone();
        let stage_name = stage.dir_name();
        let stage_dir = stage.dir(&self.root);
        info!(stage = stage.index, offset_min = stage.offset_minutes, "Stage started");
        Self::create_dir(&stage_dir).await?;

        if let Some(scale_settings) = &config.scale {
            self.report_phase(Phase::Scale);
            let sensor = self
                .mass_sensor
                .as_mut()
                .ok_or_else(|| RigError::DeviceUnavailable("mass sensor".into()))?;
            let reading = scale::weigh(
                sensor.as_mut(),
                scale_settings.reference_unit,
                scale_settings.samples,
                &self.cancel,
            )
            .await?
            .ok_or(RigError::Cancelled)?;
            reading
                .save(&scale::reading_path(&stage_dir, &stage_name))
                .await?;
            self.weights.push(reading);
        }

        self.report_phase(Phase::InitCamera);
        let shutters = config.sweep.values();

        for &shutter_us in &shutters {
            self.check_cancelled()?;
            let shutter_dir = stage_dir.join(shutter_us.to_string());
            Self::create_dir(&shutter_dir).await?;

            self.leds_low().await?;
            self.apply_controls(shutter_us).await?;
            self.pause(self.options.timing.noise_settle()).await?;
            self.report_phase(Phase::NoiseCapture);
            self.capture(Phase::NoiseCapture, &config.noise, &shutter_dir, shutter_us)
                .await?;

            if let Some(led) = &config.led {
                self.pause(self.options.timing.led_settle()).await?;
                self.report_phase(Phase::LedCapture);
                let captured = self.led_burst(led.lines, &led.burst, &shutter_dir, shutter_us).await;
                // LEDs go low whether or not the burst succeeded.
                let lowered = self.leds_low().await;
                captured?;
                lowered?;
            }
        }

        self.check_cancelled()?;
        self.report_phase(Phase::PreheatLamp);
        self.illumination.assert_high(config.lamp).await?;
        info!(preheat_s = config.preheat.as_secs(), "Lamp on, preheating");
        let illuminated = self.illuminated_pass(&shutters, &stage_dir).await;
        let lamp_off = self.illumination.assert_low(config.lamp).await;
        illuminated?;
        lamp_off?;
        info!(stage = stage.index, "Lamp off");
        Ok(())
    }

    async fn illuminated_pass(&mut self, shutters: &[u32], stage_dir: &Path) -> AppResult<()> {
        let config = self.config.clone();
        self.pause(config.preheat).await?;
        for &shutter_us in shutters {
            self.check_cancelled()?;
            let shutter_dir = stage_dir.join(shutter_us.to_string());
            Self::create_dir(&shutter_dir).await?;
            self.apply_controls(shutter_us).await?;
            self.pause(self.options.timing.illuminated_settle()).await?;
            self.report_phase(Phase::ImageCapture);
            self.capture(
                Phase::ImageCapture,
                &config.illuminated,
                &shutter_dir,
                shutter_us,
            )
            .await?;
        }
        Ok(())
    }

    async fn led_burst(
        &mut self,
        lines: [LinePin; 2],
        settings: &BurstSettings,
        dir: &Path,
        shutter_us: u32,
    ) -> AppResult<CaptureBurst> {
        for line in lines {
            self.illumination.assert_high(line).await?;
        }
        self.capture(Phase::LedCapture, settings, dir, shutter_us).await
    }

    async fn apply_controls(&self, shutter_us: u32) -> AppResult<()> {
        let controls = self.config.camera.controls(shutter_us);
        self.camera.lock().await.set_controls(&controls).await
    }

    /// Runs one burst on its own task and waits for it.
    async fn capture(
        &mut self,
        phase: Phase,
        settings: &BurstSettings,
        dir: &Path,
        shutter_us: u32,
    ) -> AppResult<CaptureBurst> {
        let request = BurstRequest {
            save_dir: dir.to_path_buf(),
            prefix: settings.prefix.clone(),
            image_count: settings.image_count,
            pause: settings.pause,
            save_raw: settings.save_raw,
            save_metadata: self.config.save_metadata,
            requested: self.config.camera.controls(shutter_us).to_control_map(),
        };

        let reporter = self.reporter.clone();
        let progress: ProgressFn = Arc::new(move |remaining| {
            reporter.report(SequencerEvent::BurstProgress { phase, remaining });
        });

        let burst = BurstTask::spawn(self.camera.clone(), request, self.cancel.clone(), progress)
            .join()
            .await?;
        self.frames_captured += burst.captured();
        if burst.cancelled {
            return Err(RigError::Cancelled);
        }
        Ok(burst)
    }

    /// Returns every device to a safe state. Keeps going past failures.
    async fn teardown(&mut self) -> AppResult<()> {
        let mut failures = Vec::new();

        let lamp = self.config.lamp;
        let leds: Vec<LinePin> = self
            .config
            .led
            .as_ref()
            .map(|led| led.lines.to_vec())
            .unwrap_or_default();

        for line in std::iter::once(lamp).chain(leds) {
            if !self.reserved.contains(&line) {
                continue;
            }
            if let Err(e) = self.illumination.assert_low(line).await {
                error!(%line, error = %e, "Teardown: could not drive line low");
                failures.push(e);
            }
        }

        if let Err(e) = self.camera.lock().await.stop().await {
            error!(error = %e, "Teardown: camera stop failed");
            failures.push(e);
        }

        if let Some(sensor) = self.mass_sensor.as_mut() {
            if let Err(e) = sensor.power_down().await {
                error!(error = %e, "Teardown: mass sensor power down failed");
                failures.push(e);
            }
        }

        if let Err(e) = self.illumination.release_all().await {
            error!(error = %e, "Teardown: releasing lines failed");
            failures.push(e);
        }
        self.reserved.clear();

        if failures.is_empty() {
            info!("Hardware returned to a safe state");
            Ok(())
        } else {
            error!(failures = failures.len(), "Teardown incomplete");
            Err(RigError::TeardownFailed(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, ExperimentSettings};
    use crate::experiment::status::RecordingReporter;
    use crate::hardware::mock::SimulatedRig;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn one_stage() -> Arc<ExperimentConfig> {
        let settings = ExperimentSettings {
            shutter_speed: "1000".into(),
            lens_position: "1.0".into(),
            colour_gain_red: "1.0".into(),
            colour_gain_blue: "1.0".into(),
            analog_gain: "1.0".into(),
            preheat: "1".into(),
            image_capture: "1".into(),
            pause_between_capture: "0.8".into(),
            illuminated_image_name: "img_".into(),
            lamp_drive: "GPIO17 (Pin 11)".into(),
            noise_image_capture: "1".into(),
            noise_image_name: "noise_".into(),
            pause_between_noise_capture: "0.8".into(),
            single_shutter: true,
            number_experiments: "1".into(),
            time_between_experiments: "0".into(),
            ..Default::default()
        };
        Arc::new(validate(&settings).unwrap())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn logs_safe_state_after_run() {
        let dir = TempDir::new().unwrap();
        let rig = SimulatedRig::new();
        let summary = StageSequencer::new(
            one_stage(),
            rig.devices,
            dir.path(),
            SequencerOptions::default(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.frames_captured, 2);
        assert!(summary.manifest.is_some());
        assert!(logs_contain("Run started"));
        assert!(logs_contain("Hardware returned to a safe state"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_captures_nothing() {
        let dir = TempDir::new().unwrap();
        let rig = SimulatedRig::new();
        let recorder = RecordingReporter::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = StageSequencer::new(
            one_stage(),
            rig.devices,
            dir.path(),
            SequencerOptions::default(),
        )
        .with_reporter(Arc::new(recorder.clone()))
        .with_cancel(cancel)
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, RigError::Cancelled));
        assert_eq!(rig.camera.frames_captured().await, 0);
        assert!(!recorder.phases().contains(&Phase::Complete));
        assert!(!rig.camera.is_active().await);
    }
}
