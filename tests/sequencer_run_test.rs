//! End-to-end runs of the stage sequencer against simulated devices.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capture_rig::acquisition::CancelToken;
use capture_rig::error::{AppResult, RigError};
use capture_rig::experiment::{
    Phase, RecordingReporter, SequencerEvent, SequencerOptions, StageSequencer, StatusReporter,
};
use capture_rig::hardware::mock::{
    SimulatedCamera, SimulatedIllumination, SimulatedRig, SimulatedScale,
};
use capture_rig::hardware::{IlluminationController, LinePin};
use common::*;

fn read_json(path: &std::path::Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn full_run_writes_dataset_and_ends_safe() {
    let mut settings = with_scale(with_leds(base_settings()), 7);
    settings.metadata = true;
    settings.noise_raw = true;
    let (sequencer, recorder, dir, monitors) = sequencer(config(&settings), SimulatedRig::new());
    let root = dir.path().join("run");

    let summary = sequencer.run().await.unwrap();

    assert_eq!(summary.stages_completed, 2);
    // per stage and shutter: 2 noise + 1 LED + 3 illuminated
    assert_eq!(summary.frames_captured, 2 * 2 * 6);
    assert_eq!(summary.weights.len(), 2);

    for stage in ["0.0", "10.0"] {
        for shutter in ["100", "200"] {
            let dir = root.join(stage).join(shutter);
            for name in [
                "noise_0.jpg",
                "noise_1.jpg",
                "noise_1.dng",
                "noise_1.json",
                "led_0.jpg",
                "led_0.json",
                "img_0.jpg",
                "img_2.jpg",
                "img_2.json",
            ] {
                assert!(dir.join(name).exists(), "missing {stage}/{shutter}/{name}");
            }
            assert!(!dir.join("img_3.jpg").exists());
            assert!(!dir.join("img_0.dng").exists());
        }
        let weight = read_json(&root.join(stage).join(format!("{stage}.json")));
        assert_eq!(weight["Scale"]["trim"], 3);
        assert_eq!(weight["Scale"]["num_samples"], 7);
    }

    let sidecar = read_json(&root.join("10.0").join("200").join("led_0.json"));
    assert_eq!(sidecar["requested"]["ExposureTime"], 200);
    assert_eq!(sidecar["requested"]["ColourGains"], serde_json::json!([2.0, 1.8]));
    assert_eq!(sidecar["metadata"]["ExposureTime"], 200);

    let manifest = read_json(&root.join("run_manifest.json"));
    assert_eq!(manifest["outcome"]["status"], "completed");
    assert_eq!(manifest["stages_completed"], 2);
    assert_eq!(manifest["shutter_values"], serde_json::json!([100, 200]));

    let stage_phases = vec![
        Phase::Scale,
        Phase::InitCamera,
        Phase::NoiseCapture,
        Phase::LedCapture,
        Phase::NoiseCapture,
        Phase::LedCapture,
        Phase::PreheatLamp,
        Phase::ImageCapture,
        Phase::ImageCapture,
        Phase::Idle,
    ];
    let mut expected = stage_phases.clone();
    expected.extend(stage_phases);
    expected.push(Phase::Complete);
    assert_eq!(recorder.phases(), expected);

    assert_eq!(
        recorder.progress_in(Phase::NoiseCapture),
        [2, 1, 0].repeat(4)
    );
    assert_eq!(
        recorder.progress_in(Phase::ImageCapture),
        [3, 2, 1, 0].repeat(4)
    );

    let stages: Vec<(u32, u32)> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SequencerEvent::StageCompleted { done, total } => Some((done, total)),
            _ => None,
        })
        .collect();
    assert_eq!(stages, vec![(1, 2), (2, 2)]);

    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn leds_only_high_during_led_bursts() {
    let settings = with_leds(base_settings());
    let (sequencer, _recorder, _dir, monitors) =
        sequencer(config(&settings), SimulatedRig::new());
    sequencer.run().await.unwrap();

    for label in [LED1, LED2] {
        let history = monitors.lines.history_of(pin(label)).await;
        // one high pulse per LED burst: 2 stages x 2 shutters
        assert_eq!(history.iter().filter(|&&level| level).count(), 4);
        // every high is followed by a low
        for pair in history.windows(2) {
            if pair[0] {
                assert!(!pair[1], "{label} driven high twice in a row");
            }
        }
        assert_eq!(history.last(), Some(&false));
    }

    let lamp = monitors.lines.history_of(pin(LAMP)).await;
    assert_eq!(lamp.iter().filter(|&&level| level).count(), 2);
    assert_eq!(lamp.last(), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn run_waits_between_stages() {
    let (sequencer, _recorder, _dir, _monitors) =
        sequencer(config(&base_settings()), SimulatedRig::new());
    let start = tokio::time::Instant::now();
    sequencer.run().await.unwrap();
    let elapsed = start.elapsed();

    // one inter-stage wait of 10 min - 60 s, two preheats of 60 s
    assert!(elapsed >= Duration::from_secs(540 + 120));
    assert!(elapsed < Duration::from_secs(540 + 120 + 120));
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_burst_tears_down() {
    /// Cancels the run once the first noise burst has one frame left.
    struct CancelOnProgress {
        cancel: CancelToken,
        inner: RecordingReporter,
    }

    impl StatusReporter for CancelOnProgress {
        fn report(&self, event: SequencerEvent) {
            if event
                == (SequencerEvent::BurstProgress {
                    phase: Phase::NoiseCapture,
                    remaining: 1,
                })
            {
                self.cancel.cancel();
            }
            self.inner.report(event);
        }
    }

    let (sequencer, recorder, dir, monitors) =
        sequencer(config(&base_settings()), SimulatedRig::new());
    let cancel = sequencer.cancel_token();
    let sequencer = sequencer.with_reporter(Arc::new(CancelOnProgress {
        cancel,
        inner: recorder.clone(),
    }));

    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::Cancelled));

    let shutter_dir = dir.path().join("run").join("0.0").join("100");
    assert!(shutter_dir.join("noise_0.jpg").exists());
    assert!(!shutter_dir.join("noise_1.jpg").exists());
    assert!(!recorder.phases().contains(&Phase::Complete));
    assert!(!recorder.phases().contains(&Phase::PreheatLamp));

    let manifest = read_json(&dir.path().join("run").join("run_manifest.json"));
    assert_eq!(manifest["outcome"]["status"], "cancelled");
    assert_eq!(manifest["stages_completed"], 0);

    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_during_inter_stage_wait() {
    let (sequencer, recorder, _dir, monitors) =
        sequencer(config(&base_settings()), SimulatedRig::new());
    let cancel = sequencer.cancel_token();
    let handle = tokio::spawn(sequencer.run());

    // first stage finishes well within 5 minutes; the wait is 9
    tokio::time::sleep(Duration::from_secs(300)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, RigError::Cancelled));
    assert_eq!(recorder.phases().last(), Some(&Phase::Idle));
    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn camera_failure_still_reaches_teardown() {
    let rig = SimulatedRig::from_parts(
        SimulatedCamera::new().failing_after(5),
        SimulatedIllumination::new(),
        SimulatedScale::new(),
    );
    let (sequencer, recorder, dir, monitors) = sequencer(config(&base_settings()), rig);

    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::Camera(_)));
    // four noise frames and one illuminated frame, then the injected failure
    assert_eq!(monitors.camera.frames_captured().await, 5);
    assert!(recorder.phases().contains(&Phase::PreheatLamp));

    let manifest = read_json(&dir.path().join("run").join("run_manifest.json"));
    assert_eq!(manifest["outcome"]["status"], "failed");
    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn lamp_fault_is_fatal() {
    let rig = SimulatedRig::from_parts(
        SimulatedCamera::new(),
        SimulatedIllumination::new().refusing_high(pin(LAMP)),
        SimulatedScale::new(),
    );
    let (sequencer, recorder, _dir, monitors) = sequencer(config(&base_settings()), rig);

    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::HardwareAssertion { line: 17, .. }));
    assert!(!recorder.phases().contains(&Phase::ImageCapture));
    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn untrimmable_scale_count_aborts_stage() {
    let settings = with_scale(base_settings(), 6);
    let (sequencer, recorder, dir, monitors) = sequencer(config(&settings), SimulatedRig::new());

    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::ScaleTrim { samples: 6, trim: 3 }));
    assert_eq!(recorder.phases(), vec![Phase::Scale]);
    assert!(!dir.path().join("run").join("0.0").join("0.0.json").exists());
    monitors.assert_safe().await;
}

#[tokio::test(start_paused = true)]
async fn scale_without_sensor_is_unavailable() {
    let settings = with_scale(base_settings(), 10);
    let mut rig = SimulatedRig::new();
    rig.devices.mass_sensor = None;
    let (sequencer, recorder, _dir, monitors) = sequencer(config(&settings), rig);

    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::DeviceUnavailable(_)));
    assert!(recorder.phases().is_empty());
    assert!(!monitors.camera.is_active().await);
}

/// Lines that work during the run but cannot be released.
struct StickyLines(SimulatedIllumination);

#[async_trait]
impl IlluminationController for StickyLines {
    async fn reserve(&mut self, line: LinePin) -> AppResult<()> {
        self.0.reserve(line).await
    }

    async fn assert_high(&mut self, line: LinePin) -> AppResult<()> {
        self.0.assert_high(line).await
    }

    async fn assert_low(&mut self, line: LinePin) -> AppResult<()> {
        self.0.assert_low(line).await
    }

    async fn release_all(&mut self) -> AppResult<()> {
        self.0.release_all().await?;
        Err(RigError::HardwareAssertion {
            line: 17,
            message: "chip busy".into(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn teardown_failure_after_success_is_reported() {
    let mut rig = SimulatedRig::new();
    rig.devices.illumination = Box::new(StickyLines(SimulatedIllumination::new()));
    let mut settings = base_settings();
    settings.number_experiments = "1".into();

    let dir = tempfile::TempDir::new().unwrap();
    let sequencer = StageSequencer::new(
        config(&settings),
        rig.devices,
        dir.path().join("run"),
        SequencerOptions::default(),
    );
    let err = sequencer.run().await.unwrap_err();
    match err {
        RigError::TeardownFailed(failures) => assert_eq!(failures.len(), 1),
        other => panic!("expected TeardownFailed, got {other:?}"),
    }
    assert!(!rig.camera.is_active().await);
}

#[tokio::test(start_paused = true)]
async fn teardown_failure_never_masks_run_error() {
    let mut rig = SimulatedRig::from_parts(
        SimulatedCamera::new().failing_after(0),
        SimulatedIllumination::new(),
        SimulatedScale::new(),
    );
    rig.devices.illumination = Box::new(StickyLines(SimulatedIllumination::new()));

    let (sequencer, _recorder, _dir, _monitors) = sequencer(config(&base_settings()), rig);
    let err = sequencer.run().await.unwrap_err();
    assert!(matches!(err, RigError::Camera(_)));
}
