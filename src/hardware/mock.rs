//! Simulated Hardware Implementations
//!
//! Provides simulated devices for dry runs and tests without physical hardware.
//! All simulated devices use async-safe operations (tokio::time::sleep, not std::thread::sleep)
//! and are fully deterministic: the same run configuration always produces the same
//! files, reported controls and readings.
//!
//! # Available Simulations
//!
//! - `SimulatedCamera` - Writes placeholder JPEG/DNG files and echoes applied controls
//! - `SimulatedIllumination` - Records line reservations and levels
//! - `SimulatedScale` - Replays a fixed script of readings
//!
//! Each device hands out a monitor sharing its state, so a test can keep
//! watching a device after the sequencer has taken ownership of it.
//!
//! # Timing Characteristics
//!
//! - SimulatedCamera: each frame takes its exposure time
//! - SimulatedScale: 90ms per conversion (HX711 at 10 samples/sec)

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::error::{AppResult, RigError};
use crate::hardware::{
    control_names, fixed_still_controls, CameraController, CameraControls, CameraSetup,
    ControlMap, ControlValue, DeviceSet, IlluminationController, LinePin,
    MassSensorController, StillTarget,
};

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Observable camera state.
#[derive(Clone, Debug, Default)]
pub struct CameraState {
    /// Last `configure` call.
    pub setup: Option<CameraSetup>,
    /// Started and not yet stopped.
    pub active: bool,
    /// Controls currently in force.
    pub controls: CameraControls,
    /// Every `set_controls` call, in order.
    pub control_history: Vec<CameraControls>,
    /// Frames written so far.
    pub frames_captured: u32,
    /// JPEG paths, in capture order.
    pub images: Vec<PathBuf>,
    /// Number of `stop` calls, redundant ones included.
    pub stop_calls: u32,
}

/// Read-only view of a [`SimulatedCamera`].
#[derive(Clone)]
pub struct CameraMonitor(Arc<RwLock<CameraState>>);

impl CameraMonitor {
    /// Copy of the current state.
    pub async fn snapshot(&self) -> CameraState {
        self.0.read().await.clone()
    }

    /// Whether the camera is started.
    pub async fn is_active(&self) -> bool {
        self.0.read().await.active
    }

    /// Frames written so far.
    pub async fn frames_captured(&self) -> u32 {
        self.0.read().await.frames_captured
    }
}

/// Camera that writes placeholder files.
///
/// # Example
///
/// ```rust,ignore
/// let mut camera = SimulatedCamera::new();
/// camera.configure(&setup).await?;
/// camera.start().await?;
/// let reported = camera.capture_still(&target).await?; // Takes the exposure time
/// ```
pub struct SimulatedCamera {
    state: Arc<RwLock<CameraState>>,
    active: bool,
    sensor_resolution: (u32, u32),
    fail_after: Option<u32>,
}

impl SimulatedCamera {
    /// Create a simulated camera with a 4608x2592 sensor.
    pub fn new() -> Self {
        Self::with_sensor(4608, 2592)
    }

    /// Uses `width` x `height` when no output resolution is configured.
    pub fn with_sensor(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(CameraState::default())),
            active: false,
            sensor_resolution: (width, height),
            fail_after: None,
        }
    }

    /// Makes every capture after the first `frames` fail.
    pub fn failing_after(mut self, frames: u32) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// A view that outlives handing the camera to a sequencer.
    pub fn monitor(&self) -> CameraMonitor {
        CameraMonitor(self.state.clone())
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_placeholder(path: &Path, bytes: Vec<u8>) -> AppResult<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| RigError::io(path, e))
}

#[async_trait]
impl CameraController for SimulatedCamera {
    async fn configure(&mut self, setup: &CameraSetup) -> AppResult<()> {
        if self.active {
            return Err(RigError::Camera(
                "SimulatedCamera: cannot configure while started".into(),
            ));
        }
        let mut state = self.state.write().await;
        state.setup = Some(setup.clone());
        state.controls = setup.controls.clone();
        info!(resolution = ?setup.resolution, "SimulatedCamera: configured");
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.setup.is_none() {
            return Err(RigError::Camera(
                "SimulatedCamera: start before configure".into(),
            ));
        }
        state.active = true;
        self.active = true;
        info!("SimulatedCamera: started");
        Ok(())
    }

    async fn set_controls(&mut self, controls: &CameraControls) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.controls.merge(controls);
        state.control_history.push(controls.clone());
        debug!(?controls, "SimulatedCamera: controls applied");
        Ok(())
    }

    async fn capture_still(&mut self, target: &StillTarget) -> AppResult<ControlMap> {
        if !self.active {
            return Err(RigError::Camera(
                "SimulatedCamera: cannot capture - not started".into(),
            ));
        }

        let (sequence, controls, resolution) = {
            let state = self.state.read().await;
            if let Some(limit) = self.fail_after {
                if state.frames_captured >= limit {
                    return Err(RigError::Camera(format!(
                        "SimulatedCamera: injected failure after {} frames",
                        limit
                    )));
                }
            }
            let resolution = state
                .setup
                .as_ref()
                .and_then(|s| s.resolution)
                .unwrap_or(self.sensor_resolution);
            (state.frames_captured, state.controls.clone(), resolution)
        };

        let exposure_us = controls.exposure_us.unwrap_or(0);
        sleep(Duration::from_micros(u64::from(exposure_us))).await;

        let tag = format!("simulated frame {sequence} exposure {exposure_us}us");
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(tag.as_bytes());
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        write_placeholder(&target.image_path, jpeg).await?;

        if let Some(raw_path) = &target.raw_path {
            let mut dng = b"II*\0".to_vec();
            dng.extend_from_slice(tag.as_bytes());
            write_placeholder(raw_path, dng).await?;
        }

        let mut reported = fixed_still_controls();
        reported.extend(controls.to_control_map());
        reported.insert("FrameSequence".into(), ControlValue::from(sequence));
        reported.insert(
            "SensorTimestamp".into(),
            ControlValue::Int(i64::from(sequence) * 1_000_000_000),
        );
        reported.insert(
            control_names::SCALER_CROP.into(),
            ControlValue::List(vec![
                ControlValue::Int(0),
                ControlValue::Int(0),
                ControlValue::from(resolution.0),
                ControlValue::from(resolution.1),
            ]),
        );

        let mut state = self.state.write().await;
        state.frames_captured += 1;
        state.images.push(target.image_path.clone());
        Ok(reported)
    }

    async fn stop(&mut self) -> AppResult<()> {
        let mut state = self.state.write().await;
        if !self.active {
            debug!("SimulatedCamera: already stopped");
        } else {
            info!("SimulatedCamera: stopped");
        }
        state.active = false;
        state.stop_calls += 1;
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

// =============================================================================
// SimulatedIllumination
// =============================================================================

/// Observable line state.
#[derive(Clone, Debug, Default)]
pub struct LineState {
    /// Lines currently claimed as outputs.
    pub reserved: BTreeSet<u8>,
    /// Last level driven on each line that was ever reserved.
    pub levels: BTreeMap<u8, bool>,
    /// Every level change, in order.
    pub history: Vec<(u8, bool)>,
    /// Number of `release_all` calls.
    pub release_calls: u32,
}

/// Read-only view of a [`SimulatedIllumination`].
#[derive(Clone)]
pub struct LineMonitor(Arc<RwLock<LineState>>);

impl LineMonitor {
    /// Copy of the current state.
    pub async fn snapshot(&self) -> LineState {
        self.0.read().await.clone()
    }

    /// Last driven level, `None` if the line was never reserved.
    pub async fn level(&self, line: LinePin) -> Option<bool> {
        self.0.read().await.levels.get(&line.line()).copied()
    }

    /// Whether `line` is currently claimed.
    pub async fn is_reserved(&self, line: LinePin) -> bool {
        self.0.read().await.reserved.contains(&line.line())
    }

    /// Level changes seen on one line.
    pub async fn history_of(&self, line: LinePin) -> Vec<bool> {
        self.0
            .read()
            .await
            .history
            .iter()
            .filter(|(l, _)| *l == line.line())
            .map(|&(_, level)| level)
            .collect()
    }
}

/// Digital lines kept in memory.
pub struct SimulatedIllumination {
    state: Arc<RwLock<LineState>>,
    refuse_high: Option<u8>,
}

impl SimulatedIllumination {
    /// No lines reserved.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LineState::default())),
            refuse_high: None,
        }
    }

    /// Makes `assert_high` on `line` fail, as a stuck driver would.
    pub fn refusing_high(mut self, line: LinePin) -> Self {
        self.refuse_high = Some(line.line());
        self
    }

    /// A view sharing this device's state.
    pub fn monitor(&self) -> LineMonitor {
        LineMonitor(self.state.clone())
    }

    async fn drive(&mut self, line: LinePin, level: bool) -> AppResult<()> {
        let mut state = self.state.write().await;
        if !state.reserved.contains(&line.line()) {
            return Err(RigError::HardwareAssertion {
                line: line.line(),
                message: "line is not reserved".into(),
            });
        }
        if level && self.refuse_high == Some(line.line()) {
            return Err(RigError::HardwareAssertion {
                line: line.line(),
                message: "simulated driver fault".into(),
            });
        }
        state.levels.insert(line.line(), level);
        state.history.push((line.line(), level));
        Ok(())
    }
}

impl Default for SimulatedIllumination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IlluminationController for SimulatedIllumination {
    async fn reserve(&mut self, line: LinePin) -> AppResult<()> {
        let mut state = self.state.write().await;
        if !state.reserved.insert(line.line()) {
            return Err(RigError::HardwareAssertion {
                line: line.line(),
                message: "line already reserved".into(),
            });
        }
        state.levels.insert(line.line(), false);
        state.history.push((line.line(), false));
        debug!(%line, "SimulatedIllumination: reserved");
        Ok(())
    }

    async fn assert_high(&mut self, line: LinePin) -> AppResult<()> {
        self.drive(line, true).await
    }

    async fn assert_low(&mut self, line: LinePin) -> AppResult<()> {
        self.drive(line, false).await
    }

    async fn release_all(&mut self) -> AppResult<()> {
        let mut state = self.state.write().await;
        let lines: Vec<u8> = state.reserved.iter().copied().collect();
        for line in lines {
            state.levels.insert(line, false);
            state.history.push((line, false));
        }
        state.reserved.clear();
        state.release_calls += 1;
        info!("SimulatedIllumination: all lines released");
        Ok(())
    }
}

// =============================================================================
// SimulatedScale
// =============================================================================

/// Observable scale state.
#[derive(Clone, Debug, Default)]
pub struct ScaleState {
    /// Between `power_up` and `power_down`.
    pub powered: bool,
    /// Last `set_reference` value.
    pub reference_unit: Option<f64>,
    /// Readings taken so far.
    pub conversions: usize,
    /// Number of `power_down` calls.
    pub power_downs: u32,
}

/// Read-only view of a [`SimulatedScale`].
#[derive(Clone)]
pub struct ScaleMonitor(Arc<RwLock<ScaleState>>);

impl ScaleMonitor {
    /// Copy of the current state.
    pub async fn snapshot(&self) -> ScaleState {
        self.0.read().await.clone()
    }

    /// Whether the ADC is awake.
    pub async fn is_powered(&self) -> bool {
        self.0.read().await.powered
    }
}

/// Load cell replaying a fixed script of readings in grams.
///
/// The script wraps around when exhausted. Readings are reported as scripted,
/// independent of the reference unit.
pub struct SimulatedScale {
    state: Arc<RwLock<ScaleState>>,
    script: Vec<f64>,
    cursor: usize,
    powered: bool,
}

impl SimulatedScale {
    /// Readings scattered around 12.3 g.
    pub fn new() -> Self {
        Self::with_script(vec![
            12.31, 12.27, 12.35, 12.29, 12.33, 12.30, 12.28, 12.36, 12.32, 12.26,
        ])
    }

    /// Replays `script`; an empty script reads 0 g.
    pub fn with_script(script: Vec<f64>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ScaleState::default())),
            script,
            cursor: 0,
            powered: false,
        }
    }

    /// A view sharing this device's state.
    pub fn monitor(&self) -> ScaleMonitor {
        ScaleMonitor(self.state.clone())
    }

    fn next_reading(&mut self) -> f64 {
        if self.script.is_empty() {
            return 0.0;
        }
        let value = self.script[self.cursor % self.script.len()];
        self.cursor += 1;
        value
    }
}

impl Default for SimulatedScale {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MassSensorController for SimulatedScale {
    async fn power_up(&mut self) -> AppResult<()> {
        self.powered = true;
        self.state.write().await.powered = true;
        debug!("SimulatedScale: powered up");
        Ok(())
    }

    async fn set_reference(&mut self, unit: f64) -> AppResult<()> {
        self.state.write().await.reference_unit = Some(unit);
        Ok(())
    }

    async fn sample(&mut self, count: usize) -> AppResult<f64> {
        if !self.powered {
            return Err(RigError::MassSensor(
                "SimulatedScale: sampled while powered down".into(),
            ));
        }
        let count = count.max(1);
        let mut sum = 0.0;
        for _ in 0..count {
            sleep(Duration::from_millis(90)).await;
            sum += self.next_reading();
        }
        self.state.write().await.conversions += count;
        Ok(sum / count as f64)
    }

    async fn power_down(&mut self) -> AppResult<()> {
        self.powered = false;
        let mut state = self.state.write().await;
        state.powered = false;
        state.power_downs += 1;
        debug!("SimulatedScale: powered down");
        Ok(())
    }

    fn is_powered(&self) -> bool {
        self.powered
    }
}

// =============================================================================
// SimulatedRig
// =============================================================================

/// A complete simulated device set plus monitors for each device.
pub struct SimulatedRig {
    /// Handed to the sequencer.
    pub devices: DeviceSet,
    /// Watches the camera.
    pub camera: CameraMonitor,
    /// Watches the lamp and LED lines.
    pub lines: LineMonitor,
    /// Watches the load cell.
    pub scale: ScaleMonitor,
}

impl SimulatedRig {
    /// Default simulated devices, scale included.
    pub fn new() -> Self {
        Self::from_parts(
            SimulatedCamera::new(),
            SimulatedIllumination::new(),
            SimulatedScale::new(),
        )
    }

    /// Wraps already-built devices, e.g. ones set up to fail.
    pub fn from_parts(
        camera: SimulatedCamera,
        illumination: SimulatedIllumination,
        scale: SimulatedScale,
    ) -> Self {
        let monitors = (camera.monitor(), illumination.monitor(), scale.monitor());
        Self {
            devices: DeviceSet {
                camera: Box::new(camera),
                illumination: Box::new(illumination),
                mass_sensor: Some(Box::new(scale)),
            },
            camera: monitors.0,
            lines: monitors.1,
            scale: monitors.2,
        }
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pin(line: u8) -> LinePin {
        LinePin::from_line(line).unwrap()
    }

    #[tokio::test]
    async fn test_camera_lifecycle() {
        let mut camera = SimulatedCamera::new();
        let monitor = camera.monitor();

        // Start requires configure
        assert!(camera.start().await.is_err());

        camera
            .configure(&CameraSetup {
                controls: CameraControls {
                    exposure_us: Some(50),
                    ..Default::default()
                },
                resolution: None,
            })
            .await
            .unwrap();
        camera.start().await.unwrap();
        assert!(camera.is_active());
        assert!(monitor.is_active().await);

        camera.stop().await.unwrap();
        // Can stop multiple times (idempotent)
        camera.stop().await.unwrap();
        assert!(!monitor.is_active().await);
        assert_eq!(monitor.snapshot().await.stop_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let mut reports = Vec::new();
        for name in ["a.jpg", "b.jpg"] {
            let mut camera = SimulatedCamera::new();
            camera
                .configure(&CameraSetup {
                    controls: CameraControls {
                        exposure_us: Some(200),
                        analogue_gain: Some(2.0),
                        ..Default::default()
                    },
                    resolution: Some((100, 50)),
                })
                .await
                .unwrap();
            camera.start().await.unwrap();
            let target = StillTarget {
                image_path: dir.path().join(name),
                raw_path: None,
            };
            reports.push(camera.capture_still(&target).await.unwrap());
        }
        assert_eq!(reports[0], reports[1]);
        assert_eq!(
            std::fs::read(dir.path().join("a.jpg")).unwrap(),
            std::fs::read(dir.path().join("b.jpg")).unwrap()
        );
        assert_eq!(
            reports[0].get("ScalerCrop"),
            Some(&ControlValue::List(vec![
                ControlValue::Int(0),
                ControlValue::Int(0),
                ControlValue::Int(100),
                ControlValue::Int(50),
            ]))
        );
    }

    #[tokio::test]
    async fn test_lines_require_reservation() {
        let mut lines = SimulatedIllumination::new();
        let monitor = lines.monitor();

        let err = lines.assert_high(pin(17)).await.unwrap_err();
        assert!(matches!(err, RigError::HardwareAssertion { line: 17, .. }));

        lines.reserve(pin(17)).await.unwrap();
        assert_eq!(monitor.level(pin(17)).await, Some(false));
        lines.assert_high(pin(17)).await.unwrap();
        assert_eq!(monitor.level(pin(17)).await, Some(true));

        // Exclusive for the run
        assert!(lines.reserve(pin(17)).await.is_err());

        lines.release_all().await.unwrap();
        assert_eq!(monitor.level(pin(17)).await, Some(false));
        assert!(!monitor.is_reserved(pin(17)).await);
    }

    #[tokio::test]
    async fn test_refusing_line() {
        let mut lines = SimulatedIllumination::new().refusing_high(pin(22));
        lines.reserve(pin(22)).await.unwrap();
        assert!(lines.assert_high(pin(22)).await.is_err());
        lines.assert_low(pin(22)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_script() {
        let mut scale = SimulatedScale::with_script(vec![1.0, 2.0, 3.0]);
        assert!(scale.sample(1).await.is_err());

        scale.power_up().await.unwrap();
        assert_eq!(scale.sample(1).await.unwrap(), 1.0);
        assert_eq!(scale.sample(2).await.unwrap(), 2.5);
        // wraps around
        assert_eq!(scale.sample(1).await.unwrap(), 1.0);

        scale.power_down().await.unwrap();
        assert!(!scale.is_powered());
        assert_eq!(scale.monitor().snapshot().await.conversions, 4);
    }
}
