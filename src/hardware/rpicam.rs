//! `rpicam-still` camera driver.
//!
//! Each frame is one `rpicam-still --immediate` invocation with fully manual
//! controls; the JSON metadata the tool prints on stdout becomes the reported
//! control map. "Started" only means the driver accepts captures, since the
//! tool opens and closes the sensor per frame.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{AppResult, RigError};
use crate::hardware::{
    CameraController, CameraControls, CameraSetup, ControlMap, ControlValue, StillTarget,
};

/// Slack on top of the exposure time before a capture is considered hung.
const CAPTURE_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

/// Camera driven through one `rpicam-still` process per frame.
pub struct RpicamCamera {
    binary: PathBuf,
    controls: CameraControls,
    resolution: Option<(u32, u32)>,
    configured: bool,
    active: bool,
}

impl RpicamCamera {
    /// Uses `binary` for every capture; nothing runs until the first frame.
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            controls: CameraControls::default(),
            resolution: None,
            configured: false,
            active: false,
        }
    }

    /// Command-line arguments for one frame.
    fn still_args(&self, target: &StillTarget) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-n".into(),
            "--immediate".into(),
            "-o".into(),
            target.image_path.display().to_string(),
            "--denoise".into(),
            "off".into(),
            "--brightness".into(),
            "0.0".into(),
            "--contrast".into(),
            "1.0".into(),
            "--saturation".into(),
            "1.0".into(),
            "--sharpness".into(),
            "1.0".into(),
        ];
        if let Some(us) = self.controls.exposure_us {
            args.push("--shutter".into());
            args.push(us.to_string());
        }
        if let Some(gain) = self.controls.analogue_gain {
            args.push("--gain".into());
            args.push(gain.to_string());
        }
        if let Some((red, blue)) = self.controls.colour_gains {
            args.push("--awbgains".into());
            args.push(format!("{red},{blue}"));
        }
        if let Some(lens) = self.controls.lens_position {
            args.push("--lens-position".into());
            args.push(lens.to_string());
        }
        if let Some((width, height)) = self.resolution {
            args.push("--width".into());
            args.push(width.to_string());
            args.push("--height".into());
            args.push(height.to_string());
        }
        if target.raw_path.is_some() {
            args.push("--raw".into());
        }
        args.extend(["--metadata", "-", "--metadata-format", "json"].map(String::from));
        args
    }
}

/// Parses the metadata block printed by `--metadata -`.
fn parse_metadata(stdout: &[u8]) -> AppResult<ControlMap> {
    let text = String::from_utf8_lossy(stdout);
    // Progress lines can precede the JSON object.
    let start = text
        .find('{')
        .ok_or_else(|| RigError::Camera("rpicam-still printed no metadata".into()))?;
    let value: serde_json::Value = serde_json::from_str(text[start..].trim_end())
        .map_err(|e| RigError::Camera(format!("unreadable rpicam-still metadata: {e}")))?;
    match ControlValue::from(value) {
        ControlValue::Map(map) => Ok(map),
        other => Err(RigError::Camera(format!(
            "expected a metadata object, got {other:?}"
        ))),
    }
}

#[async_trait]
impl CameraController for RpicamCamera {
    async fn configure(&mut self, setup: &CameraSetup) -> AppResult<()> {
        let version = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = version {
            return Err(RigError::DeviceUnavailable(format!(
                "cannot run {}: {e}",
                self.binary.display()
            )));
        }
        self.controls = setup.controls.clone();
        self.resolution = setup.resolution;
        self.configured = true;
        info!(binary = %self.binary.display(), "rpicam-still camera configured");
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        if !self.configured {
            return Err(RigError::Camera("start before configure".into()));
        }
        self.active = true;
        Ok(())
    }

    async fn set_controls(&mut self, controls: &CameraControls) -> AppResult<()> {
        self.controls.merge(controls);
        Ok(())
    }

    async fn capture_still(&mut self, target: &StillTarget) -> AppResult<ControlMap> {
        if !self.active {
            return Err(RigError::Camera("capture while camera is stopped".into()));
        }
        let args = self.still_args(target);
        debug!(?args, "rpicam-still");

        let exposure = Duration::from_micros(u64::from(self.controls.exposure_us.unwrap_or(0)));
        let output = tokio::time::timeout(
            exposure + CAPTURE_TIMEOUT_SLACK,
            Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RigError::Camera("rpicam-still timed out".into()))?
        .map_err(|e| RigError::Camera(format!("failed to run rpicam-still: {e}")))?;

        if !output.status.success() {
            return Err(RigError::Camera(format!(
                "rpicam-still exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if let Some(raw_path) = &target.raw_path {
            // --raw writes next to the JPEG with a .dng extension
            if !raw_path.exists() {
                warn!(path = %raw_path.display(), "RAW file missing after capture");
            }
        }

        parse_metadata(&output.stdout)
    }

    async fn stop(&mut self) -> AppResult<()> {
        if self.active {
            info!("rpicam-still camera stopped");
        }
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
