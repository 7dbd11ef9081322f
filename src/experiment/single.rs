//! One-off bursts outside a sequenced run.
//!
//! Configures the camera at the typed shutter speed, gives it time to settle,
//! takes one noise or illuminated burst into a chosen directory and stops the
//! camera again whatever happened. No lines are driven: the lamp is whatever
//! the operator left it at.

use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::acquisition::{BurstRequest, BurstTask, CancelToken, CaptureBurst, ProgressFn};
use crate::config::SingleCapture;
use crate::error::AppResult;
use crate::hardware::{CameraSetup, SharedCamera};

/// Wait between starting the camera and the first frame.
pub const CAMERA_INIT_DELAY: Duration = Duration::from_secs(2);

/// Runs `capture` on `camera`, writing into `dir`.
///
/// Cancellation is not an error here: the returned burst is marked
/// `cancelled` and holds whatever frames were written.
pub async fn capture_single(
    capture: &SingleCapture,
    camera: SharedCamera,
    dir: &Path,
    resolution: Option<(u32, u32)>,
    cancel: &CancelToken,
    progress: ProgressFn,
) -> AppResult<CaptureBurst> {
    info!(
        kind = capture.kind.name(),
        shutter_us = capture.shutter_us,
        frames = capture.burst.image_count,
        dir = %dir.display(),
        "Single capture started"
    );

    let result = configure_and_capture(capture, &camera, dir, resolution, cancel, progress).await;
    let stopped = camera.lock().await.stop().await;

    match (result, stopped) {
        (Ok(burst), Ok(())) => {
            info!(
                captured = burst.captured(),
                cancelled = burst.cancelled,
                "Single capture finished"
            );
            Ok(burst)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), stopped) => {
            if let Err(stop_error) = stopped {
                error!(error = %stop_error, "Camera stop failed after capture error");
            }
            Err(e)
        }
    }
}

async fn configure_and_capture(
    capture: &SingleCapture,
    camera: &SharedCamera,
    dir: &Path,
    resolution: Option<(u32, u32)>,
    cancel: &CancelToken,
    progress: ProgressFn,
) -> AppResult<CaptureBurst> {
    let controls = capture.camera.controls(capture.shutter_us);
    {
        let mut camera = camera.lock().await;
        camera
            .configure(&CameraSetup {
                controls: controls.clone(),
                resolution,
            })
            .await?;
        camera.start().await?;
    }

    if !cancel.sleep(CAMERA_INIT_DELAY).await {
        return Ok(CaptureBurst {
            requested: capture.burst.image_count,
            frames: Vec::new(),
            cancelled: true,
        });
    }

    let request = BurstRequest {
        save_dir: dir.to_path_buf(),
        prefix: capture.burst.prefix.clone(),
        image_count: capture.burst.image_count,
        pause: capture.burst.pause,
        save_raw: capture.burst.save_raw,
        save_metadata: capture.save_metadata,
        requested: controls.to_control_map(),
    };
    BurstTask::spawn(camera.clone(), request, cancel.clone(), progress)
        .join()
        .await
}
