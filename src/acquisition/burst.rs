//! Single-burst capture task.
//!
//! A burst is `image_count` frames written as `{prefix}{index}.jpg` with a
//! fixed pause between frames (none after the last). Each frame can carry a
//! `.dng` RAW sidecar and a `.json` metadata sidecar holding the controls that
//! were requested next to the controls the camera reported.
//!
//! Progress is reported as the number of frames still to capture: `N` before
//! the first frame, then `N-1` … `0`. A cancelled burst stops at the next
//! frame boundary and never reports `0`.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::acquisition::cancel::CancelToken;
use crate::error::{AppResult, RigError};
use crate::hardware::{CameraController, ControlMap, SharedCamera, StillTarget};

/// Receives the remaining-frame count after every boundary.
pub type ProgressFn = Arc<dyn Fn(u32) + Send + Sync>;

/// A progress callback that ignores updates.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Everything needed to run one burst.
#[derive(Clone, Debug)]
pub struct BurstRequest {
    /// Created if missing.
    pub save_dir: PathBuf,
    /// Filename prefix, e.g. `noise_`.
    pub prefix: String,
    /// Frames to capture.
    pub image_count: u32,
    /// Pause between consecutive frames.
    pub pause: Duration,
    /// Write a `.dng` per frame.
    pub save_raw: bool,
    /// Write a `.json` sidecar per frame.
    pub save_metadata: bool,
    /// Controls written to the `requested` block of metadata sidecars.
    pub requested: ControlMap,
}

impl BurstRequest {
    fn image_path(&self, index: u32) -> PathBuf {
        self.save_dir.join(format!("{}{}.jpg", self.prefix, index))
    }

    fn target(&self, index: u32) -> StillTarget {
        let image_path = self.image_path(index);
        let raw_path = self.save_raw.then(|| image_path.with_extension("dng"));
        StillTarget {
            image_path,
            raw_path,
        }
    }
}

/// One captured frame and its sidecars.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CapturedFrame {
    /// Position in the burst, from 0.
    pub index: u32,
    /// JPEG path.
    pub image: PathBuf,
    /// RAW sidecar, when requested.
    pub raw: Option<PathBuf>,
    /// Metadata sidecar, when requested.
    pub metadata: Option<PathBuf>,
}

/// Result of a burst, complete or cut short.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureBurst {
    /// Frames asked for.
    pub requested: u32,
    /// Frames written, in capture order.
    pub frames: Vec<CapturedFrame>,
    /// True when cancellation stopped the burst before `requested` frames.
    pub cancelled: bool,
}

impl CaptureBurst {
    /// Frames written.
    pub fn captured(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Every requested frame was written.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.captured() == self.requested
    }
}

#[derive(Serialize)]
struct MetadataSidecar<'a> {
    requested: &'a ControlMap,
    metadata: &'a ControlMap,
}

async fn write_sidecar(
    path: &Path,
    requested: &ControlMap,
    reported: &ControlMap,
) -> AppResult<()> {
    let body = serde_json::to_vec_pretty(&MetadataSidecar {
        requested,
        metadata: reported,
    })?;
    tokio::fs::write(path, body)
        .await
        .map_err(|e| RigError::io(path, e))
}

/// Runs a burst on `camera` in the current task.
///
/// Cancellation is checked before every frame, never during an exposure.
pub async fn drive<C: CameraController + ?Sized>(
    camera: &mut C,
    request: &BurstRequest,
    cancel: &CancelToken,
    progress: &ProgressFn,
) -> AppResult<CaptureBurst> {
    tokio::fs::create_dir_all(&request.save_dir)
        .await
        .map_err(|e| RigError::io(&request.save_dir, e))?;

    let total = request.image_count;
    let mut frames = Vec::with_capacity(total as usize);
    progress(total);

    for index in 0..total {
        if cancel.is_cancelled() {
            info!(
                prefix = %request.prefix,
                captured = index,
                requested = total,
                "Burst cancelled at frame boundary"
            );
            return Ok(CaptureBurst {
                requested: total,
                frames,
                cancelled: true,
            });
        }

        let target = request.target(index);
        let reported = camera.capture_still(&target).await?;

        let metadata = if request.save_metadata {
            let path = target.image_path.with_extension("json");
            write_sidecar(&path, &request.requested, &reported).await?;
            Some(path)
        } else {
            None
        };

        debug!(path = %target.image_path.display(), "Frame saved");
        frames.push(CapturedFrame {
            index,
            image: target.image_path,
            raw: target.raw_path,
            metadata,
        });

        let remaining = total - index - 1;
        progress(remaining);
        if remaining > 0 {
            // An interrupted pause is picked up by the boundary check above.
            cancel.sleep(request.pause).await;
        }
    }

    Ok(CaptureBurst {
        requested: total,
        frames,
        cancelled: false,
    })
}

/// A burst running on its own tokio task.
///
/// The task holds the camera lock for the whole burst, so no second burst or
/// control change can reach the camera until it is joined.
pub struct BurstTask {
    handle: JoinHandle<AppResult<CaptureBurst>>,
}

impl BurstTask {
    /// Starts the burst; the camera lock is taken inside the task.
    pub fn spawn(
        camera: SharedCamera,
        request: BurstRequest,
        cancel: CancelToken,
        progress: ProgressFn,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut camera = camera.lock().await;
            camera.capture_burst(&request, &cancel, &progress).await
        });
        Self { handle }
    }

    /// Waits for the burst to finish.
    pub async fn join(self) -> AppResult<CaptureBurst> {
        self.handle.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedCamera;
    use crate::hardware::{CameraControls, CameraSetup};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    fn setup() -> CameraSetup {
        CameraSetup {
            controls: CameraControls {
                exposure_us: Some(1000),
                analogue_gain: Some(1.0),
                colour_gains: Some((2.0, 1.8)),
                lens_position: Some(4.0),
            },
            resolution: Some((640, 480)),
        }
    }

    async fn started_camera() -> SimulatedCamera {
        let mut camera = SimulatedCamera::new();
        camera.configure(&setup()).await.unwrap();
        camera.start().await.unwrap();
        camera
    }

    fn request(dir: &Path, count: u32) -> BurstRequest {
        BurstRequest {
            save_dir: dir.to_path_buf(),
            prefix: "img_".into(),
            image_count: count,
            pause: Duration::from_secs(1),
            save_raw: false,
            save_metadata: false,
            requested: setup().controls.to_control_map(),
        }
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |r| sink.lock().unwrap().push(r)), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_names_and_progress() {
        let dir = TempDir::new().unwrap();
        let mut camera = started_camera().await;
        let (progress, seen) = recorder();

        let burst = drive(&mut camera, &request(dir.path(), 4), &CancelToken::new(), &progress)
            .await
            .unwrap();

        assert!(burst.is_complete());
        for i in 0..4 {
            assert!(dir.path().join(format!("img_{i}.jpg")).exists());
        }
        assert!(!dir.path().join("img_4.jpg").exists());
        assert_eq!(*seen.lock().unwrap(), vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pause_after_last_frame() {
        let dir = TempDir::new().unwrap();
        let mut camera = started_camera().await;
        let mut req = request(dir.path(), 1);
        req.pause = Duration::from_secs(500);

        let start = tokio::time::Instant::now();
        drive(&mut camera, &req, &CancelToken::new(), &no_progress())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_and_metadata_sidecars() {
        let dir = TempDir::new().unwrap();
        let mut camera = started_camera().await;
        let mut req = request(dir.path(), 2);
        req.save_raw = true;
        req.save_metadata = true;

        let burst = drive(&mut camera, &req, &CancelToken::new(), &no_progress())
            .await
            .unwrap();

        let frame = &burst.frames[1];
        assert_eq!(frame.raw.as_deref(), Some(dir.path().join("img_1.dng").as_path()));
        assert!(dir.path().join("img_1.dng").exists());

        let text = std::fs::read_to_string(dir.path().join("img_1.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["requested"]["ExposureTime"], 1000);
        assert_eq!(json["requested"]["ColourGains"], serde_json::json!([2.0, 1.8]));
        assert_eq!(json["metadata"]["ExposureTime"], 1000);
        assert!(json["metadata"]["ColourGains"].is_array());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reports_partial_count() {
        let dir = TempDir::new().unwrap();
        let mut camera = started_camera().await;
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |remaining| {
            sink.lock().unwrap().push(remaining);
            if remaining == 3 {
                trigger.cancel();
            }
        });

        let burst = drive(&mut camera, &request(dir.path(), 5), &cancel, &progress)
            .await
            .unwrap();

        assert!(burst.cancelled);
        assert_eq!(burst.captured(), 2);
        assert!(!burst.is_complete());
        assert_eq!(*seen.lock().unwrap(), vec![5, 4, 3]);
        assert!(!dir.path().join("img_2.jpg").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_joins() {
        let dir = TempDir::new().unwrap();
        let boxed: Box<dyn CameraController> = Box::new(started_camera().await);
        let camera: SharedCamera = Arc::new(AsyncMutex::new(boxed));
        let task = BurstTask::spawn(
            camera.clone(),
            request(dir.path(), 3),
            CancelToken::new(),
            no_progress(),
        );
        let burst = task.join().await.unwrap();
        assert_eq!(burst.captured(), 3);
        assert!(camera.lock().await.is_active());
    }

    #[tokio::test]
    async fn test_capture_before_start_fails() {
        let dir = TempDir::new().unwrap();
        let mut camera = SimulatedCamera::new();
        let err = drive(&mut camera, &request(dir.path(), 1), &CancelToken::new(), &no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Camera(_)));
    }
}
