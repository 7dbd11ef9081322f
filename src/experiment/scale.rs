//! Sample weighing.
//!
//! Every stage that weighs the sample wakes the load cell, throws away one
//! warm-up conversion, then collects `samples` single conversions. The
//! readings are sorted, the three lowest and three highest dropped, and the
//! rest averaged. The result is stored next to the stage's images.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::acquisition::CancelToken;
use crate::error::{AppResult, RigError};
use crate::hardware::MassSensorController;

/// Readings dropped from each end of the sorted samples.
pub const TRIM_EACH_END: usize = 3;
/// Delay before powering the sensor up.
pub const WAKE_DELAY: Duration = Duration::from_millis(1000);
/// Delay between power-up and the warm-up reading.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Delay after each kept reading.
pub const SAMPLE_DELAY: Duration = Duration::from_millis(200);

/// How a weight was obtained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleDetails {
    /// Readings taken.
    pub num_samples: usize,
    /// Readings dropped from each end after sorting.
    pub trim: usize,
    /// Delay after each reading, in seconds.
    pub delay_s: f64,
    /// Readings in acquisition order.
    pub raw_samples: Vec<f64>,
    /// Sorted readings left after trimming.
    pub clean_samples: Vec<f64>,
}

/// Weight of the sample at one stage, as written to `<stage>/<stage>.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MassReading {
    /// Rounded magnitude of the trimmed mean.
    #[serde(rename = "Weight(g)")]
    pub weight_g: f64,
    /// Samples behind the weight.
    #[serde(rename = "Scale")]
    pub scale: ScaleDetails,
}

impl MassReading {
    /// Trimmed mean of `raw` (kept in acquisition order).
    pub fn from_samples(raw: Vec<f64>) -> AppResult<Self> {
        let mut sorted = raw.clone();
        sorted.sort_by(f64::total_cmp);

        if sorted.len() <= 2 * TRIM_EACH_END {
            return Err(RigError::ScaleTrim {
                samples: sorted.len(),
                trim: TRIM_EACH_END,
            });
        }
        let clean = sorted[TRIM_EACH_END..sorted.len() - TRIM_EACH_END].to_vec();
        let mean = clean.iter().sum::<f64>() / clean.len() as f64;

        Ok(Self {
            weight_g: round_2dp(mean.abs()),
            scale: ScaleDetails {
                num_samples: raw.len(),
                trim: TRIM_EACH_END,
                delay_s: SAMPLE_DELAY.as_secs_f64(),
                raw_samples: raw,
                clean_samples: clean,
            },
        })
    }

    /// Writes the reading as pretty JSON.
    pub async fn save(&self, path: &Path) -> AppResult<()> {
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| RigError::io(path, e))
    }
}

fn round_2dp(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Path of a stage's scale result: `<stage_dir>/<stage_name>.json`.
pub fn reading_path(stage_dir: &Path, stage_name: &str) -> PathBuf {
    stage_dir.join(format!("{stage_name}.json"))
}

/// Runs the weighing protocol on `sensor`.
///
/// The sensor is left powered down on success. Returns `Ok(None)` if the
/// run was cancelled during a delay.
pub async fn weigh(
    sensor: &mut dyn MassSensorController,
    reference_unit: f64,
    samples: usize,
    cancel: &CancelToken,
) -> AppResult<Option<MassReading>> {
    sensor.set_reference(reference_unit).await?;
    if !cancel.sleep(WAKE_DELAY).await {
        return Ok(None);
    }
    sensor.power_up().await?;
    if !cancel.sleep(SETTLE_DELAY).await {
        return Ok(None);
    }

    let warm_up = sensor.sample(1).await?;
    debug!(warm_up, "Discarded warm-up reading");

    let mut raw = Vec::with_capacity(samples);
    for _ in 0..samples {
        raw.push(sensor.sample(1).await?);
        if !cancel.sleep(SAMPLE_DELAY).await {
            return Ok(None);
        }
    }
    sensor.power_down().await?;

    let reading = MassReading::from_samples(raw)?;
    info!(weight_g = reading.weight_g, samples, "Sample weighed");
    Ok(Some(reading))
}
