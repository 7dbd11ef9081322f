//! Stage timing.
//!
//! Stage `i` is nominally scheduled at `i * interval` minutes. The lamp
//! preheat eats into the gap, so the idle wait after a stage is
//! `max(0, interval*60 - preheat)` seconds, and there is no wait after the
//! last stage.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ExperimentConfig;

/// When one stage runs and where its data goes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StagePlan {
    /// Zero-based stage number.
    pub index: u32,
    /// Nominal start relative to the first stage.
    pub offset_minutes: f64,
    /// Idle time after this stage; `None` for the final stage.
    pub wait_after: Option<Duration>,
}

impl StagePlan {
    /// Directory name for this stage, e.g. `0.0`, `10.0`, `2.5`.
    pub fn dir_name(&self) -> String {
        format_offset(self.offset_minutes)
    }

    /// `root` joined with [`dir_name`](Self::dir_name).
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(self.dir_name())
    }
}

/// Formats a stage offset the way existing datasets name stage folders:
/// always with a fractional part (`10.0`, never `10`).
pub fn format_offset(minutes: f64) -> String {
    format!("{minutes:?}")
}

/// Idle time between two stages.
pub fn wait_between(interval_minutes: f64, preheat: Duration) -> Duration {
    let seconds = interval_minutes * 60.0 - preheat.as_secs_f64();
    Duration::from_secs_f64(seconds.max(0.0))
}

/// One entry per stage, in run order.
pub fn plan_stages(stage_count: u32, interval_minutes: f64, preheat: Duration) -> Vec<StagePlan> {
    (0..stage_count)
        .map(|index| StagePlan {
            index,
            offset_minutes: interval_minutes * f64::from(index),
            wait_after: (index + 1 < stage_count)
                .then(|| wait_between(interval_minutes, preheat)),
        })
        .collect()
}

/// The full run plan for a validated configuration.
pub fn plan(config: &ExperimentConfig) -> Vec<StagePlan> {
    plan_stages(config.stage_count, config.interval_minutes, config.preheat)
}
