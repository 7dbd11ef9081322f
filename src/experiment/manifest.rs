//! Run manifest.
//!
//! Written to `<root>/run_manifest.json` when a run ends, whatever the
//! outcome, so a dataset always records which software produced it, with
//! which configuration, and how far it got.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::error::{AppResult, RigError};

/// Manifest filename under the run root.
pub const MANIFEST_FILE: &str = "run_manifest.json";

/// How a run ended, serialized as `{"status": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Not finished yet.
    Running,
    /// Every stage ran.
    Completed,
    /// Stopped by the operator.
    Cancelled,
    /// Stopped by an error.
    Failed {
        /// The error as displayed.
        error: String,
    },
}

/// Record of one run, saved next to its dataset.
#[derive(Clone, Debug, Serialize)]
pub struct RunManifest {
    /// Unique per run.
    pub run_id: Uuid,
    /// Crate version that produced the dataset.
    pub software_version: String,
    /// Wall-clock start, UTC.
    pub started_at: DateTime<Utc>,
    /// `None` while running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Current or final outcome.
    pub outcome: RunOutcome,
    /// Stage count from the configuration.
    pub stages_planned: u32,
    /// Stages that ran to the end.
    pub stages_completed: u32,
    /// Shutter values visited at every stage, in µs.
    pub shutter_values: Vec<u32>,
    /// The validated configuration the run used.
    pub config: ExperimentConfig,
}

impl RunManifest {
    /// Starts a manifest for a run about to begin.
    pub fn begin(config: &ExperimentConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            stages_planned: config.stage_count,
            stages_completed: 0,
            shutter_values: config.sweep.values(),
            config: config.clone(),
        }
    }

    /// Records how the run ended.
    pub fn finish(&mut self, outcome: RunOutcome, stages_completed: u32) {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self.stages_completed = stages_completed;
    }

    /// Where the manifest for a run rooted at `root` lives.
    pub fn path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    /// Writes the manifest as pretty JSON and returns its path.
    pub async fn save(&self, root: &Path) -> AppResult<PathBuf> {
        let path = Self::path(root);
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| RigError::io(&path, e))?;
        Ok(path)
    }
}
