//! Experiment orchestration.
//!
//! # Architecture
//!
//! - **Schedule**: stage offsets, inter-stage waits and stage folder names
//! - **Scale**: per-stage weighing with a trimmed mean
//! - **Sequencer**: state machine that runs the stages and owns the devices
//! - **Status**: phase keys and the events the sequencer publishes
//! - **Manifest**: run record written next to the dataset
//! - **Single**: one-off noise or illuminated burst outside a run
//!
//! # Example
//!
//! ```rust,ignore
//! use capture_rig::config::{validate, ExperimentSettings};
//! use capture_rig::experiment::{SequencerOptions, StageSequencer};
//!
//! let config = Arc::new(validate(&ExperimentSettings::load(path)?)?);
//! let devices = capture_rig::hardware::open_devices(&rig.devices, &config)?;
//! let summary = StageSequencer::new(config, devices, "/data/run1", SequencerOptions::default())
//!     .run()
//!     .await?;
//! ```

pub mod manifest;
pub mod scale;
pub mod schedule;
pub mod sequencer;
pub mod single;
pub mod status;

pub use manifest::{RunManifest, RunOutcome};
pub use scale::MassReading;
pub use schedule::{plan, StagePlan};
pub use sequencer::{RunSummary, SequencerOptions, StageSequencer};
pub use single::capture_single;
pub use status::{
    BroadcastReporter, Phase, RecordingReporter, SequencerEvent, StatusReporter, TracingReporter,
};
