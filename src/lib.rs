//! Core library for the capture rig.
//!
//! Runs repeated measurement stages on a camera rig: exposure sweeps with
//! noise, LED and lamp-illuminated image bursts, a lamp preheat, and optional
//! per-stage weighing of the sample on a load cell. The `capture-rig` binary
//! is a thin CLI over this library.
//!
//! - [`config`]: settings file, validation and runtime configuration
//! - [`hardware`]: device traits with simulated and hardware implementations
//! - [`acquisition`]: burst capture task and cancellation
//! - [`experiment`]: stage sequencer, status events, scale and manifest

pub mod acquisition;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, RigError};
