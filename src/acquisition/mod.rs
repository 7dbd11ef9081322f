//! Frame acquisition: the single-burst capture task and run cancellation.

pub mod burst;
pub mod cancel;

pub use burst::{BurstRequest, BurstTask, CaptureBurst, CapturedFrame, ProgressFn};
pub use cancel::CancelToken;
