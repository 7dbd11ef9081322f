//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the whole capture rig.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure a measurement run can hit, from a bad settings field
//! to a digital line that refuses to switch.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigValidation`**: A named settings field failed its range rule. Raised by the
//!   validator before any hardware is touched and never retried.
//! - **`Settings`**: The settings or runtime configuration file could not be read or parsed.
//! - **`DeviceUnavailable`**: A device is not present on this machine. The simulated device
//!   set never raises it, which keeps dry runs deterministic.
//! - **`RuntimeIo`**: An artifact (image, sidecar, scale result) could not be written. Aborts
//!   the current stage; teardown still runs.
//! - **`HardwareAssertion`**: A digital line could not be driven. Fatal to the run; teardown
//!   still runs.
//! - **`Camera`** / **`MassSensor`**: Device-level failures reported by a driver.
//! - **`TeardownFailed`**: The run itself succeeded but returning hardware to a safe state
//!   did not. Teardown failures never replace an earlier error.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Every failure the capture rig can report.
#[derive(Error, Debug)]
pub enum RigError {
    /// A settings field violated its rule. `field` is the settings key.
    #[error("Invalid setting '{field}': {message}")]
    ConfigValidation {
        /// Settings key that failed.
        field: &'static str,
        /// Human-readable reason.
        message: String,
    },

    /// Settings or runtime configuration could not be read.
    #[error("Settings error: {0}")]
    Settings(String),

    /// A device backend could not be opened.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Writing a run artifact failed.
    #[error("I/O error at {}: {source}", path.display())]
    RuntimeIo {
        /// File or directory being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A digital output line could not be reserved or driven.
    #[error("Failed to drive line {line}: {message}")]
    HardwareAssertion {
        /// Logical line number.
        line: u8,
        /// Driver message.
        message: String,
    },

    /// The camera refused a call or a capture failed.
    #[error("Camera error: {0}")]
    Camera(String),

    /// The load-cell ADC failed.
    #[error("Mass sensor error: {0}")]
    MassSensor(String),

    /// Trimming removed every sample, so no mean can be formed.
    #[error("Cannot trim {trim} samples from each end of {samples} readings")]
    ScaleTrim {
        /// Number of readings collected.
        samples: usize,
        /// Readings dropped from each end.
        trim: usize,
    },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operator stopped the run.
    #[error("Run cancelled")]
    Cancelled,

    /// A burst task panicked or was aborted.
    #[error("Capture task failed: {0}")]
    TaskJoin(String),

    /// One or more safe-state steps failed; every step was still attempted.
    #[error("Teardown failed with errors")]
    TeardownFailed(Vec<RigError>),
}

impl RigError {
    /// Builds a [`RigError::RuntimeIo`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RigError::RuntimeIo {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`RigError::ConfigValidation`].
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        RigError::ConfigValidation {
            field,
            message: message.into(),
        }
    }

    /// Validation errors are local to the form and recoverable by editing the input.
    pub fn is_validation(&self) -> bool {
        matches!(self, RigError::ConfigValidation { .. })
    }
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        RigError::Settings(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RigError {
    fn from(err: tokio::task::JoinError) -> Self {
        RigError::TaskJoin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::invalid("lens_position", "Lens position must be between 0 and 10.");
        assert_eq!(
            err.to_string(),
            "Invalid setting 'lens_position': Lens position must be between 0 and 10."
        );
        assert!(err.is_validation());
    }

    #[test]
    fn test_runtime_io_names_path() {
        let err = RigError::io(
            "/data/0.0/100",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/data/0.0/100"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_teardown_failed_error() {
        let err = RigError::TeardownFailed(vec![
            RigError::Camera("stop timed out".into()),
            RigError::HardwareAssertion {
                line: 17,
                message: "busy".into(),
            },
        ]);
        assert!(err.to_string().contains("Teardown failed"));
    }
}
