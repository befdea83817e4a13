//! Custom error types for the scan logic.
//!
//! `StepperError` is the single error type returned by every operation of
//! [`ConfocalStepperLogic`](crate::scan::ConfocalStepperLogic). Hardware contracts return
//! `anyhow::Result`; the logic converts those failures into
//! [`StepperError::Hardware`] at the call site, tagging the operation that failed so
//! the log line and the returned error name the same thing.
//!
//! ## Error Hierarchy
//!
//! - **`Hardware`**: a stepper, counter or save call failed. The scan that issued it has
//!   already been torn down by the time the caller sees this.
//! - **`Busy`**: the operation is not allowed while a scan holds the lock.
//! - **`UnknownAxis`**: an axis name that the stepper hardware does not report.
//! - **`CountMismatch`**: the counter returned a different number of bins than steps
//!   were commanded for the line.
//! - **`NotReady`**: an operation that needs prior state (a stopped scan to continue, a
//!   scan to save) was called without it.
//! - **`Config`** / **`Configuration`**: loading or validating configuration failed.
//! - **`History`**: navigation past either end of the scan history.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type AppResult<T> = std::result::Result<T, StepperError>;

#[derive(Error, Debug)]
pub enum StepperError {
    #[error("Hardware error during {operation}: {message}")]
    Hardware {
        operation: &'static str,
        message: String,
    },

    #[error("Stepper is locked by a running scan")]
    Busy,

    #[error("Axis '{0}' is not defined for the stepper hardware")]
    UnknownAxis(String),

    #[error("Counter returned {received} bins instead of {expected}")]
    CountMismatch { expected: usize, received: usize },

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("History error: {0}")]
    History(String),
}

impl StepperError {
    /// Wrap a hardware failure, keeping the full `anyhow` context chain.
    pub fn hardware(operation: &'static str, err: anyhow::Error) -> Self {
        StepperError::Hardware {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// Whether retrying the same call later can succeed without operator action.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            StepperError::Busy | StepperError::NotReady(_) | StepperError::History(_)
        )
    }
}
