//! Hardware Capabilities
//!
//! The scan logic talks to three externally supplied devices through small
//! capability traits:
//!
//! - a positioning stepper implements: `StepperAxes + Lockable`
//! - a photon counter implements: `FiniteCounter + Lockable`
//! - a data saver implements: `ScanDataSink`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn one_line<S, C>(stepper: &S, counter: &C) -> Result<Vec<u64>>
//! where
//!     S: StepperAxes,
//!     C: FiniteCounter,
//! {
//!     stepper.move_steps("x", StepDirection::Up, 50).await?;
//!     counter.start().await?;
//!     let counts = counter.fixed_counts().await?;
//!     counter.stop().await?;
//!     Ok(counts)
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scan::HistoryEntry;

/// Output mode of a stepper axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisMode {
    /// Axis accepts step commands
    Stepping,
    /// Axis output grounded; the actuator holds position and ignores step commands
    Ground,
}

impl std::fmt::Display for AxisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisMode::Stepping => write!(f, "stepping"),
            AxisMode::Ground => write!(f, "ground"),
        }
    }
}

/// Direction of a step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepDirection {
    /// Positive / outward
    Up,
    /// Negative / inward
    Down,
}

impl StepDirection {
    /// Opposite direction
    pub fn reversed(self) -> Self {
        match self {
            StepDirection::Up => StepDirection::Down,
            StepDirection::Down => StepDirection::Up,
        }
    }

    /// +1 for up, -1 for down
    pub fn sign(self) -> i64 {
        match self {
            StepDirection::Up => 1,
            StepDirection::Down => -1,
        }
    }
}

/// Capability: Stepper Axes
///
/// A multi-axis open-loop stepping actuator (e.g. slip-stick piezo positioners).
///
/// # Contract
/// - Axis names are those returned by `axes()`
/// - Frequencies are in Hz, amplitudes in volts
/// - `move_steps` returns once the step train has been issued; it does not wait for
///   the steps to complete
#[async_trait]
pub trait StepperAxes: Send + Sync {
    /// Names of the axes this device drives
    async fn axes(&self) -> Result<Vec<String>>;

    /// Current step frequency of an axis
    async fn step_frequency(&self, axis: &str) -> Result<f64>;

    /// Set the step frequency of an axis
    async fn set_step_frequency(&self, axis: &str, frequency: f64) -> Result<()>;

    /// Current step amplitude of an axis
    async fn step_amplitude(&self, axis: &str) -> Result<f64>;

    /// Set the step amplitude of an axis
    async fn set_step_amplitude(&self, axis: &str, amplitude: f64) -> Result<()>;

    /// Current output mode of an axis
    async fn axis_mode(&self, axis: &str) -> Result<AxisMode>;

    /// Set the output mode of an axis
    async fn set_axis_mode(&self, axis: &str, mode: AxisMode) -> Result<()>;

    /// Issue `steps` steps on `axis` in `direction`
    async fn move_steps(&self, axis: &str, direction: StepDirection, steps: u32) -> Result<()>;
}

/// Capability: Finite Counting
///
/// A photon counter that gates a fixed number of bins from its own sample clock.
///
/// # Contract
/// - `set_up_clock` must precede `set_up_counter`
/// - `start` arms one acquisition of the configured number of bins
/// - `fixed_counts` blocks until the acquisition is complete and returns the bins
/// - `stop` ends the acquisition; `close_counter` / `close_clock` release the resources
#[async_trait]
pub trait FiniteCounter: Send + Sync {
    /// Configure the sample clock
    async fn set_up_clock(&self, clock_frequency: f64) -> Result<()>;

    /// Configure the counter for `samples` bins per acquisition
    async fn set_up_counter(&self, samples: usize) -> Result<()>;

    /// Start one acquisition
    async fn start(&self) -> Result<()>;

    /// Read the bins of the current acquisition
    async fn fixed_counts(&self) -> Result<Vec<u64>>;

    /// Stop the current acquisition
    async fn stop(&self) -> Result<()>;

    /// Release the counter task
    async fn close_counter(&self) -> Result<()>;

    /// Release the clock task
    async fn close_clock(&self) -> Result<()>;
}

/// Capability: Exclusive Use
///
/// Devices shared between modules are locked by whoever drives them.
#[async_trait]
pub trait Lockable: Send + Sync {
    /// Take exclusive use; fails when already locked
    async fn lock(&self) -> Result<()>;

    /// Release exclusive use
    async fn unlock(&self) -> Result<()>;

    /// Whether the device is currently locked
    async fn is_locked(&self) -> Result<bool> {
        anyhow::bail!("Lock state query not supported by this device")
    }
}

/// Capability: Scan Data Saving
///
/// Receives finished scans. The on-disk format, if any, belongs to the implementor.
#[async_trait]
pub trait ScanDataSink: Send + Sync {
    /// Persist one scan snapshot
    async fn save(&self, entry: &HistoryEntry) -> Result<()>;
}

// =============================================================================
// Combined Traits (for trait objects)
// =============================================================================

/// A lockable stepper, usable as `Arc<dyn ConfocalStepper>`.
pub trait ConfocalStepper: StepperAxes + Lockable {}

impl<T: StepperAxes + Lockable> ConfocalStepper for T {}

/// A lockable finite counter, usable as `Arc<dyn PhotonCounter>`.
pub trait PhotonCounter: FiniteCounter + Lockable {}

impl<T: FiniteCounter + Lockable> PhotonCounter for T {}
