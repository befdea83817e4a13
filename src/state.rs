//! Module lock state.
//!
//! A scan owns the stepper exclusively while it runs. The logic tracks this with a
//! two-state machine:
//!
//! ```text
//! Idle ──lock()──> Locked ──unlock()──> Idle
//! ```
//!
//! Parameter setters and manual moves are refused while `Locked`.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, StepperError};

/// Lock state of the scan logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModuleState {
    /// No scan running; configuration may change
    #[default]
    Idle,
    /// A scan holds the stepper and counter
    Locked,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleState::Idle => write!(f, "idle"),
            ModuleState::Locked => write!(f, "locked"),
        }
    }
}

impl ModuleState {
    /// Transition Idle → Locked.
    pub fn lock(&mut self) -> AppResult<()> {
        match self {
            ModuleState::Idle => {
                *self = ModuleState::Locked;
                Ok(())
            }
            ModuleState::Locked => Err(StepperError::Busy),
        }
    }

    /// Transition to Idle. Unlocking an idle module is a no-op.
    pub fn unlock(&mut self) {
        *self = ModuleState::Idle;
    }

    /// Whether a scan currently holds the lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, ModuleState::Locked)
    }

    /// Fail with [`StepperError::Busy`] while locked.
    pub fn ensure_idle(&self) -> AppResult<()> {
        if self.is_locked() {
            Err(StepperError::Busy)
        } else {
            Ok(())
        }
    }
}
