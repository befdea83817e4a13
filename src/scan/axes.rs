//! Scan axis selection and per-axis settings.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, StepperError};
use crate::hardware::AxisMode;

/// Configured stepping parameters of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Step frequency in Hz
    pub frequency: f64,
    /// Step amplitude in V
    pub amplitude: f64,
    /// Output mode
    pub mode: AxisMode,
}

/// The two axes spanning a 2D scan.
///
/// Written as `"xz"` (single-letter axis names) or `"x,z"` / `"x z"` for longer names.
/// Without inversion the second named axis is stepped and counted along each line
/// (fast axis) and the first is advanced by one step between lines (slow axis);
/// `inverted` swaps the roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAxes {
    /// First named axis
    pub first: String,
    /// Second named axis
    pub second: String,
    /// Swap fast and slow axis
    pub inverted: bool,
}

impl ScanAxes {
    /// Build from two axis names.
    pub fn new(first: impl Into<String>, second: impl Into<String>, inverted: bool) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
            inverted,
        }
    }

    /// Parse an axis pair such as `"xz"`, `"x,z"` or `"x z"`.
    pub fn parse(pair: &str, inverted: bool) -> AppResult<Self> {
        let pair = pair.trim();
        let names: Vec<String> = if pair.contains([',', ' ']) {
            pair.split([',', ' '])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            pair.chars().map(|c| c.to_string()).collect()
        };

        match names.as_slice() {
            [first, second] if first != second => Ok(Self::new(first, second, inverted)),
            [first, second] => Err(StepperError::Configuration(format!(
                "Scan axes must differ, got '{first}' twice"
            ))),
            _ => Err(StepperError::Configuration(format!(
                "Scan axes '{pair}' must name exactly two axes"
            ))),
        }
    }

    /// Axis stepped and counted along a line.
    pub fn fast_axis(&self) -> &str {
        if self.inverted {
            &self.first
        } else {
            &self.second
        }
    }

    /// Axis advanced one step between lines.
    pub fn slow_axis(&self) -> &str {
        if self.inverted {
            &self.second
        } else {
            &self.first
        }
    }
}

impl Default for ScanAxes {
    fn default() -> Self {
        Self::new("x", "z", false)
    }
}

impl std::fmt::Display for ScanAxes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first.chars().count() == 1 && self.second.chars().count() == 1 {
            write!(f, "{}{}", self.first, self.second)
        } else {
            write!(f, "{},{}", self.first, self.second)
        }
    }
}
