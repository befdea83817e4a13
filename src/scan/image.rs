//! Line-by-line count image.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, StepperError};
use crate::hardware::StepDirection;

/// 2D count matrix built one scan line at a time.
///
/// Rows are stored in spatial order: lines acquired in the `Down` direction are
/// reversed before they are appended, so column `i` of every row is the same
/// fast-axis step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanImage {
    columns: usize,
    rows: Vec<Vec<u64>>,
}

/// Upper bound on rows reserved up front; longer scans grow as lines arrive.
const MAX_RESERVED_ROWS: usize = 1024;

impl ScanImage {
    /// Empty image with `columns` bins per line, reserving room for up to
    /// `expected_rows` lines.
    pub fn new(columns: usize, expected_rows: usize) -> Self {
        Self {
            columns,
            rows: Vec::with_capacity(expected_rows.min(MAX_RESERVED_ROWS)),
        }
    }

    /// Append one acquired line.
    pub fn push_line(&mut self, mut counts: Vec<u64>, direction: StepDirection) -> AppResult<()> {
        if counts.len() != self.columns {
            return Err(StepperError::CountMismatch {
                expected: self.columns,
                received: counts.len(),
            });
        }
        if direction == StepDirection::Down {
            counts.reverse();
        }
        self.rows.push(counts);
        Ok(())
    }

    /// Bins per line
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Lines acquired so far
    pub fn line_count(&self) -> usize {
        self.rows.len()
    }

    /// All rows, oldest first
    pub fn rows(&self) -> &[Vec<u64>] {
        &self.rows
    }

    /// One row
    pub fn row(&self, index: usize) -> Option<&[u64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// No line acquired yet
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sum over all bins
    pub fn total_counts(&self) -> u64 {
        self.rows.iter().flatten().sum()
    }

    /// Brightest bin, if any
    pub fn max_count(&self) -> Option<u64> {
        self.rows.iter().flatten().copied().max()
    }
}
