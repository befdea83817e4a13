//! Snapshots of finished scans with back/forward navigation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

use super::axes::{AxisSettings, ScanAxes};
use super::image::ScanImage;
use crate::error::{AppResult, StepperError};
use crate::hardware::StepDirection;

/// Everything needed to restore or save one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique scan identifier
    pub id: Uuid,
    /// When the scan ended
    pub timestamp: DateTime<Utc>,
    /// Scan axes used
    pub axes: ScanAxes,
    /// Axis setpoints at the end of the scan
    pub settings: BTreeMap<String, AxisSettings>,
    /// Steps per line
    pub steps_per_line: usize,
    /// Lines completed
    pub line_counter: usize,
    /// Direction the next line would have been stepped in
    pub direction: StepDirection,
    /// Acquired counts
    pub image: ScanImage,
    /// Whether the scan reached its configured number of lines
    pub completed: bool,
}

/// Bounded list of scan snapshots with a cursor.
#[derive(Debug, Clone)]
pub struct ScanHistory {
    entries: VecDeque<HistoryEntry>,
    index: usize,
    max_length: usize,
}

impl ScanHistory {
    /// Keep at most `max_length` entries (at least one).
    pub fn new(max_length: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            index: 0,
            max_length: max_length.max(1),
        }
    }

    /// Append a snapshot and move the cursor to it, dropping the oldest if full.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > self.max_length {
            self.entries.pop_front();
        }
        self.index = self.entries.len() - 1;
    }

    /// Entry under the cursor
    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.index)
    }

    /// Move the cursor to the previous entry.
    pub fn back(&mut self) -> AppResult<&HistoryEntry> {
        if self.index == 0 || self.entries.is_empty() {
            return Err(StepperError::History(
                "already at the oldest scan".to_string(),
            ));
        }
        self.index -= 1;
        self.current()
            .ok_or_else(|| StepperError::History("history cursor out of range".to_string()))
    }

    /// Move the cursor to the next entry.
    pub fn forward(&mut self) -> AppResult<&HistoryEntry> {
        if self.index + 1 >= self.entries.len() {
            return Err(StepperError::History(
                "already at the newest scan".to_string(),
            ));
        }
        self.index += 1;
        self.current()
            .ok_or_else(|| StepperError::History("history cursor out of range".to_string()))
    }

    /// Cursor position
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No snapshot stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ScanHistory {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lines: usize) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            axes: ScanAxes::default(),
            settings: BTreeMap::new(),
            steps_per_line: 4,
            line_counter: lines,
            direction: StepDirection::Up,
            image: ScanImage::new(4, lines),
            completed: true,
        }
    }

    #[test]
    fn test_push_moves_cursor_to_newest() {
        let mut history = ScanHistory::new(5);
        assert!(history.current().is_none());

        history.push(entry(1));
        history.push(entry(2));
        assert_eq!(history.index(), 1);
        assert_eq!(history.current().map(|e| e.line_counter), Some(2));
    }

    #[test]
    fn test_navigation_bounds() {
        let mut history = ScanHistory::new(5);
        history.push(entry(1));
        history.push(entry(2));
        history.push(entry(3));

        assert!(history.forward().is_err());
        assert_eq!(history.back().unwrap().line_counter, 2);
        assert_eq!(history.back().unwrap().line_counter, 1);
        assert!(history.back().is_err());
        assert_eq!(history.index(), 0);
        assert_eq!(history.forward().unwrap().line_counter, 2);
    }

    #[test]
    fn test_oldest_entry_dropped_when_full() {
        let mut history = ScanHistory::new(2);
        history.push(entry(1));
        history.push(entry(2));
        history.push(entry(3));

        assert_eq!(history.len(), 2);
        assert_eq!(history.back().unwrap().line_counter, 2);
        assert!(history.back().is_err());
    }

    #[test]
    fn test_empty_history_navigation_fails() {
        let mut history = ScanHistory::default();
        assert!(history.is_empty());
        assert!(matches!(history.back(), Err(StepperError::History(_))));
        assert!(matches!(history.forward(), Err(StepperError::History(_))));
    }
}
