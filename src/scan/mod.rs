//! 2D stepper scanning: axis selection, the count image, scan history and the
//! line-by-line scan logic.

pub mod axes;
pub mod history;
pub mod image;
pub mod logic;

pub use axes::{AxisSettings, ScanAxes};
pub use history::{HistoryEntry, ScanHistory};
pub use image::ScanImage;
pub use logic::{ConfocalStepperLogic, LineStatus, ScanOutcome};
