//! # Confocal Stepper
//!
//! Scan logic for confocal microscopes positioned by open-loop stepping actuators
//! (slip-stick piezo positioners). A scan steps one axis line by line while a finite
//! photon counter gates one bin per step, and builds a 2D count image from the lines.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`StepperConfig`) from TOML and environment.
//! - **`error`**: The `StepperError` enum and `AppResult` alias.
//! - **`hardware`**: Capability traits for the stepper, counter and data sink, plus mock
//!   implementations for running without an instrument.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`scan`**: The `ConfocalStepperLogic` state machine with its image and history types.
//! - **`state`**: Idle/Locked module state.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;
pub mod state;

pub use error::{AppResult, StepperError};
pub use scan::ConfocalStepperLogic;
