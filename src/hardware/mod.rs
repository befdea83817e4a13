//! Hardware contracts and simulated devices.
pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AxisMode, ConfocalStepper, FiniteCounter, Lockable, PhotonCounter, ScanDataSink,
    StepDirection, StepperAxes,
};
