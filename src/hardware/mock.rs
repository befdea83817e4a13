//! Mock Hardware Implementations
//!
//! Simulated devices for running scans without an instrument attached.
//! All mocks use async-safe operations (tokio locks, no blocking sleeps).
//!
//! # Available Mocks
//!
//! - `MockStepper` - multi-axis stepper tracking open-loop step positions
//! - `MockCounter` - finite counter producing counts from a [`CountPattern`]
//! - `MemorySink` - scan data sink that keeps saved scans in memory
//!
//! Every mock records the calls it receives so tests can assert on the exact
//! sequence the scan logic issued, and accepts an [`ErrorConfig`] to inject failures
//! into named operations.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::hardware::capabilities::{
    AxisMode, FiniteCounter, Lockable, ScanDataSink, StepDirection, StepperAxes,
};
use crate::scan::HistoryEntry;

// =============================================================================
// Error injection
// =============================================================================

/// A failure to inject into one named operation.
///
/// Operation names match the trait method names (`"move_steps"`, `"start"`,
/// `"fixed_counts"`, `"lock"`, ...).
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Every call fails
    Always { operation: &'static str },
    /// The first `count` calls succeed, every later call fails
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
}

/// Error injection configuration shared by the mock devices.
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    operation_counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::default()
    }

    /// A single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            operation_counts: Arc::default(),
        }
    }

    /// Fail `operation` if a scenario says so
    pub async fn check_operation(&self, device: &str, operation: &'static str) -> Result<()> {
        let mut counts = self.operation_counts.lock().await;
        let current = counts.entry(operation).or_insert(0);
        *current += 1;
        let calls = *current;

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::Always { operation: op } if *op == operation => {
                    bail!("{device}: injected failure in {operation}");
                }
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && calls > *count => {
                    bail!("{device}: injected failure in {operation} after {count} calls");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockStepper - Simulated Stepper
// =============================================================================

/// Calls received by [`MockStepper`]
#[derive(Debug, Clone, PartialEq)]
pub enum StepperCall {
    SetFrequency { axis: String, frequency: f64 },
    SetAmplitude { axis: String, amplitude: f64 },
    SetMode { axis: String, mode: AxisMode },
    Move {
        axis: String,
        direction: StepDirection,
        steps: u32,
    },
    Lock,
    Unlock,
}

#[derive(Debug, Clone)]
struct AxisState {
    frequency: f64,
    amplitude: f64,
    mode: AxisMode,
    position: i64,
}

/// Mock stepper with per-axis frequency, amplitude, mode and step position.
///
/// Axes start grounded at 100 Hz / 30 V and position 0.
///
/// # Example
///
/// ```rust,ignore
/// let stepper = MockStepper::new(&["x", "y", "z"]);
/// stepper.move_steps("x", StepDirection::Up, 10).await?;
/// assert_eq!(stepper.step_position("x").await, Some(10));
/// ```
pub struct MockStepper {
    axes: Mutex<BTreeMap<String, AxisState>>,
    locked: AtomicBool,
    errors: ErrorConfig,
    calls: Mutex<Vec<StepperCall>>,
}

impl MockStepper {
    /// Create a stepper with the given axis names
    pub fn new(axes: &[&str]) -> Self {
        let axes = axes
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    AxisState {
                        frequency: 100.0,
                        amplitude: 30.0,
                        mode: AxisMode::Ground,
                        position: 0,
                    },
                )
            })
            .collect();
        Self {
            axes: Mutex::new(axes),
            locked: AtomicBool::new(false),
            errors: ErrorConfig::none(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Inject failures
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Change the device-side frequency without recording a call (simulates
    /// someone turning a knob on the controller)
    pub async fn set_device_frequency(&self, axis: &str, frequency: f64) {
        if let Some(state) = self.axes.lock().await.get_mut(axis) {
            state.frequency = frequency;
        }
    }

    /// Change the device-side amplitude without recording a call
    pub async fn set_device_amplitude(&self, axis: &str, amplitude: f64) {
        if let Some(state) = self.axes.lock().await.get_mut(axis) {
            state.amplitude = amplitude;
        }
    }

    /// Accumulated open-loop step position of an axis
    pub async fn step_position(&self, axis: &str) -> Option<i64> {
        self.axes.lock().await.get(axis).map(|s| s.position)
    }

    /// Current mode of an axis, bypassing error injection
    pub async fn mode_of(&self, axis: &str) -> Option<AxisMode> {
        self.axes.lock().await.get(axis).map(|s| s.mode)
    }

    /// All calls received so far
    pub async fn calls(&self) -> Vec<StepperCall> {
        self.calls.lock().await.clone()
    }

    /// Only the `Move` calls received so far
    pub async fn moves(&self) -> Vec<(String, StepDirection, u32)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                StepperCall::Move {
                    axis,
                    direction,
                    steps,
                } => Some((axis.clone(), *direction, *steps)),
                _ => None,
            })
            .collect()
    }

    /// Whether the stepper is locked, bypassing error injection
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    async fn record(&self, call: StepperCall) {
        self.calls.lock().await.push(call);
    }

    async fn with_axis<T>(&self, axis: &str, f: impl FnOnce(&mut AxisState) -> T) -> Result<T> {
        let mut axes = self.axes.lock().await;
        let state = axes
            .get_mut(axis)
            .ok_or_else(|| anyhow!("MockStepper: unknown axis '{axis}'"))?;
        Ok(f(state))
    }
}

#[async_trait]
impl StepperAxes for MockStepper {
    async fn axes(&self) -> Result<Vec<String>> {
        self.errors.check_operation("MockStepper", "axes").await?;
        Ok(self.axes.lock().await.keys().cloned().collect())
    }

    async fn step_frequency(&self, axis: &str) -> Result<f64> {
        self.errors
            .check_operation("MockStepper", "step_frequency")
            .await?;
        self.with_axis(axis, |s| s.frequency).await
    }

    async fn set_step_frequency(&self, axis: &str, frequency: f64) -> Result<()> {
        self.errors
            .check_operation("MockStepper", "set_step_frequency")
            .await?;
        if frequency <= 0.0 {
            bail!("MockStepper: frequency must be positive, got {frequency}");
        }
        self.with_axis(axis, |s| s.frequency = frequency).await?;
        self.record(StepperCall::SetFrequency {
            axis: axis.to_string(),
            frequency,
        })
        .await;
        Ok(())
    }

    async fn step_amplitude(&self, axis: &str) -> Result<f64> {
        self.errors
            .check_operation("MockStepper", "step_amplitude")
            .await?;
        self.with_axis(axis, |s| s.amplitude).await
    }

    async fn set_step_amplitude(&self, axis: &str, amplitude: f64) -> Result<()> {
        self.errors
            .check_operation("MockStepper", "set_step_amplitude")
            .await?;
        self.with_axis(axis, |s| s.amplitude = amplitude).await?;
        self.record(StepperCall::SetAmplitude {
            axis: axis.to_string(),
            amplitude,
        })
        .await;
        Ok(())
    }

    async fn axis_mode(&self, axis: &str) -> Result<AxisMode> {
        self.errors.check_operation("MockStepper", "axis_mode").await?;
        self.with_axis(axis, |s| s.mode).await
    }

    async fn set_axis_mode(&self, axis: &str, mode: AxisMode) -> Result<()> {
        self.errors
            .check_operation("MockStepper", "set_axis_mode")
            .await?;
        self.with_axis(axis, |s| s.mode = mode).await?;
        self.record(StepperCall::SetMode {
            axis: axis.to_string(),
            mode,
        })
        .await;
        Ok(())
    }

    async fn move_steps(&self, axis: &str, direction: StepDirection, steps: u32) -> Result<()> {
        self.errors.check_operation("MockStepper", "move_steps").await?;
        let position = self
            .with_axis(axis, |s| {
                s.position += direction.sign() * i64::from(steps);
                s.position
            })
            .await?;
        debug!(axis, ?direction, steps, position, "MockStepper: moved");
        self.record(StepperCall::Move {
            axis: axis.to_string(),
            direction,
            steps,
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl Lockable for MockStepper {
    async fn lock(&self) -> Result<()> {
        self.errors.check_operation("MockStepper", "lock").await?;
        if self.locked.swap(true, Ordering::SeqCst) {
            bail!("MockStepper: already locked");
        }
        self.record(StepperCall::Lock).await;
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        self.errors.check_operation("MockStepper", "unlock").await?;
        self.locked.store(false, Ordering::SeqCst);
        self.record(StepperCall::Unlock).await;
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.locked())
    }
}

// =============================================================================
// MockCounter - Simulated Finite Counter
// =============================================================================

/// How [`MockCounter`] fills its bins
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountPattern {
    /// Every bin has the same value
    Constant(u64),
    /// Bin `i` holds `start + step * i`
    Ramp { start: u64, step: u64 },
    /// Uniform noise in `0..=2*mean`, reproducible from `seed`
    Noise { mean: u64, seed: u64 },
}

impl Default for CountPattern {
    fn default() -> Self {
        CountPattern::Ramp { start: 0, step: 1 }
    }
}

/// Calls received by [`MockCounter`]
#[derive(Debug, Clone, PartialEq)]
pub enum CounterCall {
    SetUpClock(f64),
    SetUpCounter(usize),
    Start,
    ReadCounts,
    Stop,
    CloseCounter,
    CloseClock,
    Lock,
    Unlock,
}

#[derive(Debug)]
struct CounterState {
    clock: Option<f64>,
    samples: Option<usize>,
    running: bool,
    acquisitions: u64,
    rng: StdRng,
}

/// Mock finite counter.
///
/// Enforces the clock → counter → start → read → stop ordering of real counter
/// hardware and returns one bin per configured sample.
pub struct MockCounter {
    state: Mutex<CounterState>,
    pattern: CountPattern,
    /// Bins withheld from every read, to simulate short buffers
    missing_bins: usize,
    locked: AtomicBool,
    errors: ErrorConfig,
    calls: Mutex<Vec<CounterCall>>,
}

impl MockCounter {
    /// Create a counter with the given bin pattern
    pub fn new(pattern: CountPattern) -> Self {
        let seed = match pattern {
            CountPattern::Noise { seed, .. } => seed,
            _ => 0,
        };
        Self {
            state: Mutex::new(CounterState {
                clock: None,
                samples: None,
                running: false,
                acquisitions: 0,
                rng: StdRng::seed_from_u64(seed),
            }),
            pattern,
            missing_bins: 0,
            locked: AtomicBool::new(false),
            errors: ErrorConfig::none(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Inject failures
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Return `missing` fewer bins than configured on every read
    pub fn with_missing_bins(mut self, missing: usize) -> Self {
        self.missing_bins = missing;
        self
    }

    /// Whether the clock task is open
    pub async fn clock_open(&self) -> bool {
        self.state.lock().await.clock.is_some()
    }

    /// Whether the counter task is open
    pub async fn counter_open(&self) -> bool {
        self.state.lock().await.samples.is_some()
    }

    /// Number of completed reads
    pub async fn acquisitions(&self) -> u64 {
        self.state.lock().await.acquisitions
    }

    /// All calls received so far
    pub async fn calls(&self) -> Vec<CounterCall> {
        self.calls.lock().await.clone()
    }

    /// Whether the counter is locked, bypassing error injection
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    async fn record(&self, call: CounterCall) {
        self.calls.lock().await.push(call);
    }
}

impl Default for MockCounter {
    fn default() -> Self {
        Self::new(CountPattern::default())
    }
}

#[async_trait]
impl FiniteCounter for MockCounter {
    async fn set_up_clock(&self, clock_frequency: f64) -> Result<()> {
        self.errors
            .check_operation("MockCounter", "set_up_clock")
            .await?;
        if clock_frequency <= 0.0 {
            bail!("MockCounter: clock frequency must be positive, got {clock_frequency}");
        }
        self.state.lock().await.clock = Some(clock_frequency);
        self.record(CounterCall::SetUpClock(clock_frequency)).await;
        Ok(())
    }

    async fn set_up_counter(&self, samples: usize) -> Result<()> {
        self.errors
            .check_operation("MockCounter", "set_up_counter")
            .await?;
        {
            let mut state = self.state.lock().await;
            if state.clock.is_none() {
                bail!("MockCounter: clock not set up");
            }
            state.samples = Some(samples);
        }
        self.record(CounterCall::SetUpCounter(samples)).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.errors.check_operation("MockCounter", "start").await?;
        {
            let mut state = self.state.lock().await;
            if state.samples.is_none() {
                bail!("MockCounter: counter not set up");
            }
            state.running = true;
        }
        self.record(CounterCall::Start).await;
        Ok(())
    }

    async fn fixed_counts(&self) -> Result<Vec<u64>> {
        self.errors
            .check_operation("MockCounter", "fixed_counts")
            .await?;
        let counts = {
            let mut state = self.state.lock().await;
            if !state.running {
                bail!("MockCounter: read without start");
            }
            let samples = state
                .samples
                .ok_or_else(|| anyhow!("MockCounter: counter not set up"))?;
            let bins = samples.saturating_sub(self.missing_bins);
            let counts: Vec<u64> = match self.pattern {
                CountPattern::Constant(value) => vec![value; bins],
                CountPattern::Ramp { start, step } => {
                    (0..bins as u64).map(|i| start + step * i).collect()
                }
                CountPattern::Noise { mean, .. } => (0..bins)
                    .map(|_| state.rng.gen_range(0..=2 * mean))
                    .collect(),
            };
            state.acquisitions += 1;
            counts
        };
        self.record(CounterCall::ReadCounts).await;
        Ok(counts)
    }

    async fn stop(&self) -> Result<()> {
        self.errors.check_operation("MockCounter", "stop").await?;
        self.state.lock().await.running = false;
        self.record(CounterCall::Stop).await;
        Ok(())
    }

    async fn close_counter(&self) -> Result<()> {
        self.errors
            .check_operation("MockCounter", "close_counter")
            .await?;
        {
            let mut state = self.state.lock().await;
            state.running = false;
            state.samples = None;
        }
        self.record(CounterCall::CloseCounter).await;
        Ok(())
    }

    async fn close_clock(&self) -> Result<()> {
        self.errors
            .check_operation("MockCounter", "close_clock")
            .await?;
        self.state.lock().await.clock = None;
        self.record(CounterCall::CloseClock).await;
        Ok(())
    }
}

#[async_trait]
impl Lockable for MockCounter {
    async fn lock(&self) -> Result<()> {
        self.errors.check_operation("MockCounter", "lock").await?;
        if self.locked.swap(true, Ordering::SeqCst) {
            bail!("MockCounter: already locked");
        }
        self.record(CounterCall::Lock).await;
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        self.errors.check_operation("MockCounter", "unlock").await?;
        self.locked.store(false, Ordering::SeqCst);
        self.record(CounterCall::Unlock).await;
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.locked())
    }
}

// =============================================================================
// MemorySink - In-memory Scan Data Sink
// =============================================================================

/// Keeps every saved scan in memory.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<HistoryEntry>>,
    errors: ErrorConfig,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject failures
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Scans saved so far
    pub async fn saved(&self) -> Vec<HistoryEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ScanDataSink for MemorySink {
    async fn save(&self, entry: &HistoryEntry) -> Result<()> {
        self.errors.check_operation("MemorySink", "save").await?;
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stepper_tracks_positions() {
        let stepper = MockStepper::new(&["x", "y"]);

        stepper.move_steps("x", StepDirection::Up, 10).await.unwrap();
        stepper.move_steps("x", StepDirection::Down, 3).await.unwrap();
        assert_eq!(stepper.step_position("x").await, Some(7));
        assert_eq!(stepper.step_position("y").await, Some(0));
        assert_eq!(stepper.moves().await.len(), 2);
    }

    #[tokio::test]
    async fn test_stepper_unknown_axis() {
        let stepper = MockStepper::new(&["x"]);
        assert!(stepper.step_frequency("q").await.is_err());
        assert!(stepper.move_steps("q", StepDirection::Up, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_stepper_axes_sorted() {
        let stepper = MockStepper::new(&["z", "x", "y"]);
        assert_eq!(stepper.axes().await.unwrap(), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_stepper_double_lock_fails() {
        let stepper = MockStepper::new(&["x"]);
        stepper.lock().await.unwrap();
        assert!(stepper.lock().await.is_err());
        stepper.unlock().await.unwrap();
        assert!(!stepper.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_requires_setup_order() {
        let counter = MockCounter::default();
        assert!(counter.set_up_counter(5).await.is_err());
        assert!(counter.start().await.is_err());

        counter.set_up_clock(100.0).await.unwrap();
        counter.set_up_counter(5).await.unwrap();
        assert!(counter.fixed_counts().await.is_err());

        counter.start().await.unwrap();
        assert_eq!(counter.fixed_counts().await.unwrap(), vec![0, 1, 2, 3, 4]);
        counter.stop().await.unwrap();
        assert_eq!(counter.acquisitions().await, 1);
    }

    #[tokio::test]
    async fn test_counter_missing_bins() {
        let counter = MockCounter::new(CountPattern::Constant(7)).with_missing_bins(2);
        counter.set_up_clock(100.0).await.unwrap();
        counter.set_up_counter(5).await.unwrap();
        counter.start().await.unwrap();
        assert_eq!(counter.fixed_counts().await.unwrap(), vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn test_counter_noise_is_seeded() {
        async fn read(seed: u64) -> Vec<u64> {
            let counter = MockCounter::new(CountPattern::Noise { mean: 50, seed });
            counter.set_up_clock(100.0).await.unwrap();
            counter.set_up_counter(20).await.unwrap();
            counter.start().await.unwrap();
            counter.fixed_counts().await.unwrap()
        }

        let a = read(7).await;
        let b = read(7).await;
        assert_eq!(a, b);
        assert!(a.iter().all(|&c| c <= 100));
    }

    #[tokio::test]
    async fn test_counter_close_releases_resources() {
        let counter = MockCounter::default();
        counter.set_up_clock(100.0).await.unwrap();
        counter.set_up_counter(5).await.unwrap();
        assert!(counter.clock_open().await);
        assert!(counter.counter_open().await);

        counter.close_counter().await.unwrap();
        counter.close_clock().await.unwrap();
        assert!(!counter.clock_open().await);
        assert!(!counter.counter_open().await);
    }

    #[tokio::test]
    async fn test_fail_after_n() {
        let stepper = MockStepper::new(&["x"]).with_errors(ErrorConfig::scenario(
            ErrorScenario::FailAfterN {
                operation: "move_steps",
                count: 2,
            },
        ));

        stepper.move_steps("x", StepDirection::Up, 1).await.unwrap();
        stepper.move_steps("x", StepDirection::Up, 1).await.unwrap();
        let err = stepper
            .move_steps("x", StepDirection::Up, 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("move_steps"));
        assert_eq!(stepper.step_position("x").await, Some(2));
    }

    #[tokio::test]
    async fn test_always_fails_only_named_operation() {
        let counter = MockCounter::default().with_errors(ErrorConfig::scenario(
            ErrorScenario::Always {
                operation: "start",
            },
        ));
        counter.set_up_clock(10.0).await.unwrap();
        counter.set_up_counter(1).await.unwrap();
        assert!(counter.start().await.is_err());
    }
}
