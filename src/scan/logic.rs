//! Confocal stepper scan logic.
//!
//! Drives a 2D scan with an open-loop stepper and a finite photon counter: the fast
//! axis is stepped `steps_per_line` times per line while the counter gates one bin per
//! step, lines alternate direction, and the slow axis advances by one step between
//! lines.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start_stepper()--> Locked --(stop | lines reached | failure)--> Idle
//!                              ^                                          |
//!                              +-------------continue_stepper()-----------+
//! ```
//!
//! While `Locked` every parameter setter returns [`StepperError::Busy`]. Stop is
//! cooperative: [`ConfocalStepperLogic::stop_stepper`] raises a flag that the line loop
//! reads at the top of the next line.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::axes::{AxisSettings, ScanAxes};
use super::history::{HistoryEntry, ScanHistory};
use super::image::ScanImage;
use crate::config::{AxisDefaults, StepperConfig};
use crate::error::{AppResult, StepperError};
use crate::hardware::{AxisMode, ConfocalStepper, PhotonCounter, ScanDataSink, StepDirection};
use crate::state::ModuleState;

/// Result of one [`ConfocalStepperLogic::step_line`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// Line acquired, more to come
    Continue,
    /// Stop was requested; the scan has been torn down
    Stopped,
    /// Configured number of lines reached; the scan has been torn down
    Completed,
    /// No scan is running
    Idle,
}

/// How a scan run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Ended on request; can be continued
    Stopped,
    /// All configured lines acquired
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    Stopped,
    Completed,
    Aborted,
}

struct LogicState {
    module: ModuleState,
    axes: Vec<String>,
    settings: BTreeMap<String, AxisSettings>,
    positions: BTreeMap<String, i64>,
    defaults: AxisDefaults,
    scan_axes: ScanAxes,
    steps_per_line: usize,
    lines: usize,
    clock_frequency: Option<f64>,
    line_counter: usize,
    direction: StepDirection,
    image: ScanImage,
    history: ScanHistory,
    can_continue: bool,
}

impl LogicState {
    fn axis(&self, axis: &str) -> AppResult<&AxisSettings> {
        self.settings
            .get(axis)
            .ok_or_else(|| StepperError::UnknownAxis(axis.to_string()))
    }

    fn axis_mut(&mut self, axis: &str) -> AppResult<&mut AxisSettings> {
        self.settings
            .get_mut(axis)
            .ok_or_else(|| StepperError::UnknownAxis(axis.to_string()))
    }

    fn snapshot(&self, completed: bool) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            axes: self.scan_axes.clone(),
            settings: self.settings.clone(),
            steps_per_line: self.steps_per_line,
            line_counter: self.line_counter,
            direction: self.direction,
            image: self.image.clone(),
            completed,
        }
    }
}

/// Scan logic for a confocal setup positioned by a stepper.
///
/// Shared as `Arc<ConfocalStepperLogic>` between the task running the scan and
/// whoever controls it.
pub struct ConfocalStepperLogic {
    stepper: Arc<dyn ConfocalStepper>,
    counter: Arc<dyn PhotonCounter>,
    sink: Arc<dyn ScanDataSink>,
    inner: Mutex<LogicState>,
    stop_requested: AtomicBool,
}

impl ConfocalStepperLogic {
    /// Create the logic from configuration and the three devices.
    ///
    /// Call [`initialize`](Self::initialize) before scanning.
    pub fn new(
        config: &StepperConfig,
        stepper: Arc<dyn ConfocalStepper>,
        counter: Arc<dyn PhotonCounter>,
        sink: Arc<dyn ScanDataSink>,
    ) -> AppResult<Self> {
        let scan_axes = ScanAxes::parse(&config.scan.axes, config.scan.inverted)?;
        let steps_per_line = config.scan.steps_per_line;
        let lines = config.scan.lines;

        Ok(Self {
            stepper,
            counter,
            sink,
            inner: Mutex::new(LogicState {
                module: ModuleState::Idle,
                axes: Vec::new(),
                settings: BTreeMap::new(),
                positions: BTreeMap::new(),
                defaults: config.axis_defaults.clone(),
                scan_axes,
                steps_per_line,
                lines,
                clock_frequency: config.scan.clock_frequency,
                line_counter: 0,
                direction: StepDirection::Up,
                image: ScanImage::new(steps_per_line, lines),
                history: ScanHistory::new(config.scan.history_length),
                can_continue: false,
            }),
            stop_requested: AtomicBool::new(false),
        })
    }

    /// Read axes and their current settings from the stepper.
    ///
    /// Axes whose read-back fails start from the configured defaults.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;

        let axes = self
            .stepper
            .axes()
            .await
            .map_err(|e| StepperError::hardware("axes", e))?;

        let mut settings = BTreeMap::new();
        for axis in &axes {
            let frequency = match self.stepper.step_frequency(axis).await {
                Ok(f) if is_valid_frequency(f) => f,
                Ok(f) => {
                    warn!(axis = %axis, "Stepper reports step frequency {f}, using default");
                    st.defaults.frequency
                }
                Err(e) => {
                    warn!(axis = %axis, "Could not read step frequency, using default: {e:#}");
                    st.defaults.frequency
                }
            };
            let amplitude = match self.stepper.step_amplitude(axis).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(axis = %axis, "Could not read step amplitude, using default: {e:#}");
                    st.defaults.amplitude
                }
            };
            let mode = match self.stepper.axis_mode(axis).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(axis = %axis, "Could not read axis mode, assuming ground: {e:#}");
                    AxisMode::Ground
                }
            };
            settings.insert(
                axis.clone(),
                AxisSettings {
                    frequency,
                    amplitude,
                    mode,
                },
            );
            st.positions.entry(axis.clone()).or_insert(0);
        }

        info!("Stepper reports axes {:?}", axes);
        st.axes = axes;
        st.settings = settings;
        Ok(())
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Override the counter clock frequency. `None` lets the clock follow the fast
    /// axis step frequency again.
    pub async fn set_clock_frequency(&self, frequency: Option<f64>) -> AppResult<()> {
        if let Some(frequency) = frequency {
            if !is_valid_frequency(frequency) {
                return Err(StepperError::Configuration(format!(
                    "Clock frequency must be positive and finite, got {frequency}"
                )));
            }
        }
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        st.clock_frequency = frequency;
        Ok(())
    }

    /// Store and write the step frequency of an axis.
    pub async fn set_stepper_frequency(&self, axis: &str, frequency: f64) -> AppResult<()> {
        if !is_valid_frequency(frequency) {
            return Err(StepperError::Configuration(format!(
                "Step frequency must be positive and finite, got {frequency}"
            )));
        }
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        st.axis_mut(axis)?.frequency = frequency;
        self.stepper
            .set_step_frequency(axis, frequency)
            .await
            .map_err(|e| StepperError::hardware("set_step_frequency", e))
    }

    /// Store and write the step amplitude of an axis.
    pub async fn set_stepper_amplitude(&self, axis: &str, amplitude: f64) -> AppResult<()> {
        if !(amplitude.is_finite() && amplitude >= 0.0) {
            return Err(StepperError::Configuration(format!(
                "Step amplitude must be finite and not negative, got {amplitude}"
            )));
        }
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        st.axis_mut(axis)?.amplitude = amplitude;
        self.stepper
            .set_step_amplitude(axis, amplitude)
            .await
            .map_err(|e| StepperError::hardware("set_step_amplitude", e))
    }

    /// Step frequency of an axis as reported by the device, or the stored value if the
    /// device cannot be read.
    pub async fn stepper_frequency(&self, axis: &str) -> AppResult<f64> {
        let mut st = self.inner.lock().await;
        let stored = st.axis(axis)?.frequency;
        match self.stepper.step_frequency(axis).await {
            Ok(frequency) => {
                st.axis_mut(axis)?.frequency = frequency;
                Ok(frequency)
            }
            Err(e) => {
                warn!(axis, "The stepper frequency was not read, using stored value: {e:#}");
                Ok(stored)
            }
        }
    }

    /// Step amplitude of an axis as reported by the device, or the stored value if the
    /// device cannot be read.
    pub async fn stepper_amplitude(&self, axis: &str) -> AppResult<f64> {
        let mut st = self.inner.lock().await;
        let stored = st.axis(axis)?.amplitude;
        match self.stepper.step_amplitude(axis).await {
            Ok(amplitude) => {
                st.axis_mut(axis)?.amplitude = amplitude;
                Ok(amplitude)
            }
            Err(e) => {
                warn!(axis, "The stepper amplitude was not read, using stored value: {e:#}");
                Ok(stored)
            }
        }
    }

    /// Put an axis into stepping mode.
    pub async fn set_mode_stepping(&self, axis: &str) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        self.apply_mode(&mut st, axis, AxisMode::Stepping).await
    }

    /// Ground an axis.
    pub async fn set_mode_ground(&self, axis: &str) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        self.apply_mode(&mut st, axis, AxisMode::Ground).await
    }

    /// Rewrite the stored frequency if the device disagrees with it.
    pub async fn check_frequency(&self, axis: &str) -> AppResult<()> {
        let st = self.inner.lock().await;
        st.module.ensure_idle()?;
        self.reconcile_frequency(&st, axis).await
    }

    /// Rewrite the stored amplitude if the device disagrees with it.
    pub async fn check_amplitude(&self, axis: &str) -> AppResult<()> {
        let st = self.inner.lock().await;
        st.module.ensure_idle()?;
        self.reconcile_amplitude(&st, axis).await
    }

    /// Axis names reported by the stepper.
    pub async fn stepper_axes(&self) -> AppResult<Vec<String>> {
        self.stepper
            .axes()
            .await
            .map_err(|e| StepperError::hardware("axes", e))
    }

    /// Select the scan axes. Names are checked against the hardware at start.
    ///
    /// A stopped scan can no longer be continued afterwards.
    pub async fn set_scan_axes(&self, axes: ScanAxes) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        if st.scan_axes != axes {
            st.can_continue = false;
        }
        st.scan_axes = axes;
        Ok(())
    }

    /// Steps, and counter bins, per line.
    pub async fn set_steps_per_line(&self, steps: usize) -> AppResult<()> {
        if steps == 0 {
            return Err(StepperError::Configuration(
                "steps_per_line must be at least 1".to_string(),
            ));
        }
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        if st.steps_per_line != steps {
            st.can_continue = false;
        }
        st.steps_per_line = steps;
        Ok(())
    }

    /// Lines per scan; 0 scans until stopped.
    pub async fn set_lines(&self, lines: usize) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        st.lines = lines;
        Ok(())
    }

    // =========================================================================
    // Scan control
    // =========================================================================

    /// Prepare the hardware and enter `Locked` for a fresh scan.
    #[instrument(skip(self))]
    pub async fn start_stepper(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        if st.axes.is_empty() {
            return Err(StepperError::NotReady(
                "stepper axes unknown, initialize first".to_string(),
            ));
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        for axis in [st.scan_axes.first.clone(), st.scan_axes.second.clone()] {
            if !st.axes.contains(&axis) {
                error!("Axis '{axis}' is not defined for the stepper hardware");
                return Err(StepperError::UnknownAxis(axis));
            }
        }

        st.line_counter = 0;
        st.direction = StepDirection::Up;
        st.image = ScanImage::new(st.steps_per_line, st.lines);
        st.can_continue = false;

        self.prepare_hardware(&mut st).await?;
        st.module.lock()?;

        info!(
            axes = %st.scan_axes,
            fast = st.scan_axes.fast_axis(),
            steps_per_line = st.steps_per_line,
            lines = st.lines,
            "Scan started"
        );
        Ok(())
    }

    /// Request the running scan to stop at the next line boundary.
    pub async fn stop_stepper(&self) -> AppResult<()> {
        let st = self.inner.lock().await;
        if st.module.is_locked() {
            self.stop_requested.store(true, Ordering::SeqCst);
            info!("Stop requested");
        } else {
            debug!("Stop requested while idle, ignoring");
        }
        Ok(())
    }

    /// Re-arm the hardware for a stopped scan, keeping its image, line counter and
    /// direction.
    #[instrument(skip(self))]
    pub async fn continue_stepper(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        if !st.can_continue {
            return Err(StepperError::NotReady(
                "no stopped scan to continue".to_string(),
            ));
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        self.prepare_hardware(&mut st).await?;
        st.module.lock()?;
        st.can_continue = false;

        info!(
            line = st.line_counter,
            direction = ?st.direction,
            "Scan continued"
        );
        Ok(())
    }

    /// Acquire one line, or end the scan if a stop was requested.
    pub async fn step_line(&self) -> AppResult<LineStatus> {
        let (fast, slow, direction, steps) = {
            let st = self.inner.lock().await;
            if !st.module.is_locked() {
                return Ok(LineStatus::Idle);
            }
            (
                st.scan_axes.fast_axis().to_string(),
                st.scan_axes.slow_axis().to_string(),
                st.direction,
                st.steps_per_line,
            )
        };

        if self.stop_requested.load(Ordering::SeqCst) {
            self.finish_scan(ScanEnd::Stopped).await;
            return Ok(LineStatus::Stopped);
        }

        let counts = match self.step_and_count(&fast, direction, steps).await {
            Ok(counts) => counts,
            Err(e) => {
                error!("Line failed, aborting scan: {e}");
                self.finish_scan(ScanEnd::Aborted).await;
                return Err(e);
            }
        };

        let completed = {
            let mut st = self.inner.lock().await;
            if let Err(e) = st.image.push_line(counts, direction) {
                drop(st);
                self.finish_scan(ScanEnd::Aborted).await;
                return Err(e);
            }
            let delta = direction.sign() * steps as i64;
            *st.positions.entry(fast.clone()).or_insert(0) += delta;
            st.line_counter += 1;
            st.direction = direction.reversed();
            debug!(line = st.line_counter, ?direction, "Line acquired");
            st.lines > 0 && st.line_counter >= st.lines
        };

        if let Err(e) = self.stepper.move_steps(&slow, StepDirection::Up, 1).await {
            error!(axis = %slow, "Moving the slow axis failed: {e:#}");
            self.finish_scan(ScanEnd::Aborted).await;
            return Err(StepperError::hardware("move_steps", e));
        }
        *self.inner.lock().await.positions.entry(slow).or_insert(0) += 1;

        if completed {
            self.finish_scan(ScanEnd::Completed).await;
            return Ok(LineStatus::Completed);
        }
        Ok(LineStatus::Continue)
    }

    /// Step `axis` and count one bin per step.
    ///
    /// The counter is stopped whether or not the read succeeded.
    pub async fn step_and_count(
        &self,
        axis: &str,
        direction: StepDirection,
        steps: usize,
    ) -> AppResult<Vec<u64>> {
        let frequency = self.inner.lock().await.axis(axis)?.frequency;
        if !is_valid_frequency(frequency) {
            return Err(StepperError::Configuration(format!(
                "Step frequency of axis '{axis}' must be positive and finite, got {frequency}"
            )));
        }
        let step_count = u32::try_from(steps).map_err(|_| {
            StepperError::Configuration(format!("{steps} steps exceed a single move"))
        })?;
        let line_time = Duration::try_from_secs_f64(steps as f64 / frequency).map_err(|e| {
            error!(axis, frequency, "Line time of {steps} steps is out of range: {e}");
            StepperError::Configuration(format!(
                "{steps} steps at {frequency} Hz give no usable line time"
            ))
        })?;

        self.stepper
            .move_steps(axis, direction, step_count)
            .await
            .map_err(|e| {
                error!(axis, "Moving of stepper failed: {e:#}");
                StepperError::hardware("move_steps", e)
            })?;

        self.counter.start().await.map_err(|e| {
            error!("Starting the counter failed: {e:#}");
            StepperError::hardware("start counter", e)
        })?;

        tokio::time::sleep(line_time).await;

        let counts = self.counter.fixed_counts().await;
        let stopped = self.counter.stop().await;

        match (counts, stopped) {
            (Err(e), _) => {
                error!("The readout of the counter failed: {e:#}");
                Err(StepperError::hardware("fixed_counts", e))
            }
            (Ok(counts), _) if counts.len() != steps => {
                error!(
                    "Counter returned {} bins for {steps} steps",
                    counts.len()
                );
                Err(StepperError::CountMismatch {
                    expected: steps,
                    received: counts.len(),
                })
            }
            (Ok(_), Err(e)) => {
                error!("Stopping the counter failed: {e:#}");
                Err(StepperError::hardware("stop counter", e))
            }
            (Ok(counts), Ok(())) => Ok(counts),
        }
    }

    /// Run lines until stopped or the configured number of lines is reached.
    #[instrument(skip(self))]
    pub async fn run_scan(&self) -> AppResult<ScanOutcome> {
        loop {
            match self.step_line().await? {
                LineStatus::Continue => {}
                LineStatus::Stopped => return Ok(ScanOutcome::Stopped),
                LineStatus::Completed => return Ok(ScanOutcome::Completed),
                LineStatus::Idle => {
                    return Err(StepperError::NotReady("no scan is running".to_string()))
                }
            }
        }
    }

    /// Start a fresh scan, then run its lines on a tokio task.
    ///
    /// The scan is `Locked` once this returns, so a following `stop_stepper` always
    /// reaches it.
    pub async fn spawn_scan(self: &Arc<Self>) -> AppResult<JoinHandle<AppResult<ScanOutcome>>> {
        self.start_stepper().await?;
        Ok(self.spawn_lines())
    }

    /// Continue a stopped scan, then run its lines on a tokio task.
    pub async fn spawn_continue(
        self: &Arc<Self>,
    ) -> AppResult<JoinHandle<AppResult<ScanOutcome>>> {
        self.continue_stepper().await?;
        Ok(self.spawn_lines())
    }

    fn spawn_lines(self: &Arc<Self>) -> JoinHandle<AppResult<ScanOutcome>> {
        let logic = Arc::clone(self);
        tokio::spawn(async move { logic.run_scan().await })
    }

    /// Close the counter and clock and release the counter lock.
    ///
    /// Every step is attempted; failures are logged.
    pub async fn kill_counter(&self) {
        if let Err(e) = self.counter.close_counter().await {
            error!("Closing the counter failed: {e:#}");
        }
        if let Err(e) = self.counter.close_clock().await {
            error!("Closing the counter clock failed: {e:#}");
        }
        if let Err(e) = self.counter.unlock().await {
            error!("Unlocking the counter failed: {e:#}");
        }
    }

    /// Move axes to absolute open-loop step positions.
    #[instrument(skip(self))]
    pub async fn move_to_position(&self, targets: &[(&str, i64)]) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        info!(
            "Positions of an open-loop stepper are step counts from where it started, not distances"
        );

        let mut moved = false;
        for &(axis, target) in targets {
            let current = st.positions.get(axis).copied().ok_or_else(|| {
                error!("Axis '{axis}' is not defined for the stepper hardware");
                StepperError::UnknownAxis(axis.to_string())
            })?;
            if current == target {
                continue;
            }

            self.reconcile_amplitude(&st, axis).await.map_err(|e| {
                error!(axis, "Amplitude could not be verified, move aborted: {e}");
                e
            })?;
            self.reconcile_frequency(&st, axis).await.map_err(|e| {
                error!(axis, "Frequency could not be verified, move aborted: {e}");
                e
            })?;

            let delta = target - current;
            let direction = if delta < 0 {
                StepDirection::Down
            } else {
                StepDirection::Up
            };
            let steps = u32::try_from(delta.unsigned_abs()).map_err(|_| {
                StepperError::Configuration(format!("{delta} steps exceed a single move"))
            })?;
            self.stepper
                .move_steps(axis, direction, steps)
                .await
                .map_err(|e| StepperError::hardware("move_steps", e))?;

            st.positions.insert(axis.to_string(), target);
            moved = true;
            debug!(axis, target, "Moved to position");
        }

        if !moved {
            warn!("No movement was defined or necessary");
        }
        Ok(())
    }

    /// Tracked open-loop step position of every axis.
    pub async fn position(&self) -> BTreeMap<String, i64> {
        self.inner.lock().await.positions.clone()
    }

    /// Discard the current image and reset line bookkeeping.
    pub async fn initialize_image(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        st.image = ScanImage::new(st.steps_per_line, st.lines);
        st.line_counter = 0;
        st.direction = StepDirection::Up;
        st.can_continue = false;
        Ok(())
    }

    /// Hand the history entry under the cursor to the data sink.
    pub async fn save_scan_data(&self) -> AppResult<()> {
        let entry = self
            .inner
            .lock()
            .await
            .history
            .current()
            .cloned()
            .ok_or_else(|| StepperError::NotReady("no finished scan to save".to_string()))?;
        self.sink
            .save(&entry)
            .await
            .map_err(|e| StepperError::hardware("save", e))?;
        info!(id = %entry.id, lines = entry.line_counter, "Scan saved");
        Ok(())
    }

    /// Restore the previous scan from history.
    pub async fn history_back(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        let entry = st.history.back()?.clone();
        restore(&mut st, entry);
        Ok(())
    }

    /// Restore the next scan from history.
    pub async fn history_forward(&self) -> AppResult<()> {
        let mut st = self.inner.lock().await;
        st.module.ensure_idle()?;
        let entry = st.history.forward()?.clone();
        restore(&mut st, entry);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current module state
    pub async fn state(&self) -> ModuleState {
        self.inner.lock().await.module
    }

    /// Whether a stop has been requested and not yet handled
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Lines acquired in the current scan
    pub async fn line_counter(&self) -> usize {
        self.inner.lock().await.line_counter
    }

    /// Direction of the next line
    pub async fn direction(&self) -> StepDirection {
        self.inner.lock().await.direction
    }

    /// Copy of the current image
    pub async fn image(&self) -> ScanImage {
        self.inner.lock().await.image.clone()
    }

    /// Selected scan axes
    pub async fn scan_axes(&self) -> ScanAxes {
        self.inner.lock().await.scan_axes.clone()
    }

    /// Steps per line
    pub async fn steps_per_line(&self) -> usize {
        self.inner.lock().await.steps_per_line
    }

    /// Lines per scan
    pub async fn lines(&self) -> usize {
        self.inner.lock().await.lines
    }

    /// Stored settings of an axis
    pub async fn axis_settings(&self, axis: &str) -> AppResult<AxisSettings> {
        self.inner.lock().await.axis(axis).copied()
    }

    /// Number of scans in history and the cursor position
    pub async fn history_position(&self) -> (usize, usize) {
        let st = self.inner.lock().await;
        (st.history.index(), st.history.len())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn apply_mode(&self, st: &mut LogicState, axis: &str, mode: AxisMode) -> AppResult<()> {
        st.axis_mut(axis)?.mode = mode;
        self.stepper.set_axis_mode(axis, mode).await.map_err(|e| {
            error!(axis, %mode, "Setting the axis mode failed: {e:#}");
            StepperError::hardware("set_axis_mode", e)
        })
    }

    async fn reconcile_frequency(&self, st: &LogicState, axis: &str) -> AppResult<()> {
        let stored = st.axis(axis)?.frequency;
        let actual = self
            .stepper
            .step_frequency(axis)
            .await
            .map_err(|e| StepperError::hardware("step_frequency", e))?;
        if differs(actual, stored) {
            warn!(
                axis,
                device = actual,
                stored,
                "Stepper frequency differs from stored value, rewriting"
            );
            self.stepper
                .set_step_frequency(axis, stored)
                .await
                .map_err(|e| StepperError::hardware("set_step_frequency", e))?;
        }
        Ok(())
    }

    async fn reconcile_amplitude(&self, st: &LogicState, axis: &str) -> AppResult<()> {
        let stored = st.axis(axis)?.amplitude;
        let actual = self
            .stepper
            .step_amplitude(axis)
            .await
            .map_err(|e| StepperError::hardware("step_amplitude", e))?;
        if differs(actual, stored) {
            warn!(
                axis,
                device = actual,
                stored,
                "Stepper amplitude differs from stored value, rewriting"
            );
            self.stepper
                .set_step_amplitude(axis, stored)
                .await
                .map_err(|e| StepperError::hardware("set_step_amplitude", e))?;
        }
        Ok(())
    }

    /// Reconcile both scan axes, arm the counter, switch to stepping mode and lock
    /// the stepper. Undoes what was set up if any step fails.
    async fn prepare_hardware(&self, st: &mut LogicState) -> AppResult<()> {
        let fast = st.scan_axes.fast_axis().to_string();
        let slow = st.scan_axes.slow_axis().to_string();

        // second pass verifies the writes of the first
        for _ in 0..2 {
            for axis in [&fast, &slow] {
                self.reconcile_frequency(st, axis).await?;
                self.reconcile_amplitude(st, axis).await?;
            }
        }

        let clock = match st.clock_frequency {
            Some(clock) => clock,
            None => st.axis(&fast)?.frequency,
        };

        self.counter.lock().await.map_err(|e| {
            error!("Locking the counter failed: {e:#}");
            StepperError::hardware("lock counter", e)
        })?;
        if let Err(e) = self.counter.set_up_clock(clock).await {
            error!("Setting up the counter clock failed: {e:#}");
            if let Err(e) = self.counter.unlock().await {
                error!("Unlocking the counter failed: {e:#}");
            }
            return Err(StepperError::hardware("set_up_clock", e));
        }

        if let Err(e) = self.counter.set_up_counter(st.steps_per_line).await {
            error!("Setting up the counter failed: {e:#}");
            if let Err(e) = self.counter.close_clock().await {
                error!("Closing the counter clock failed: {e:#}");
            }
            if let Err(e) = self.counter.unlock().await {
                error!("Unlocking the counter failed: {e:#}");
            }
            return Err(StepperError::hardware("set_up_counter", e));
        }

        let modes = match self.apply_mode(st, &fast, AxisMode::Stepping).await {
            Ok(()) => self.apply_mode(st, &slow, AxisMode::Stepping).await,
            Err(e) => Err(e),
        };
        if let Err(e) = modes {
            self.ground_after_failure(st, [&fast, &slow]).await;
            self.kill_counter().await;
            return Err(e);
        }

        if let Err(e) = self.stepper.lock().await {
            error!("Locking the stepper failed: {e:#}");
            self.ground_after_failure(st, [&fast, &slow]).await;
            self.kill_counter().await;
            return Err(StepperError::hardware("lock stepper", e));
        }

        Ok(())
    }

    async fn ground_after_failure(&self, st: &mut LogicState, axes: [&String; 2]) {
        for axis in axes {
            if let Err(e) = self.apply_mode(st, axis, AxisMode::Ground).await {
                warn!(axis = %axis, "Could not ground axis after failed start: {e}");
            }
        }
    }

    /// Release the hardware, leave `Locked` and record the scan in history.
    async fn finish_scan(&self, end: ScanEnd) {
        self.kill_counter().await;
        if let Err(e) = self.stepper.unlock().await {
            error!("Unlocking the stepper failed: {e:#}");
        }

        let mut st = self.inner.lock().await;
        st.module.unlock();
        self.stop_requested.store(false, Ordering::SeqCst);
        st.can_continue = end != ScanEnd::Completed;
        let entry = st.snapshot(end == ScanEnd::Completed);
        st.history.push(entry);

        match end {
            ScanEnd::Stopped => info!(lines = st.line_counter, "Scan stopped"),
            ScanEnd::Completed => info!(lines = st.line_counter, "Scan completed"),
            ScanEnd::Aborted => warn!(lines = st.line_counter, "Scan aborted"),
        }
    }
}

fn restore(st: &mut LogicState, entry: HistoryEntry) {
    st.scan_axes = entry.axes;
    st.steps_per_line = entry.steps_per_line;
    st.line_counter = entry.line_counter;
    st.direction = entry.direction;
    st.image = entry.image;
    for (axis, settings) in entry.settings {
        if let Some(current) = st.settings.get_mut(&axis) {
            current.frequency = settings.frequency;
            current.amplitude = settings.amplitude;
        }
    }
    st.can_continue = false;
}

/// Usable as a step or clock rate.
fn is_valid_frequency(frequency: f64) -> bool {
    frequency.is_finite() && frequency > 0.0
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > 1e-9 * a.abs().max(b.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{
        CounterCall, ErrorConfig, ErrorScenario, MemorySink, MockCounter, MockStepper,
        StepperCall,
    };

    struct Rig {
        logic: ConfocalStepperLogic,
        stepper: Arc<MockStepper>,
        counter: Arc<MockCounter>,
    }

    async fn rig(steps: usize, lines: usize) -> Rig {
        rig_with(MockStepper::new(&["x", "y", "z"]), MockCounter::default(), steps, lines).await
    }

    async fn rig_with(stepper: MockStepper, counter: MockCounter, steps: usize, lines: usize) -> Rig {
        let mut config = StepperConfig::default();
        config.scan.steps_per_line = steps;
        config.scan.lines = lines;
        let stepper = Arc::new(stepper);
        let counter = Arc::new(counter);
        let logic = ConfocalStepperLogic::new(
            &config,
            stepper.clone(),
            counter.clone(),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        logic.initialize().await.unwrap();
        // fast lines for tests
        logic.set_stepper_frequency("z", 1000.0).await.unwrap();
        Rig {
            logic,
            stepper,
            counter,
        }
    }

    #[tokio::test]
    async fn test_initialize_reads_axes() {
        let rig = rig(4, 2).await;
        let axes = rig.logic.stepper_axes().await.unwrap();
        assert_eq!(axes, vec!["x", "y", "z"]);

        let x = rig.logic.axis_settings("x").await.unwrap();
        assert_eq!(x.frequency, 100.0);
        assert_eq!(x.amplitude, 30.0);
        assert_eq!(x.mode, AxisMode::Ground);
        assert!(matches!(
            rig.logic.axis_settings("q").await,
            Err(StepperError::UnknownAxis(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_defaults() {
        let stepper = MockStepper::new(&["x", "z"]).with_errors(ErrorConfig::scenario(
            ErrorScenario::Always {
                operation: "step_amplitude",
            },
        ));
        let mut config = StepperConfig::default();
        config.axis_defaults.amplitude = 12.5;
        let logic = ConfocalStepperLogic::new(
            &config,
            Arc::new(stepper),
            Arc::new(MockCounter::default()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        logic.initialize().await.unwrap();
        assert_eq!(logic.axis_settings("x").await.unwrap().amplitude, 12.5);
        // getter falls back to the stored value
        assert_eq!(logic.stepper_amplitude("x").await.unwrap(), 12.5);
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let logic = ConfocalStepperLogic::new(
            &StepperConfig::default(),
            Arc::new(MockStepper::new(&["x", "z"])),
            Arc::new(MockCounter::default()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        assert!(matches!(
            logic.start_stepper().await,
            Err(StepperError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_start_arms_counter_at_fast_axis_frequency() {
        let rig = rig(4, 2).await;
        rig.logic.start_stepper().await.unwrap();

        assert_eq!(rig.logic.state().await, ModuleState::Locked);
        assert!(rig.stepper.locked());
        assert!(rig.counter.locked());
        assert_eq!(
            rig.counter.calls().await,
            vec![
                CounterCall::Lock,
                CounterCall::SetUpClock(1000.0),
                CounterCall::SetUpCounter(4),
            ]
        );
        assert_eq!(rig.stepper.mode_of("x").await, Some(AxisMode::Stepping));
        assert_eq!(rig.stepper.mode_of("z").await, Some(AxisMode::Stepping));
        assert_eq!(rig.stepper.mode_of("y").await, Some(AxisMode::Ground));
    }

    #[tokio::test]
    async fn test_clock_override() {
        let rig = rig(4, 2).await;
        rig.logic.set_clock_frequency(Some(250.0)).await.unwrap();
        rig.logic.start_stepper().await.unwrap();
        assert!(rig
            .counter
            .calls()
            .await
            .contains(&CounterCall::SetUpClock(250.0)));
    }

    #[tokio::test]
    async fn test_clock_override_cleared() {
        let rig = rig(4, 2).await;
        rig.logic.set_clock_frequency(Some(250.0)).await.unwrap();
        rig.logic.set_clock_frequency(None).await.unwrap();
        rig.logic.start_stepper().await.unwrap();

        let calls = rig.counter.calls().await;
        assert!(calls.contains(&CounterCall::SetUpClock(1000.0)));
        assert!(!calls.contains(&CounterCall::SetUpClock(250.0)));
    }

    #[tokio::test]
    async fn test_clock_override_rejects_unusable_rates() {
        let rig = rig(4, 2).await;
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                rig.logic.set_clock_frequency(Some(bad)).await,
                Err(StepperError::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_busy() {
        let rig = rig(4, 2).await;
        rig.logic.start_stepper().await.unwrap();
        assert!(matches!(
            rig.logic.start_stepper().await,
            Err(StepperError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_start_with_unknown_axis() {
        let rig = rig(4, 2).await;
        rig.logic
            .set_scan_axes(ScanAxes::new("x", "w", false))
            .await
            .unwrap();
        assert!(matches!(
            rig.logic.start_stepper().await,
            Err(StepperError::UnknownAxis(axis)) if axis == "w"
        ));
        assert_eq!(rig.logic.state().await, ModuleState::Idle);
        assert!(!rig.counter.locked());
    }

    #[tokio::test]
    async fn test_full_scan_alternates_direction() {
        let rig = rig(3, 3).await;
        rig.logic.start_stepper().await.unwrap();
        let outcome = rig.logic.run_scan().await.unwrap();
        assert_eq!(outcome, ScanOutcome::Completed);

        let z_moves: Vec<_> = rig
            .stepper
            .moves()
            .await
            .into_iter()
            .filter(|(axis, _, _)| axis == "z")
            .map(|(_, direction, steps)| (direction, steps))
            .collect();
        assert_eq!(
            z_moves,
            vec![
                (StepDirection::Up, 3),
                (StepDirection::Down, 3),
                (StepDirection::Up, 3),
            ]
        );

        let image = rig.logic.image().await;
        assert_eq!(image.row(0), Some(&[0, 1, 2][..]));
        assert_eq!(image.row(1), Some(&[2, 1, 0][..]));
        assert_eq!(image.row(2), Some(&[0, 1, 2][..]));

        assert_eq!(rig.logic.line_counter().await, 3);
        assert_eq!(rig.logic.state().await, ModuleState::Idle);
        assert_eq!(rig.stepper.step_position("x").await, Some(3));
        assert_eq!(rig.stepper.step_position("z").await, Some(3));
        assert_eq!(rig.logic.position().await.get("x"), Some(&3));
        assert_eq!(rig.logic.position().await.get("z"), Some(&3));
    }

    #[tokio::test]
    async fn test_step_line_when_idle() {
        let rig = rig(3, 3).await;
        assert_eq!(rig.logic.step_line().await.unwrap(), LineStatus::Idle);
        assert!(matches!(
            rig.logic.run_scan().await,
            Err(StepperError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_step_and_count_stops_counter_after_read_failure() {
        let counter = MockCounter::default().with_errors(ErrorConfig::scenario(
            ErrorScenario::Always {
                operation: "fixed_counts",
            },
        ));
        let rig = rig_with(MockStepper::new(&["x", "z"]), counter, 3, 0).await;
        rig.logic.start_stepper().await.unwrap();

        let err = rig
            .logic
            .step_and_count("z", StepDirection::Up, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StepperError::Hardware { operation: "fixed_counts", .. }));
        assert_eq!(rig.counter.calls().await.last(), Some(&CounterCall::Stop));
    }

    #[tokio::test]
    async fn test_stop_failure_fails_line() {
        let counter = MockCounter::default().with_errors(ErrorConfig::scenario(
            ErrorScenario::Always { operation: "stop" },
        ));
        let rig = rig_with(MockStepper::new(&["x", "z"]), counter, 3, 0).await;
        rig.logic.start_stepper().await.unwrap();
        assert!(rig.logic.step_line().await.is_err());
        assert_eq!(rig.logic.state().await, ModuleState::Idle);
    }

    #[tokio::test]
    async fn test_setters_rejected_while_locked() {
        let rig = rig(3, 0).await;
        rig.logic.start_stepper().await.unwrap();

        assert!(matches!(
            rig.logic.set_stepper_frequency("x", 500.0).await,
            Err(StepperError::Busy)
        ));
        assert!(matches!(
            rig.logic.set_stepper_amplitude("x", 10.0).await,
            Err(StepperError::Busy)
        ));
        assert!(matches!(rig.logic.set_lines(4).await, Err(StepperError::Busy)));
        assert!(matches!(
            rig.logic.set_mode_ground("x").await,
            Err(StepperError::Busy)
        ));
        assert!(matches!(
            rig.logic.move_to_position(&[("x", 5)]).await,
            Err(StepperError::Busy)
        ));
        // stored value untouched
        assert_eq!(rig.logic.axis_settings("x").await.unwrap().frequency, 100.0);
    }

    #[tokio::test]
    async fn test_check_frequency_rewrites_mismatch() {
        let rig = rig(3, 0).await;
        rig.stepper.set_device_frequency("x", 42.0).await;
        rig.logic.check_frequency("x").await.unwrap();
        assert!(rig.stepper.calls().await.contains(&StepperCall::SetFrequency {
            axis: "x".to_string(),
            frequency: 100.0,
        }));
        assert_eq!(rig.logic.stepper_frequency("x").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_check_amplitude_leaves_matching_value() {
        let rig = rig(3, 0).await;
        let before = rig.stepper.calls().await.len();
        rig.logic.check_amplitude("x").await.unwrap();
        assert_eq!(rig.stepper.calls().await.len(), before);
    }

    #[tokio::test]
    async fn test_kill_counter_attempts_every_step() {
        let counter = MockCounter::default().with_errors(ErrorConfig::scenarios(vec![
            ErrorScenario::Always {
                operation: "close_counter",
            },
            ErrorScenario::Always {
                operation: "close_clock",
            },
        ]));
        let rig = rig_with(MockStepper::new(&["x", "z"]), counter, 3, 0).await;
        rig.logic.start_stepper().await.unwrap();
        rig.logic.kill_counter().await;
        assert!(!rig.counter.locked());
    }

    #[test]
    fn test_valid_frequency() {
        assert!(is_valid_frequency(1e-300));
        assert!(is_valid_frequency(100.0));
        assert!(!is_valid_frequency(0.0));
        assert!(!is_valid_frequency(-1.0));
        assert!(!is_valid_frequency(f64::NAN));
        assert!(!is_valid_frequency(f64::INFINITY));
    }

    #[test]
    fn test_differs() {
        assert!(!differs(100.0, 100.0));
        assert!(!differs(0.0, 0.0));
        assert!(differs(100.0, 101.0));
        assert!(differs(0.0, 0.5));
    }
}
