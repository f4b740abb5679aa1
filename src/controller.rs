//! Presentation-facing facade over the driver, planner and executor.
//!
//! [`PumpController`] owns the driver between runs. Starting a run moves the
//! driver into the run task together with a frozen copy of the sequence; the
//! driver comes back through [`PumpController::finish_run`]. While it is away,
//! manual commands and connection changes are refused with
//! [`PumpError::RunInProgress`], so only one writer ever talks to the pump.
//!
//! ```no_run
//! use minipuls_control::config::Settings;
//! use minipuls_control::controller::PumpController;
//! use minipuls_control::sequence::store;
//!
//! # async fn demo() -> minipuls_control::error::AppResult<()> {
//! let settings = Settings::load()?;
//! let mut pump = PumpController::new(&settings);
//! pump.connect().await?;
//!
//! let sequence = store::load("run.json")?;
//! let mut progress = pump.subscribe_progress();
//! let handle = pump.start_run(&sequence)?;
//! while let Ok(report) = progress.recv().await {
//!     println!("{} {}", handle.id(), report.clock_label());
//!     if report.is_final {
//!         break;
//!     }
//! }
//! let outcome = pump.finish_run().await?;
//! pump.disconnect().await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SerialConfig, Settings, TimingConfig};
use crate::error::{AppResult, PumpError};
use crate::executor::{self, CancelSignal, RunOutcome};
use crate::hardware::minipuls::{CommandInterval, MinipulsDriver, MAX_RPM, MIN_RPM};
use crate::hardware::transport::Transport;
use crate::plan::{self, Timeline};
use crate::progress::{ProgressMonitor, ProgressReport, RuntimeState};
use crate::sequence::{Direction, Sequence};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Caller's view of a started run.
#[derive(Clone, Debug)]
pub struct RunHandle {
    id: Uuid,
    cancel: CancelSignal,
    timeline: Arc<Timeline>,
}

impl RunHandle {
    /// Unique id, used in log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Timeline frozen at run start.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Request cancellation of this run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type RunTask = JoinHandle<(MinipulsDriver, AppResult<RunOutcome>)>;

struct ActiveRun {
    handle: RunHandle,
    task: RunTask,
    monitor: JoinHandle<ProgressReport>,
}

/// Single-pump controller.
pub struct PumpController {
    serial: SerialConfig,
    timing: TimingConfig,
    driver: Option<MinipulsDriver>,
    interval: CommandInterval,
    state: RuntimeState,
    progress_tx: broadcast::Sender<ProgressReport>,
    active: Option<ActiveRun>,
}

impl PumpController {
    /// Controller with a driver built from `settings`.
    pub fn new(settings: &Settings) -> Self {
        let driver = MinipulsDriver::from_config(&settings.serial, &settings.timing);
        Self::with_driver(driver, settings)
    }

    /// Controller around an existing driver.
    pub fn with_driver(driver: MinipulsDriver, settings: &Settings) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            serial: settings.serial.clone(),
            timing: settings.timing.clone(),
            interval: driver.interval_handle(),
            driver: Some(driver),
            state: RuntimeState::new(),
            progress_tx,
            active: None,
        }
    }

    /// The driver, unless a run holds it.
    pub fn driver(&self) -> Option<&MinipulsDriver> {
        self.driver.as_ref()
    }

    /// Whether the pump is connected. A running sequence counts as connected.
    pub fn is_connected(&self) -> bool {
        match &self.driver {
            Some(driver) => driver.is_connected(),
            None => self.active.is_some(),
        }
    }

    /// Whether a run has been started and not yet reclaimed.
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the active run task has ended and awaits [`Self::finish_run`].
    pub fn run_finished(&self) -> bool {
        self.active
            .as_ref()
            .map(|run| run.task.is_finished())
            .unwrap_or(false)
    }

    /// Shared state of the current (or last) run.
    pub fn runtime_state(&self) -> RuntimeState {
        self.state.clone()
    }

    fn driver_mut(&mut self) -> AppResult<&mut MinipulsDriver> {
        if self.active.is_some() {
            return Err(PumpError::RunInProgress);
        }
        self.driver.as_mut().ok_or(PumpError::RunInProgress)
    }

    /// Connect and switch the pump to remote control.
    pub async fn connect(&mut self) -> AppResult<()> {
        let driver = self.driver_mut()?;
        driver.connect().await?;
        driver.set_remote_mode().await
    }

    /// Connect over an already opened transport and switch to remote control.
    pub async fn connect_via(&mut self, transport: Box<dyn Transport>) -> AppResult<()> {
        let driver = self.driver_mut()?;
        driver.connect_via(transport).await?;
        driver.set_remote_mode().await
    }

    /// Return the pump to keypad control and release the bus.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        let driver = self.driver_mut()?;
        if driver.is_connected() {
            if let Err(e) = driver.set_keypad_mode().await {
                warn!("Could not restore keypad mode: {}", e);
            }
        }
        driver.disconnect().await
    }

    fn check_manual_rpm(rpm: f64) -> AppResult<()> {
        if rpm.is_finite() && (MIN_RPM..=MAX_RPM).contains(&rpm) {
            Ok(())
        } else {
            Err(PumpError::InputValidation(format!(
                "RPM must be {}-{}, got {}",
                MIN_RPM, MAX_RPM, rpm
            )))
        }
    }

    /// Set `rpm` and start turning in `direction`.
    pub async fn manual_start(&mut self, direction: Direction, rpm: f64) -> AppResult<()> {
        Self::check_manual_rpm(rpm)?;
        let driver = self.driver_mut()?;
        info!(%direction, rpm, "Manual start");
        driver.set_speed(rpm, true).await?;
        match direction {
            Direction::Forward => driver.start_forward().await,
            Direction::Backward => driver.start_backward().await,
        }
    }

    /// Stop the pump outside a run.
    pub async fn manual_stop(&mut self) -> AppResult<()> {
        let driver = self.driver_mut()?;
        info!("Manual stop");
        driver.stop().await
    }

    /// Current command interval.
    pub fn command_interval(&self) -> Duration {
        self.interval.get()
    }

    /// Change the command interval, also while a run is active.
    pub fn set_command_interval(&self, seconds: f64) -> AppResult<Duration> {
        self.interval.set_secs(seconds)
    }

    /// Preview `sequence`.
    ///
    /// Ramps are sampled at the command interval once connected, otherwise at
    /// the configured default ramp interval.
    pub fn compute_timeline(&self, sequence: &Sequence) -> Timeline {
        let ramp_interval = if self.is_connected() {
            self.interval.get()
        } else {
            self.timing.default_ramp_interval()
        };
        plan::expand(sequence, ramp_interval, self.timing.max_iterations)
    }

    /// Start executing a copy of `sequence` in the background.
    ///
    /// # Errors
    /// [`PumpError::RunInProgress`], [`PumpError::EmptySequence`] or
    /// [`PumpError::NotConnected`].
    pub fn start_run(&mut self, sequence: &Sequence) -> AppResult<RunHandle> {
        if self.active.is_some() {
            return Err(PumpError::RunInProgress);
        }
        let driver_ref = self.driver.as_ref().ok_or(PumpError::RunInProgress)?;
        executor::check_ready(driver_ref, sequence)?;

        let timeline = Arc::new(self.compute_timeline(sequence));
        let frozen = sequence.clone();
        let mut driver = self.driver.take().ok_or(PumpError::RunInProgress)?;
        let handle = RunHandle {
            id: Uuid::new_v4(),
            cancel: CancelSignal::new(),
            timeline: timeline.clone(),
        };

        self.state.begin(timeline.total_duration());
        let monitor = ProgressMonitor::new(
            timeline,
            frozen.len(),
            self.state.clone(),
            self.progress_tx.clone(),
            self.timing.monitor_interval(),
        );
        let (monitor_stop_tx, monitor_stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor.run(monitor_stop_rx));

        let state = self.state.clone();
        let cancel = handle.cancel.clone();
        let run_id = handle.id;
        let task = tokio::spawn(async move {
            let result = executor::run_sequence(&mut driver, &frozen, &state, &cancel).await;
            state.finish();
            let _ = monitor_stop_tx.send(());
            if let Ok(outcome) = &result {
                info!(%run_id, status = ?outcome.status, "Run ended");
            }
            (driver, result)
        });

        info!(run_id = %handle.id, steps = sequence.len(), "Run started");
        self.active = Some(ActiveRun {
            handle: handle.clone(),
            task,
            monitor,
        });
        Ok(handle)
    }

    /// Request cancellation of the active run.
    pub fn cancel_run(&self) -> AppResult<()> {
        let run = self.active.as_ref().ok_or(PumpError::NoActiveRun)?;
        info!(run_id = %run.handle.id, "Cancelling run");
        run.handle.cancel();
        Ok(())
    }

    /// Wait for the active run to end and take the driver back.
    pub async fn finish_run(&mut self) -> AppResult<RunOutcome> {
        let run = self.active.take().ok_or(PumpError::NoActiveRun)?;
        let joined = run.task.await;
        if let Err(e) = run.monitor.await {
            warn!("Progress monitor ended abnormally: {}", e);
        }

        match joined {
            Ok((driver, result)) => {
                self.driver = Some(driver);
                result
            }
            Err(e) => {
                // the driver went down with the task; start over disconnected
                error!(run_id = %run.handle.id, "Run task ended abnormally: {}", e);
                self.state.finish();
                let driver = MinipulsDriver::from_config(&self.serial, &self.timing)
                    .with_command_interval(self.interval.get());
                self.interval = driver.interval_handle();
                self.driver = Some(driver);
                Err(PumpError::Transport(format!("run task ended abnormally: {}", e)))
            }
        }
    }

    /// Receiver of progress reports for every run started afterwards.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressReport> {
        self.progress_tx.subscribe()
    }

    /// [`Self::subscribe_progress`] as a `Stream`.
    pub fn progress_stream(&self) -> BroadcastStream<ProgressReport> {
        BroadcastStream::new(self.subscribe_progress())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunStatus;
    use crate::hardware::mock::MockTransport;
    use crate::sequence::{DurationUnit, Phase};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.serial.simulate = true;
        settings.timing.command_interval_s = 0.1;
        settings
    }

    fn one_phase() -> Sequence {
        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 10.0, 5.0, DurationUnit::Seconds).unwrap());
        seq
    }

    async fn mock_controller() -> (PumpController, MockTransport) {
        let bus = MockTransport::new();
        let driver = MinipulsDriver::new("mock", 30, 19200)
            .with_command_interval(Duration::from_millis(100));
        let mut pump = PumpController::with_driver(driver, &settings());
        pump.connect_via(Box::new(bus.clone())).await.unwrap();
        (pump, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sets_remote_and_disconnect_restores_keypad() {
        let (mut pump, bus) = mock_controller().await;
        assert!(pump.is_connected());
        pump.disconnect().await.unwrap();

        assert_eq!(bus.commands(), vec!["SR", "SK"]);
        assert!(!pump.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_control() {
        let (mut pump, bus) = mock_controller().await;
        pump.manual_start(Direction::Backward, 7.5).await.unwrap();
        pump.manual_stop().await.unwrap();
        assert!(pump.manual_start(Direction::Forward, 50.0).await.is_err());

        assert_eq!(bus.commands(), vec!["SR", "R750", "K<", "KH"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_rejected_during_run() {
        let (mut pump, _bus) = mock_controller().await;
        pump.start_run(&one_phase()).unwrap();

        assert!(matches!(pump.manual_stop().await, Err(PumpError::RunInProgress)));
        assert!(matches!(pump.start_run(&one_phase()), Err(PumpError::RunInProgress)));
        assert!(matches!(pump.disconnect().await, Err(PumpError::RunInProgress)));
        assert!(pump.is_connected());

        let outcome = pump.finish_run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        pump.manual_stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_lifecycle_with_progress() {
        let (mut pump, bus) = mock_controller().await;
        let mut progress = pump.subscribe_progress();
        let handle = pump.start_run(&one_phase()).unwrap();
        assert_eq!(handle.timeline().total_duration(), 5.0);
        assert!(!pump.run_finished());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(pump.run_finished());
        assert!(!pump.runtime_state().is_active());
        assert_eq!(pump.runtime_state().current_step(), 1);

        let outcome = pump.finish_run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(pump.driver().is_some());
        assert_eq!(bus.commands(), vec!["SR", "K>", "R1000", "KH"]);

        let mut last = None;
        while let Ok(report) = progress.try_recv() {
            last = Some(report);
        }
        let last = last.unwrap();
        assert!(last.is_final);
        assert_eq!(last.step, 1);
        assert_eq!(last.elapsed, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run() {
        let (mut pump, bus) = mock_controller().await;
        assert!(matches!(pump.cancel_run(), Err(PumpError::NoActiveRun)));

        let handle = pump.start_run(&one_phase()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        pump.cancel_run().unwrap();
        assert!(handle.is_cancelled());

        let outcome = pump.finish_run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.elapsed, Duration::from_secs(1));
        assert!(!bus.commands().contains(&"KH".to_string()));
        assert!(matches!(pump.finish_run().await, Err(PumpError::NoActiveRun)));
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let mut pump = PumpController::new(&settings());
        assert!(matches!(pump.start_run(&one_phase()), Err(PumpError::NotConnected)));
        pump.connect().await.unwrap();
        assert!(matches!(pump.start_run(&Sequence::new()), Err(PumpError::EmptySequence)));
        assert!(!pump.is_running());
    }

    #[test]
    fn test_preview_interval_follows_connection() {
        let mut seq = Sequence::new();
        seq.push(Phase::ramp(Direction::Forward, 10.0, 1.0, DurationUnit::Seconds).unwrap());
        let mut settings = settings();
        settings.timing.default_ramp_interval_s = 0.5;
        let pump = PumpController::new(&settings);

        // disconnected: default ramp interval, 2 sub-steps plus the origin
        assert_eq!(pump.compute_timeline(&seq).samples.len(), 3);
        pump.set_command_interval(0.25).unwrap();
        assert_eq!(pump.command_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_unrepresentable_interval_rejected() {
        let pump = PumpController::new(&settings());
        assert!(matches!(
            pump.set_command_interval(1e30),
            Err(PumpError::InputValidation(_))
        ));
        assert_eq!(pump.command_interval(), Duration::from_millis(100));

        let mut settings = settings();
        settings.timing.default_ramp_interval_s = 1e30;
        let mut seq = Sequence::new();
        seq.push(Phase::ramp(Direction::Forward, 10.0, 1.0, DurationUnit::Seconds).unwrap());
        let timeline = PumpController::new(&settings).compute_timeline(&seq);
        assert_eq!(timeline.total_duration(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_task_end_rebuilds_driver() {
        let (mut pump, _bus) = mock_controller().await;
        pump.start_run(&one_phase()).unwrap();
        pump.active.as_ref().unwrap().task.abort();

        let err = pump.finish_run().await.unwrap_err();
        assert!(matches!(err, PumpError::Transport(_)));
        assert!(!pump.is_running());
        assert!(!pump.is_connected());
        assert!(pump.driver().is_some());
        assert!(!pump.runtime_state().is_active());
        assert!(matches!(pump.manual_stop().await, Err(PumpError::NotConnected)));
    }
}
