//! Sequence execution against a live (or simulated) pump.
//!
//! The executor walks the sequence with the same
//! [`Interpreter`] as the plan expander and turns each
//! Phase into device commands paced by the tokio clock:
//!
//! - **Fixed**: direction, one speed command, then hold for the phase duration.
//! - **Ramp**: direction, then one interpolated speed command at the end of each
//!   sub-step. The sub-step count comes from the command interval in force when
//!   the phase starts.
//!
//! Every wait is a `select!` between its deadline and the [`CancelSignal`], so a
//! cancel request takes effect at once. After a cancel no further command is
//! sent and the pump is left as it is. A normal finish sends a stop; a Cycle
//! with out-of-range bounds aborts without one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::{AppResult, PumpError};
use crate::hardware::minipuls::MinipulsDriver;
use crate::plan::ramp_steps;
use crate::progress::RuntimeState;
use crate::sequence::interpreter::{Halt, Interpreter, StepEvent};
use crate::sequence::{Direction, Phase, Sequence, SpeedMode};

/// Stand-in deadline for waits too long for the clock (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Cooperative cancellation flag shared by a run and its owner.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Signal in the not-cancelled state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // sender lives in self; unreachable in practice
            std::future::pending::<()>().await;
        }
    }
}

/// `start + offset`, saturating far in the future instead of overflowing.
fn deadline_after(start: Instant, offset: Duration) -> Instant {
    start
        .checked_add(offset)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Sleep until `deadline`. Returns `false` if cancelled first.
async fn wait_until(deadline: Instant, cancel: &CancelSignal) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep_until(deadline) => true,
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every step ran and the pump was stopped
    Completed,
    /// Stopped on request; the pump keeps its last command
    Cancelled,
    /// A Cycle referenced steps outside the sequence
    Aborted,
    /// A device command failed
    Failed,
}

/// Result of [`run_sequence`].
#[derive(Debug)]
pub struct RunOutcome {
    /// How the run ended
    pub status: RunStatus,
    /// Last speed reached, in rpm
    pub final_rpm: f64,
    /// 1-based step the run ended on
    pub last_step: usize,
    /// Clock time from run start to the end
    pub elapsed: Duration,
    /// Cause of an Aborted or Failed run
    pub error: Option<PumpError>,
}

/// Check the preconditions of a run.
///
/// # Errors
/// [`PumpError::EmptySequence`] or [`PumpError::NotConnected`].
pub fn check_ready(driver: &MinipulsDriver, sequence: &Sequence) -> AppResult<()> {
    if sequence.is_empty() {
        return Err(PumpError::EmptySequence);
    }
    if !driver.is_connected() {
        return Err(PumpError::NotConnected);
    }
    Ok(())
}

/// Execute one Phase starting from `start_rpm`; returns the speed reached.
async fn run_phase(
    driver: &mut MinipulsDriver,
    phase: &Phase,
    start_rpm: f64,
    cancel: &CancelSignal,
) -> AppResult<f64> {
    let target = phase.rpm();
    let duration_secs = phase.duration_secs();
    let duration = phase.as_duration();
    let phase_start = Instant::now();

    match phase.direction() {
        Direction::Forward => driver.start_forward().await?,
        Direction::Backward => driver.start_backward().await?,
    }

    match phase.mode() {
        SpeedMode::Fixed => {
            driver.set_speed(target, false).await?;
            wait_until(deadline_after(phase_start, duration), cancel).await;
            Ok(target)
        }
        SpeedMode::Ramp => {
            let n = ramp_steps(duration_secs, driver.command_interval());
            for i in 1..=n {
                let fraction = i as f64 / n as f64;
                let offset =
                    Duration::try_from_secs_f64(duration_secs * fraction).unwrap_or(duration);
                if !wait_until(deadline_after(phase_start, offset), cancel).await {
                    let progressed = if duration_secs > 0.0 {
                        (phase_start.elapsed().as_secs_f64() / duration_secs).min(1.0)
                    } else {
                        1.0
                    };
                    return Ok(start_rpm + (target - start_rpm) * progressed);
                }
                driver
                    .set_speed(start_rpm + (target - start_rpm) * fraction, false)
                    .await?;
            }
            wait_until(deadline_after(phase_start, duration), cancel).await;
            Ok(target)
        }
    }
}

/// Run `sequence` on `driver` until it completes, faults, or `cancel` fires.
///
/// The current step is written to `state` as the run progresses; the caller
/// owns [`RuntimeState::begin`] and [`RuntimeState::finish`]. Device failures
/// end the run with [`RunStatus::Failed`] rather than an `Err`.
///
/// # Errors
/// Only the preconditions of [`check_ready`].
pub async fn run_sequence(
    driver: &mut MinipulsDriver,
    sequence: &Sequence,
    state: &RuntimeState,
    cancel: &CancelSignal,
) -> AppResult<RunOutcome> {
    check_ready(driver, sequence)?;

    let started = Instant::now();
    let mut interp = Interpreter::new(sequence.steps());
    let mut current_rpm = 0.0;
    let mut status = RunStatus::Completed;
    let mut failure = None;

    info!(steps = sequence.len(), unit_id = driver.unit_id(), "Sequence started");

    while let Some(event) = interp.next_event() {
        if cancel.is_cancelled() {
            status = RunStatus::Cancelled;
            break;
        }
        let step = event.index() + 1;
        state.set_step(step);

        match event {
            StepEvent::Phase { phase, .. } => {
                info!(
                    step,
                    direction = %phase.direction(),
                    mode = %phase.mode(),
                    rpm = phase.rpm(),
                    "Phase: {} {}",
                    phase.duration(),
                    phase.unit()
                );
                match run_phase(driver, phase, current_rpm, cancel).await {
                    Ok(reached) => current_rpm = reached,
                    Err(e) => {
                        error!(step, "Phase failed: {}", e);
                        status = RunStatus::Failed;
                        failure = Some(e);
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    status = RunStatus::Cancelled;
                    break;
                }
            }
            StepEvent::CycleJump {
                target, remaining, ..
            } => {
                info!(step, "Cycle: jumping to phase {} ({} repeats left)", target + 1, remaining);
            }
            StepEvent::CycleDone { .. } => {
                info!(step, "Cycle finished");
            }
        }
    }

    if status == RunStatus::Completed {
        if let Some(fault) = interp.halt().and_then(Halt::to_error) {
            error!("Sequence aborted: {}", fault);
            status = RunStatus::Aborted;
            failure = Some(fault);
        } else if let Err(e) = driver.stop().await {
            error!("Stop at end of sequence failed: {}", e);
            status = RunStatus::Failed;
            failure = Some(e);
        } else {
            info!("Sequence finished");
        }
    } else if status == RunStatus::Cancelled {
        warn!(step = state.current_step(), rpm = current_rpm, "Sequence cancelled; pump left running");
    }

    Ok(RunOutcome {
        status,
        final_rpm: current_rpm,
        last_step: state.current_step(),
        elapsed: started.elapsed(),
        error: failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;
    use crate::sequence::{Cycle, DurationUnit};
    use tracing_test::traced_test;

    async fn connected(bus: &MockTransport) -> MinipulsDriver {
        let mut driver = MinipulsDriver::new("mock", 30, 19200)
            .with_command_interval(Duration::from_millis(100));
        driver.connect_via(Box::new(bus.clone())).await.unwrap();
        bus.clear();
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_phases_and_stop() {
        let bus = MockTransport::new();
        let mut driver = connected(&bus).await;
        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 12.5, 2.0, DurationUnit::Seconds).unwrap());
        seq.push(Phase::fixed(Direction::Backward, 3.0, 1.0, DurationUnit::Seconds).unwrap());

        let outcome = run_sequence(&mut driver, &seq, &RuntimeState::new(), &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_rpm, 3.0);
        assert_eq!(outcome.last_step, 2);
        assert_eq!(outcome.elapsed, Duration::from_secs(3));
        assert_eq!(bus.commands(), vec!["K>", "R1250", "K<", "R300", "KH"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_uses_command_interval() {
        let bus = MockTransport::new();
        let mut driver = connected(&bus).await;
        driver.set_command_interval(0.25).unwrap();
        let mut seq = Sequence::new();
        seq.push(Phase::ramp(Direction::Forward, 10.0, 1.0, DurationUnit::Seconds).unwrap());

        run_sequence(&mut driver, &seq, &RuntimeState::new(), &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(bus.speed_commands(), vec![2.5, 5.0, 7.5, 10.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_ramp_reports_partial_speed() {
        let bus = MockTransport::new();
        let mut driver = connected(&bus).await;
        let mut seq = Sequence::new();
        seq.push(Phase::ramp(Direction::Forward, 40.0, 10.0, DurationUnit::Seconds).unwrap());
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2550)).await;
            trigger.cancel();
        });
        let outcome = run_sequence(&mut driver, &seq, &RuntimeState::new(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!((outcome.final_rpm - 10.2).abs() < 1e-6);
        assert_eq!(outcome.elapsed, Duration::from_millis(2550));
        assert!(!bus.commands().contains(&"KH".to_string()));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_invalid_cycle_aborts_without_stop() {
        let bus = MockTransport::new();
        let mut driver = connected(&bus).await;
        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 5.0, 1.0, DurationUnit::Seconds).unwrap());
        seq.push(Cycle::new(1, 3, 1).unwrap());

        let outcome = run_sequence(&mut driver, &seq, &RuntimeState::new(), &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(matches!(outcome.error, Some(PumpError::InvalidSequence { step: 2, .. })));
        assert_eq!(bus.commands(), vec!["K>", "R500"]);
        assert!(logs_contain("Sequence aborted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_fails_run() {
        let bus = MockTransport::new().fail_after_writes(3);
        let mut driver = MinipulsDriver::new("mock", 30, 19200);
        driver.connect_via(Box::new(bus.clone())).await.unwrap();
        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 5.0, 1.0, DurationUnit::Seconds).unwrap());

        let outcome = run_sequence(&mut driver, &seq, &RuntimeState::new(), &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(matches!(outcome.error, Some(PumpError::Transport(_))));
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn test_preconditions() {
        let mut driver = MinipulsDriver::simulated(30);
        let empty = Sequence::new();
        let state = RuntimeState::new();
        let cancel = CancelSignal::new();
        assert!(matches!(
            run_sequence(&mut driver, &empty, &state, &cancel).await,
            Err(PumpError::EmptySequence)
        ));

        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 5.0, 1.0, DurationUnit::Seconds).unwrap());
        assert!(matches!(
            run_sequence(&mut driver, &seq, &state, &cancel).await,
            Err(PumpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let cancel = CancelSignal::new();
        assert!(!cancel.is_cancelled());
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        cancel.cancel();
        task.await.unwrap();
        assert!(cancel.is_cancelled());
    }
}
