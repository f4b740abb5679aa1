//! Run progress: shared runtime state and the periodic monitor.
//!
//! The executor writes the current step into a [`RuntimeState`]; a
//! [`ProgressMonitor`] task samples it on its own cadence, looks up the planned
//! speed and direction on the frozen [`Timeline`], and broadcasts a
//! [`ProgressReport`]. The monitor never waits on the executor, so reports keep
//! flowing while the executor sleeps through a long phase.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::plan::Timeline;
use crate::sequence::Direction;

#[derive(Debug, Default)]
struct RunSnapshot {
    current_step: usize,
    run_start: Option<Instant>,
    total_secs: f64,
    last_point: Option<(f64, f64)>,
    active: bool,
}

/// State shared between the executor and the monitor of one run.
///
/// Cloning shares the state. Elapsed time is derived from the run start on
/// every read and never stored.
#[derive(Clone, Debug, Default)]
pub struct RuntimeState {
    inner: Arc<Mutex<RunSnapshot>>,
}

impl RuntimeState {
    /// Idle state, no run recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new run starting now.
    pub fn begin(&self, total_secs: f64) {
        let mut snap = self.inner.lock();
        *snap = RunSnapshot {
            current_step: 0,
            run_start: Some(Instant::now()),
            total_secs,
            last_point: None,
            active: true,
        };
    }

    /// Mark the run as over. The last step and point stay readable.
    pub fn finish(&self) {
        self.inner.lock().active = false;
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Record the 1-based step being executed.
    pub fn set_step(&self, step: usize) {
        self.inner.lock().current_step = step;
    }

    /// 1-based step of the current or last run, 0 before the first Phase.
    pub fn current_step(&self) -> usize {
        self.inner.lock().current_step
    }

    /// Clock time of [`Self::begin`].
    pub fn run_start(&self) -> Option<Instant> {
        self.inner.lock().run_start
    }

    /// Time since [`Self::begin`], zero before any run.
    pub fn elapsed(&self) -> Duration {
        self.run_start()
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Planned run length in seconds.
    pub fn total_secs(&self) -> f64 {
        self.inner.lock().total_secs
    }

    /// Remember the last reported `(time, rpm)`.
    pub fn record_point(&self, time: f64, rpm: f64) {
        self.inner.lock().last_point = Some((time, rpm));
    }

    /// Last `(time, rpm)` reported by the monitor.
    pub fn last_point(&self) -> Option<(f64, f64)> {
        self.inner.lock().last_point
    }
}

/// Snapshot of a run as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    /// 1-based step being executed
    pub step: usize,
    /// Steps in the sequence
    pub total_steps: usize,
    /// Seconds since run start, clamped to `total`
    pub elapsed: f64,
    /// Planned run length in seconds
    pub total: f64,
    /// Speed the timeline predicts at `elapsed`
    pub planned_rpm: f64,
    /// Direction the timeline predicts at `elapsed`
    pub planned_direction: Direction,
    /// Last report of the run
    pub is_final: bool,
}

fn mm_ss(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

impl ProgressReport {
    /// Completed share of the planned duration, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total <= 0.0 {
            if self.is_final { 1.0 } else { 0.0 }
        } else {
            (self.elapsed / self.total).clamp(0.0, 1.0)
        }
    }

    /// `mm:ss / mm:ss` label of elapsed against total.
    pub fn clock_label(&self) -> String {
        format!("{} / {}", mm_ss(self.elapsed), mm_ss(self.total))
    }
}

/// Periodic reporter for one run.
#[derive(Debug)]
pub struct ProgressMonitor {
    timeline: Arc<Timeline>,
    total_steps: usize,
    state: RuntimeState,
    tx: broadcast::Sender<ProgressReport>,
    cadence: Duration,
}

impl ProgressMonitor {
    /// Monitor publishing to `tx` every `cadence`.
    pub fn new(
        timeline: Arc<Timeline>,
        total_steps: usize,
        state: RuntimeState,
        tx: broadcast::Sender<ProgressReport>,
        cadence: Duration,
    ) -> Self {
        Self {
            timeline,
            total_steps,
            state,
            tx,
            cadence,
        }
    }

    /// Report for the current instant.
    pub fn snapshot(&self) -> ProgressReport {
        let total = self.timeline.total_duration();
        let elapsed = self.state.elapsed().as_secs_f64().min(total);
        ProgressReport {
            step: self.state.current_step().min(self.total_steps),
            total_steps: self.total_steps,
            elapsed,
            total,
            planned_rpm: self.timeline.speed_at(elapsed),
            planned_direction: self.timeline.direction_at(elapsed),
            is_final: false,
        }
    }

    /// Closing report, pinned to the end of the timeline.
    pub fn final_report(&self) -> ProgressReport {
        let last = self.timeline.final_sample();
        ProgressReport {
            step: self.total_steps,
            total_steps: self.total_steps,
            elapsed: last.time,
            total: self.timeline.total_duration(),
            planned_rpm: last.rpm,
            planned_direction: self.timeline.final_direction(),
            is_final: true,
        }
    }

    fn publish(&self, report: ProgressReport) {
        self.state.record_point(report.elapsed, report.planned_rpm);
        // no subscribers is fine
        let _ = self.tx.send(report);
    }

    /// Tick until `stop` fires (or its sender is dropped), then publish and
    /// return the final report.
    pub async fn run(self, mut stop: oneshot::Receiver<()>) -> ProgressReport {
        let mut ticker = tokio::time::interval(self.cadence.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let report = self.snapshot();
                    self.publish(report);
                }
            }
        }

        let report = self.final_report();
        debug!(step = report.step, "Progress monitor finished");
        self.publish(report.clone());
        report
    }
}
