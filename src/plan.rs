//! Plan expansion: a pure, clock-free simulation of a sequence.
//!
//! [`expand`] walks the sequence with the shared
//! [`Interpreter`](crate::sequence::interpreter::Interpreter) and turns each
//! visited Phase into speed samples, a phase marker and a direction interval.
//! The result is the [`Timeline`] the operator previews before a run and the
//! progress monitor interpolates against during one.
//!
//! ## Sampling rules
//!
//! - The timeline always starts at `(0 s, 0 rpm)`.
//! - A Fixed phase adds a transition sample at its start when the speed
//!   changes, then a hold sample at its end.
//! - A Ramp phase is cut into `N` sub-steps (see [`ramp_steps`]) with one
//!   linearly interpolated sample at the end of each.
//!
//! Expansion never fails. An out-of-range Cycle or the iteration cap ends it
//! early and the reason is kept in [`Timeline::truncation`].

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::sequence::interpreter::{Halt, Interpreter, StepEvent};
use crate::sequence::{Direction, DurationUnit, Sequence, SpeedMode};

/// Default cap on visited steps during expansion.
pub const DEFAULT_ITERATION_CAP: usize = 10_000;

/// Smallest ramp sub-step; shorter intervals are raised to this.
pub const MIN_RAMP_INTERVAL: Duration = Duration::from_millis(10);

/// Tolerance when matching a time against direction interval ends, in seconds.
const DIRECTION_TOLERANCE: f64 = 0.001;

/// Number of sub-steps for a ramp of `duration_secs` sent every `interval`.
///
/// `floor(duration / interval)`, at least one. A zero-length ramp is a single
/// step. The quotient gets a 1e-9 nudge before flooring, so exact multiples
/// that floating point lands just below (0.3 / 0.1) count fully: 3 sub-steps,
/// not 2. Intervals below [`MIN_RAMP_INTERVAL`] are raised to it.
pub fn ramp_steps(duration_secs: f64, interval: Duration) -> usize {
    if duration_secs <= 0.0 {
        return 1;
    }
    let step = interval.max(MIN_RAMP_INTERVAL).as_secs_f64();
    // absorb representation error, e.g. 10.0 / 0.1
    let n = (duration_secs / step + 1e-9).floor();
    (n as usize).max(1)
}

/// A `(time, speed)` point of the planned speed curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedSample {
    /// Seconds from run start
    pub time: f64,
    /// Planned speed
    pub rpm: f64,
}

/// Start of a Phase on the curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseMarker {
    /// Seconds from run start
    pub time: f64,
    /// Speed when the phase begins
    pub rpm: f64,
    /// 1-based step number
    pub step: usize,
}

/// Time covered by one completed Cycle, all repeats included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleSpan {
    /// First visit of the Cycle, seconds from run start
    pub start: f64,
    /// Time the Cycle ran out of repeats
    pub end: f64,
}

/// Direction in force up to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DirectionInterval {
    /// End of the Phase, seconds from run start
    pub end: f64,
    /// Direction the Phase runs in
    pub direction: Direction,
}

/// Why expansion stopped before the end of the sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Truncation {
    /// A Cycle referenced steps outside the sequence.
    InvalidCycle {
        /// 1-based step number of the Cycle
        step: usize,
        /// Description of the bad bounds
        detail: String,
    },
    /// The iteration cap was reached.
    IterationCap {
        /// Steps visited before stopping
        iterations: usize,
    },
}

/// Planned speed/direction profile of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    /// Speed curve, starting at `(0, 0)`, non-decreasing in time
    pub samples: Vec<SpeedSample>,
    /// One marker per executed Phase
    pub markers: Vec<PhaseMarker>,
    /// One span per completed Cycle
    pub cycles: Vec<CycleSpan>,
    /// Direction per executed Phase, in time order
    pub directions: Vec<DirectionInterval>,
    /// Set when expansion stopped early
    pub truncation: Option<Truncation>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            samples: vec![SpeedSample { time: 0.0, rpm: 0.0 }],
            markers: Vec::new(),
            cycles: Vec::new(),
            directions: Vec::new(),
            truncation: None,
        }
    }
}

impl Timeline {
    /// Planned run length in seconds.
    pub fn total_duration(&self) -> f64 {
        self.final_sample().time
    }

    /// Last point of the curve.
    pub fn final_sample(&self) -> SpeedSample {
        self.samples
            .last()
            .copied()
            .unwrap_or(SpeedSample { time: 0.0, rpm: 0.0 })
    }

    /// Direction of the last Phase, Forward for an empty plan.
    pub fn final_direction(&self) -> Direction {
        self.directions
            .last()
            .map(|d| d.direction)
            .unwrap_or(Direction::Forward)
    }

    /// Planned speed at `time`, interpolated linearly between samples.
    ///
    /// Outside the curve the first or last speed is returned. Where two samples
    /// share a time (a Fixed transition) the later one wins.
    pub fn speed_at(&self, time: f64) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        if time <= first.time {
            return first.rpm;
        }
        if time >= last.time {
            return last.rpm;
        }
        let hi = self.samples.partition_point(|s| s.time <= time);
        let (a, b) = (self.samples[hi - 1], self.samples[hi]);
        a.rpm + (b.rpm - a.rpm) * (time - a.time) / (b.time - a.time)
    }

    /// Planned direction at `time`.
    pub fn direction_at(&self, time: f64) -> Direction {
        self.directions
            .iter()
            .find(|d| time <= d.end + DIRECTION_TOLERANCE)
            .map(|d| d.direction)
            .unwrap_or(Direction::Forward)
    }

    /// Unit a plot axis of this timeline should use.
    ///
    /// Seconds below two minutes, minutes below two hours, hours beyond. Divide
    /// times by [`DurationUnit::factor`] to convert.
    pub fn display_unit(&self) -> DurationUnit {
        let total = self.total_duration();
        if total < 120.0 {
            DurationUnit::Seconds
        } else if total < 7200.0 {
            DurationUnit::Minutes
        } else {
            DurationUnit::Hours
        }
    }
}

/// Simulate `sequence` with ramps sampled every `ramp_interval`.
///
/// Visits at most `iteration_cap` steps. Identical inputs always produce an
/// identical timeline.
pub fn expand(sequence: &Sequence, ramp_interval: Duration, iteration_cap: usize) -> Timeline {
    let mut timeline = Timeline::default();
    let mut interp = Interpreter::new(sequence.steps()).with_iteration_cap(iteration_cap);
    let mut cycle_starts: HashMap<usize, f64> = HashMap::new();
    let mut elapsed = 0.0_f64;
    let mut current = 0.0_f64;

    while let Some(event) = interp.next_event() {
        match event {
            StepEvent::Phase { index, phase } => {
                let duration = phase.duration_secs();
                let target = phase.rpm();
                timeline.markers.push(PhaseMarker {
                    time: elapsed,
                    rpm: current,
                    step: index + 1,
                });
                timeline.directions.push(DirectionInterval {
                    end: elapsed + duration,
                    direction: phase.direction(),
                });

                match phase.mode() {
                    SpeedMode::Fixed => {
                        if target != current {
                            timeline.samples.push(SpeedSample {
                                time: elapsed,
                                rpm: target,
                            });
                        }
                        timeline.samples.push(SpeedSample {
                            time: elapsed + duration,
                            rpm: target,
                        });
                    }
                    SpeedMode::Ramp => {
                        let n = ramp_steps(duration, ramp_interval);
                        let step_secs = duration / n as f64;
                        for i in 1..=n {
                            let fraction = i as f64 / n as f64;
                            timeline.samples.push(SpeedSample {
                                time: elapsed + step_secs * i as f64,
                                rpm: current + (target - current) * fraction,
                            });
                        }
                    }
                }

                elapsed += duration;
                current = target;
            }
            StepEvent::CycleJump {
                index, first_visit, ..
            } => {
                if first_visit {
                    cycle_starts.insert(index, elapsed);
                }
            }
            StepEvent::CycleDone { index } => {
                if let Some(start) = cycle_starts.remove(&index) {
                    timeline.cycles.push(CycleSpan {
                        start,
                        end: elapsed,
                    });
                }
            }
        }
    }

    timeline.truncation = match interp.halt() {
        Some(Halt::InvalidCycle { step, reason }) => {
            warn!(step = *step, "Plan truncated: invalid cycle: {}", reason);
            Some(Truncation::InvalidCycle {
                step: *step,
                detail: reason.clone(),
            })
        }
        Some(Halt::IterationCap { iterations }) => {
            debug!(iterations = *iterations, "Plan truncated at iteration cap");
            Some(Truncation::IterationCap {
                iterations: *iterations,
            })
        }
        _ => None,
    };
    timeline
}
