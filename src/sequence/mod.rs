//! Sequence model: Phases, Cycles, and the editable step list.
//!
//! A [`Sequence`] is the operator's run plan. Steps enter it only through the
//! validating constructors ([`Phase::new`], [`Cycle::new`]) or through
//! deserialisation, which runs the same checks, so a stored Phase speed is always
//! within 0–48 rpm and a stored Cycle always has `1 <= start <= end` and at least
//! one repeat. Cycle bounds are *not* checked against the sequence length here:
//! the list can shrink after a Cycle was added, so that check happens when the
//! [`interpreter`] visits the Cycle.
//!
//! Runs and previews work on a clone of the sequence; edits made afterwards do
//! not reach them.

pub mod interpreter;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, PumpError};
use crate::hardware::minipuls::{MAX_RPM, MIN_RPM};

/// Rotation direction of a Phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Clockwise, `K>`
    Forward,
    /// Counter-clockwise, `K<`
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "Forward"),
            Direction::Backward => write!(f, "Backward"),
        }
    }
}

/// How a Phase reaches its target speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeedMode {
    /// Jump to the target at phase start and hold it
    Fixed,
    /// Interpolate linearly from the previous speed over the whole phase
    Ramp,
}

impl fmt::Display for SpeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedMode::Fixed => write!(f, "Fixed"),
            SpeedMode::Ramp => write!(f, "Ramp"),
        }
    }
}

/// Unit a Phase duration is entered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationUnit {
    /// Seconds, stored as `"s"`
    #[serde(rename = "s")]
    Seconds,
    /// Minutes, stored as `"min"`
    #[serde(rename = "min")]
    Minutes,
    /// Hours, stored as `"hr"`
    #[serde(rename = "hr")]
    Hours,
}

impl DurationUnit {
    /// Seconds per unit.
    pub fn factor(self) -> f64 {
        match self {
            DurationUnit::Seconds => 1.0,
            DurationUnit::Minutes => 60.0,
            DurationUnit::Hours => 3600.0,
        }
    }

    /// Convert `value` of this unit to seconds.
    pub fn to_seconds(self, value: f64) -> f64 {
        value * self.factor()
    }

    /// Short label, also the serialized form.
    pub fn symbol(self) -> &'static str {
        match self {
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "min",
            DurationUnit::Hours => "hr",
        }
    }
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unvalidated Phase fields, as found in a sequence file.
#[derive(Debug, Clone, Deserialize)]
struct PhaseRecord {
    direction: Direction,
    mode: SpeedMode,
    rpm: f64,
    duration: f64,
    unit: DurationUnit,
}

/// One directed, timed speed directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PhaseRecord")]
pub struct Phase {
    direction: Direction,
    mode: SpeedMode,
    rpm: f64,
    duration: f64,
    unit: DurationUnit,
}

impl TryFrom<PhaseRecord> for Phase {
    type Error = PumpError;

    fn try_from(record: PhaseRecord) -> Result<Self, Self::Error> {
        Phase::new(
            record.direction,
            record.mode,
            record.rpm,
            record.duration,
            record.unit,
        )
    }
}

impl Phase {
    /// Validate and build a Phase.
    ///
    /// # Errors
    /// [`PumpError::InputValidation`] unless `rpm` is within 0–48 and `duration`
    /// is a finite, non-negative number whose length in seconds fits a
    /// [`Duration`].
    pub fn new(
        direction: Direction,
        mode: SpeedMode,
        rpm: f64,
        duration: f64,
        unit: DurationUnit,
    ) -> AppResult<Self> {
        if !rpm.is_finite() || !(MIN_RPM..=MAX_RPM).contains(&rpm) {
            return Err(PumpError::InputValidation(format!(
                "RPM must be {}-{}, got {}",
                MIN_RPM, MAX_RPM, rpm
            )));
        }
        if !duration.is_finite() || duration < 0.0 {
            return Err(PumpError::InputValidation(format!(
                "Duration must be a non-negative number, got {}",
                duration
            )));
        }
        if Duration::try_from_secs_f64(unit.to_seconds(duration)).is_err() {
            return Err(PumpError::InputValidation(format!(
                "Duration of {} {} is too long",
                duration,
                unit.symbol()
            )));
        }
        Ok(Self {
            direction,
            mode,
            rpm,
            duration,
            unit,
        })
    }

    /// Fixed-speed phase.
    pub fn fixed(direction: Direction, rpm: f64, duration: f64, unit: DurationUnit) -> AppResult<Self> {
        Self::new(direction, SpeedMode::Fixed, rpm, duration, unit)
    }

    /// Ramp phase.
    pub fn ramp(direction: Direction, rpm: f64, duration: f64, unit: DurationUnit) -> AppResult<Self> {
        Self::new(direction, SpeedMode::Ramp, rpm, duration, unit)
    }

    /// Rotation direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Fixed or Ramp.
    pub fn mode(&self) -> SpeedMode {
        self.mode
    }

    /// Target speed in rpm.
    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    /// Duration in [`Self::unit`]s.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Unit of [`Self::duration`].
    pub fn unit(&self) -> DurationUnit {
        self.unit
    }

    /// Duration converted to seconds.
    pub fn duration_secs(&self) -> f64 {
        self.unit.to_seconds(self.duration)
    }

    /// Duration as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        // representable by construction
        Duration::try_from_secs_f64(self.duration_secs()).unwrap_or(Duration::MAX)
    }
}

/// Unvalidated Cycle fields, as found in a sequence file.
#[derive(Debug, Clone, Deserialize)]
struct CycleRecord {
    start_phase: usize,
    end_phase: usize,
    repeats: u32,
}

/// Loop directive: jump back to `start_phase` `repeats` more times.
///
/// Indices are 1-based step numbers and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CycleRecord")]
pub struct Cycle {
    start_phase: usize,
    end_phase: usize,
    repeats: u32,
}

impl TryFrom<CycleRecord> for Cycle {
    type Error = PumpError;

    fn try_from(record: CycleRecord) -> Result<Self, Self::Error> {
        Cycle::new(record.start_phase, record.end_phase, record.repeats)
    }
}

impl Cycle {
    /// # Errors
    /// [`PumpError::InputValidation`] unless `1 <= start <= end` and `repeats > 0`.
    pub fn new(start_phase: usize, end_phase: usize, repeats: u32) -> AppResult<Self> {
        if start_phase == 0 || end_phase < start_phase || repeats == 0 {
            return Err(PumpError::InputValidation(format!(
                "Cycle needs 1 <= start <= end and repeats > 0, got {}-{} x{}",
                start_phase, end_phase, repeats
            )));
        }
        Ok(Self {
            start_phase,
            end_phase,
            repeats,
        })
    }

    /// First step of the loop (1-based).
    pub fn start_phase(&self) -> usize {
        self.start_phase
    }

    /// Last step of the loop (1-based, inclusive).
    pub fn end_phase(&self) -> usize {
        self.end_phase
    }

    /// Additional passes after the first one.
    pub fn repeats(&self) -> u32 {
        self.repeats
    }

    /// 0-based `(start, end)` if the range lies inside a sequence of `len` steps.
    pub fn bounds_within(&self, len: usize) -> Option<(usize, usize)> {
        let (start, end) = (self.start_phase - 1, self.end_phase - 1);
        (start <= end && end < len).then_some((start, end))
    }
}

/// A Sequence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Step {
    /// Run the pump for a while
    Phase(Phase),
    /// Repeat earlier steps
    Cycle(Cycle),
}

impl From<Phase> for Step {
    fn from(phase: Phase) -> Self {
        Step::Phase(phase)
    }
}

impl From<Cycle> for Step {
    fn from(cycle: Cycle) -> Self {
        Step::Cycle(cycle)
    }
}

impl Step {
    /// `"Phase"` or `"Cycle"`, as shown in listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Phase(_) => "Phase",
            Step::Cycle(_) => "Cycle",
        }
    }
}

/// One row of a sequence listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    /// 1-based step number
    pub number: usize,
    /// Step kind, see [`Step::kind`]
    pub kind: &'static str,
    /// Direction and speed, or the looped range
    pub details: String,
    /// Phase duration, or approximate time per Cycle pass
    pub duration: String,
}

/// Ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence {
    steps: Vec<Step>,
}

impl FromIterator<Step> for Sequence {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

impl Sequence {
    /// Empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All steps in program order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step at 0-based `index`.
    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Iterate over the steps in program order.
    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    fn check_index(&self, index: usize) -> AppResult<()> {
        if index < self.steps.len() {
            Ok(())
        } else {
            Err(PumpError::InputValidation(format!(
                "Step index {} out of range for sequence of {} steps",
                index,
                self.steps.len()
            )))
        }
    }

    /// Append a step.
    pub fn push(&mut self, step: impl Into<Step>) {
        self.steps.push(step.into());
    }

    /// Insert before 0-based `index` (`index == len` appends).
    pub fn insert(&mut self, index: usize, step: impl Into<Step>) -> AppResult<()> {
        if index > self.steps.len() {
            return Err(PumpError::InputValidation(format!(
                "Insert position {} out of range for sequence of {} steps",
                index,
                self.steps.len()
            )));
        }
        self.steps.insert(index, step.into());
        Ok(())
    }

    /// Replace the step at `index`, returning the old one.
    pub fn replace(&mut self, index: usize, step: impl Into<Step>) -> AppResult<Step> {
        self.check_index(index)?;
        Ok(std::mem::replace(&mut self.steps[index], step.into()))
    }

    /// Remove the step at `index`.
    pub fn remove(&mut self, index: usize) -> AppResult<Step> {
        self.check_index(index)?;
        Ok(self.steps.remove(index))
    }

    /// Remove several steps at once. Indices refer to the sequence before removal.
    pub fn remove_many(&mut self, indices: &[usize]) -> AppResult<Vec<Step>> {
        for &index in indices {
            self.check_index(index)?;
        }
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut removed: Vec<Step> = sorted
            .into_iter()
            .rev()
            .map(|index| self.steps.remove(index))
            .collect();
        removed.reverse();
        Ok(removed)
    }

    /// Swap the step at `index` with its predecessor; returns the new index.
    /// The first step stays where it is.
    pub fn move_up(&mut self, index: usize) -> AppResult<usize> {
        self.check_index(index)?;
        if index == 0 {
            return Ok(0);
        }
        self.steps.swap(index, index - 1);
        Ok(index - 1)
    }

    /// Swap the step at `index` with its successor; returns the new index.
    /// The last step stays where it is.
    pub fn move_down(&mut self, index: usize) -> AppResult<usize> {
        self.check_index(index)?;
        if index + 1 == self.steps.len() {
            return Ok(index);
        }
        self.steps.swap(index, index + 1);
        Ok(index + 1)
    }

    /// Remove every step.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Seconds of Phase time covered by one pass of the Cycle at `index`.
    ///
    /// `None` if `index` is not a Cycle; `Some(0.0)` if its range currently lies
    /// outside the sequence.
    pub fn cycle_pass_secs(&self, index: usize) -> Option<f64> {
        let Step::Cycle(cycle) = self.steps.get(index)? else {
            return None;
        };
        let secs = match cycle.bounds_within(self.steps.len()) {
            Some((start, end)) => self.steps[start..=end]
                .iter()
                .filter_map(|step| match step {
                    Step::Phase(phase) => Some(phase.duration_secs()),
                    Step::Cycle(_) => None,
                })
                .sum(),
            None => 0.0,
        };
        Some(secs)
    }

    /// Listing rows in the operator's format.
    pub fn summaries(&self) -> Vec<StepSummary> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let (details, duration) = match step {
                    Step::Phase(p) => (
                        format!("{}, {} to {} RPM", p.direction, p.mode, p.rpm),
                        format!("{} {}", p.duration, p.unit),
                    ),
                    Step::Cycle(c) => (
                        format!(
                            "Loop Phases {}-{} ({} times)",
                            c.start_phase, c.end_phase, c.repeats
                        ),
                        format!("~{:.1} s/cycle", self.cycle_pass_secs(i).unwrap_or(0.0)),
                    ),
                };
                StepSummary {
                    number: i + 1,
                    kind: step.kind(),
                    details,
                    duration,
                }
            })
            .collect()
    }
}
