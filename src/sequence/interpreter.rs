//! Program-counter machine over a step list.
//!
//! Both the plan expander and the executor walk a sequence with the same rules:
//! Phases advance the counter by one, a Cycle jumps back to its first step while
//! it has repeats left, and a Cycle that finishes resets its counter so an
//! enclosing loop can run it again. The [`Interpreter`] owns those rules and
//! yields one [`StepEvent`] per visited step; callers decide what a visit means
//! (timeline samples or device commands).

use std::collections::HashMap;

use super::{Phase, Step};
use crate::error::PumpError;

/// One visited step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent<'a> {
    /// A Phase to perform.
    Phase {
        /// 0-based step index
        index: usize,
        /// The Phase at `index`
        phase: &'a Phase,
    },
    /// A Cycle sent the counter back to `target`.
    CycleJump {
        /// 0-based index of the Cycle
        index: usize,
        /// 0-based index of the first looped step
        target: usize,
        /// Jumps left after this one
        remaining: u32,
        /// First visit since the counter was last reset
        first_visit: bool,
    },
    /// A Cycle ran out of repeats; execution continues after it.
    CycleDone {
        /// 0-based index of the Cycle
        index: usize,
    },
}

impl StepEvent<'_> {
    /// 0-based index of the visited step.
    pub fn index(&self) -> usize {
        match self {
            StepEvent::Phase { index, .. }
            | StepEvent::CycleJump { index, .. }
            | StepEvent::CycleDone { index } => *index,
        }
    }
}

/// Why the interpreter stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// The counter ran past the last step.
    Completed,
    /// A Cycle referenced steps outside the sequence.
    InvalidCycle {
        /// 1-based step number of the Cycle
        step: usize,
        /// Description of the bad bounds
        reason: String,
    },
    /// The configured iteration cap was hit.
    IterationCap {
        /// Steps visited before stopping
        iterations: usize,
    },
}

impl Halt {
    /// The error equivalent of a faulted halt.
    pub fn to_error(&self) -> Option<PumpError> {
        match self {
            Halt::InvalidCycle { step, reason } => Some(PumpError::InvalidSequence {
                step: *step,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Step-by-step walker over a borrowed sequence.
#[derive(Debug)]
pub struct Interpreter<'a> {
    steps: &'a [Step],
    pc: usize,
    counters: HashMap<usize, u32>,
    iterations: usize,
    cap: Option<usize>,
    halt: Option<Halt>,
}

impl<'a> Interpreter<'a> {
    /// Walker without an iteration cap.
    pub fn new(steps: &'a [Step]) -> Self {
        Self {
            steps,
            pc: 0,
            counters: HashMap::new(),
            iterations: 0,
            cap: None,
            halt: None,
        }
    }

    /// Stop after `cap` visited steps.
    pub fn with_iteration_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Current program counter (0-based).
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Steps visited so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Set once [`Self::next_event`] has returned `None`.
    pub fn halt(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    /// Visit the next step, or `None` once halted.
    pub fn next_event(&mut self) -> Option<StepEvent<'a>> {
        if self.halt.is_some() {
            return None;
        }
        let steps = self.steps;
        if self.pc >= steps.len() {
            self.halt = Some(Halt::Completed);
            return None;
        }
        if let Some(cap) = self.cap {
            if self.iterations >= cap {
                self.halt = Some(Halt::IterationCap {
                    iterations: self.iterations,
                });
                return None;
            }
        }
        self.iterations += 1;

        let index = self.pc;
        match &steps[index] {
            Step::Phase(phase) => {
                self.pc += 1;
                Some(StepEvent::Phase { index, phase })
            }
            Step::Cycle(cycle) => {
                let Some((start, _)) = cycle.bounds_within(steps.len()) else {
                    self.halt = Some(Halt::InvalidCycle {
                        step: index + 1,
                        reason: format!(
                            "phase range {}-{} outside sequence of {} steps",
                            cycle.start_phase(),
                            cycle.end_phase(),
                            steps.len()
                        ),
                    });
                    return None;
                };

                let first_visit = !self.counters.contains_key(&index);
                let budget = self.counters.entry(index).or_insert(cycle.repeats());
                if *budget > 0 {
                    *budget -= 1;
                    let remaining = *budget;
                    self.pc = start;
                    Some(StepEvent::CycleJump {
                        index,
                        target: start,
                        remaining,
                        first_visit,
                    })
                } else {
                    self.counters.remove(&index);
                    self.pc += 1;
                    Some(StepEvent::CycleDone { index })
                }
            }
        }
    }
}

impl<'a> Iterator for Interpreter<'a> {
    type Item = StepEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
