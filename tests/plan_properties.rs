//! Properties of plan expansion and sequence persistence.

use minipuls_control::plan::{expand, Truncation, DEFAULT_ITERATION_CAP};
use minipuls_control::sequence::{store, Cycle, Direction, DurationUnit, Phase, Sequence, Step};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(100);

fn mixed_sequence() -> Sequence {
    let mut seq = Sequence::new();
    seq.push(Phase::ramp(Direction::Forward, 20.0, 3.0, DurationUnit::Seconds).unwrap());
    seq.push(Phase::fixed(Direction::Backward, 35.5, 0.5, DurationUnit::Minutes).unwrap());
    seq.push(Phase::ramp(Direction::Forward, 0.0, 2.0, DurationUnit::Seconds).unwrap());
    seq.push(Cycle::new(2, 3, 2).unwrap());
    seq.push(Phase::fixed(Direction::Forward, 48.0, 0.0, DurationUnit::Seconds).unwrap());
    seq.push(Phase::fixed(Direction::Forward, 12.0, 0.01, DurationUnit::Hours).unwrap());
    seq
}

#[test]
fn expansion_is_deterministic() {
    let seq = mixed_sequence();
    let a = expand(&seq, TICK, DEFAULT_ITERATION_CAP);
    let b = expand(&seq.clone(), TICK, DEFAULT_ITERATION_CAP);

    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn timeline_is_monotonic_and_sums_taken_path() {
    let seq = mixed_sequence();
    let timeline = expand(&seq, TICK, DEFAULT_ITERATION_CAP);

    assert_eq!((timeline.samples[0].time, timeline.samples[0].rpm), (0.0, 0.0));
    assert!(timeline
        .samples
        .windows(2)
        .all(|w| w[1].time >= w[0].time));
    assert!(timeline.samples.iter().all(|s| (0.0..=48.0).contains(&s.rpm)));

    // phases 2-3 run three times: 3 + 3 * (30 + 2) + 0 + 36
    let expected = 3.0 + 3.0 * 32.0 + 0.0 + 36.0;
    assert!((timeline.total_duration() - expected).abs() < 1e-6);

    let steps: Vec<usize> = timeline.markers.iter().map(|m| m.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 2, 3, 2, 3, 5, 6]);
    assert_eq!(timeline.cycles.len(), 1);
    assert!(timeline.truncation.is_none());
}

#[test]
fn ramp_to_full_speed_has_one_sample_per_interval() {
    let mut seq = Sequence::new();
    seq.push(Phase::ramp(Direction::Forward, 48.0, 10.0, DurationUnit::Seconds).unwrap());
    let timeline = expand(&seq, TICK, DEFAULT_ITERATION_CAP);

    let ramp = &timeline.samples[1..];
    assert_eq!(ramp.len(), 100);
    assert!(ramp.windows(2).all(|w| w[1].rpm > w[0].rpm));
    assert_eq!(ramp.last().unwrap().rpm, 48.0);
}

#[test]
fn invalid_cycle_yields_partial_timeline() {
    let mut seq = Sequence::new();
    seq.push(Phase::fixed(Direction::Forward, 10.0, 4.0, DurationUnit::Seconds).unwrap());
    seq.push(Phase::fixed(Direction::Forward, 20.0, 4.0, DurationUnit::Seconds).unwrap());
    seq.push(Cycle::new(1, 2, 1).unwrap());
    seq.push(Phase::fixed(Direction::Forward, 30.0, 4.0, DurationUnit::Seconds).unwrap());
    // shrinking the list leaves the cycle pointing past the end
    seq.remove_many(&[0, 3]).unwrap();
    seq.push(Cycle::new(1, 9, 1).unwrap());

    let timeline = expand(&seq, TICK, DEFAULT_ITERATION_CAP);
    assert!(matches!(
        timeline.truncation,
        Some(Truncation::InvalidCycle { step: 3, .. })
    ));
    assert_eq!(timeline.total_duration(), 8.0);
}

#[test]
fn runaway_cycle_stops_at_iteration_cap() {
    let mut seq = Sequence::new();
    seq.push(Phase::fixed(Direction::Forward, 1.0, 1.0, DurationUnit::Seconds).unwrap());
    seq.push(Cycle::new(1, 1, 1_000_000).unwrap());

    let timeline = expand(&seq, TICK, DEFAULT_ITERATION_CAP);
    assert_eq!(
        timeline.truncation,
        Some(Truncation::IterationCap {
            iterations: DEFAULT_ITERATION_CAP
        })
    );
    assert_eq!(timeline.markers.len(), DEFAULT_ITERATION_CAP / 2);
}

#[test]
fn save_then_load_reproduces_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.json");
    let seq = mixed_sequence();

    store::save(&seq, &path).unwrap();
    let loaded = store::load(&path).unwrap();

    assert_eq!(loaded, seq);
    for (a, b) in loaded.iter().zip(seq.iter()) {
        if let (Step::Phase(a), Step::Phase(b)) = (a, b) {
            assert_eq!(a.rpm().to_bits(), b.rpm().to_bits());
            assert_eq!(a.unit(), b.unit());
        }
    }
}
