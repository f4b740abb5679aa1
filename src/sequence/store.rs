//! JSON persistence for sequences.
//!
//! A sequence file is a JSON array of tagged step records, pretty printed with a
//! four-space indent:
//!
//! ```json
//! [
//!     {
//!         "type": "Phase",
//!         "direction": "Forward",
//!         "mode": "Fixed",
//!         "rpm": 12.5,
//!         "duration": 10.0,
//!         "unit": "s"
//!     },
//!     {
//!         "type": "Cycle",
//!         "start_phase": 1,
//!         "end_phase": 1,
//!         "repeats": 3
//!     }
//! ]
//! ```
//!
//! Loading runs every record through the same validation as interactive entry.
//! A malformed or out-of-range document is rejected whole.

use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use super::Sequence;
use crate::error::{AppResult, PumpError};

/// Serialise with a four-space indent.
pub fn to_json_string(sequence: &Sequence) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    sequence.serialize(&mut ser)?;
    // serde_json only emits UTF-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse sequence JSON, running the step validation.
pub fn from_json_str(text: &str) -> serde_json::Result<Sequence> {
    serde_json::from_str(text)
}

/// Read a sequence file.
///
/// # Errors
/// [`PumpError::LoadFailed`] if the file cannot be read or is not a valid sequence.
pub fn load(path: impl AsRef<Path>) -> AppResult<Sequence> {
    let path = path.as_ref();
    let failed = |reason: String| {
        warn!(path = %path.display(), "Failed to load sequence: {}", reason);
        PumpError::LoadFailed {
            path: path.to_path_buf(),
            reason,
        }
    };

    let text = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
    let sequence = from_json_str(&text).map_err(|e| failed(e.to_string()))?;
    info!(path = %path.display(), steps = sequence.len(), "Sequence loaded");
    Ok(sequence)
}

/// Write a sequence file, replacing any existing one.
///
/// # Errors
/// [`PumpError::SaveFailed`] if serialisation or the write fails.
pub fn save(sequence: &Sequence, path: impl AsRef<Path>) -> AppResult<()> {
    let path = path.as_ref();
    let failed = |reason: String| {
        warn!(path = %path.display(), "Failed to save sequence: {}", reason);
        PumpError::SaveFailed {
            path: path.to_path_buf(),
            reason,
        }
    };

    let text = to_json_string(sequence).map_err(|e| failed(e.to_string()))?;
    std::fs::write(path, text).map_err(|e| failed(e.to_string()))?;
    info!(path = %path.display(), steps = sequence.len(), "Sequence saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Cycle, Direction, DurationUnit, Phase, Step};

    fn sample() -> Sequence {
        let mut seq = Sequence::new();
        seq.push(Phase::fixed(Direction::Forward, 12.5, 10.0, DurationUnit::Seconds).unwrap());
        seq.push(Phase::ramp(Direction::Backward, 48.0, 1.5, DurationUnit::Minutes).unwrap());
        seq.push(Cycle::new(1, 2, 3).unwrap());
        seq
    }

    #[test]
    fn test_record_format() {
        let json = to_json_string(&sample()).unwrap();
        assert!(json.starts_with("[\n    {\n        \"type\": \"Phase\""));
        assert!(json.contains("\"unit\": \"min\""));
        assert!(json.contains("\"start_phase\": 1"));
    }

    #[test]
    fn test_parse_hand_written_file() {
        let text = r#"[
            {"type": "Phase", "direction": "Backward", "mode": "Ramp", "rpm": 20, "duration": 2, "unit": "hr"},
            {"type": "Cycle", "start_phase": 1, "end_phase": 1, "repeats": 1}
        ]"#;
        let seq = from_json_str(text).unwrap();
        assert_eq!(seq.len(), 2);
        match seq.get(0) {
            Some(Step::Phase(p)) => assert_eq!(p.duration_secs(), 7200.0),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_record_rejected() {
        let text = r#"[{"type": "Phase", "direction": "Forward", "mode": "Fixed", "rpm": 60, "duration": 1, "unit": "s"}]"#;
        let err = from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("RPM must be"));

        let text = r#"[{"type": "Cycle", "start_phase": 0, "end_phase": 1, "repeats": 1}]"#;
        assert!(from_json_str(text).is_err());

        let text = r#"[{"type": "Phase", "direction": "Forward", "mode": "Fixed", "rpm": 10, "duration": 1e16, "unit": "hr"}]"#;
        let err = from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("too long"));

        let text = r#"[{"type": "Pause", "seconds": 3}]"#;
        assert!(from_json_str(text).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let seq = sample();

        save(&seq, &path).unwrap();
        assert_eq!(load(&path).unwrap(), seq);
    }

    #[test]
    fn test_load_errors_carry_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(load(&missing), Err(PumpError::LoadFailed { path, .. }) if path == missing));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "[{").unwrap();
        assert!(matches!(load(&broken), Err(PumpError::LoadFailed { .. })));
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/run.json");
        assert!(matches!(save(&sample(), &path), Err(PumpError::SaveFailed { .. })));
    }
}
