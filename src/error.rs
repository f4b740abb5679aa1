//! Custom error types for the pump controller.
//!
//! This module defines the primary error type, `PumpError`, shared by every
//! layer of the crate. Using the `thiserror` crate, it gives a single place
//! where the failure taxonomy lives, from bus handshakes to sequence files.
//!
//! ## Error Hierarchy
//!
//! - **`ConnectionFailed`**: The transport could not be opened or the unit-select
//!   handshake did not echo the expected byte. The driver is left disconnected.
//! - **`Transport`**: A write or read failed in the middle of a session.
//! - **`NotConnected`**: A device command was attempted without a connection.
//! - **`InvalidSequence`**: A Cycle references steps outside the sequence.
//! - **`InputValidation`**: An out-of-range speed, duration, index or interval was
//!   rejected before it could enter the sequence or reach the device.
//! - **`LoadFailed` / `SaveFailed`**: Sequence persistence failed. These are terminal
//!   to the triggering operation only.
//! - **`EmptySequence`**, **`RunInProgress`**, **`NoActiveRun`**: run lifecycle
//!   preconditions enforced by the controller.
//!
//! Nothing in the library panics on these paths: every public entry point returns
//! an [`AppResult`].

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, PumpError>;

/// Every failure the pump controller can report.
#[derive(Error, Debug)]
pub enum PumpError {
    /// Port open or unit-select handshake failed.
    #[error("Connection to unit {unit_id} on '{port}' failed: {reason}")]
    ConnectionFailed {
        /// Serial port name
        port: String,
        /// GSIOC unit id
        unit_id: u8,
        /// What went wrong
        reason: String,
    },

    /// A write to the bus failed mid-session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Command issued without a connection.
    #[error("Pump not connected")]
    NotConnected,

    /// A Cycle points outside the sequence.
    #[error("Invalid sequence at step {step}: {reason}")]
    InvalidSequence {
        /// 1-based step number of the Cycle
        step: usize,
        /// Description of the bad bounds
        reason: String,
    },

    /// Out-of-range speed, duration, interval or Cycle field.
    #[error("Input validation error: {0}")]
    InputValidation(String),

    /// Run requested for a sequence with no steps.
    #[error("Sequence is empty")]
    EmptySequence,

    /// The driver is busy with a run.
    #[error("A sequence run is already in progress")]
    RunInProgress,

    /// Cancel or finish requested with no run active.
    #[error("No sequence run is active")]
    NoActiveRun,

    /// Sequence file unreadable or malformed.
    #[error("Failed to load sequence from '{path}': {reason}")]
    LoadFailed {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O or parse error
        reason: String,
    },

    /// Sequence file could not be written.
    #[error("Failed to save sequence to '{path}': {reason}")]
    SaveFailed {
        /// File that was written
        path: PathBuf,
        /// Underlying I/O or encoding error
        reason: String,
    },

    /// Settings failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Hardware connection requested in a build without serial support.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl PumpError {
    /// Whether the error leaves the driver without a usable connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            PumpError::ConnectionFailed { .. } | PumpError::Transport(_) | PumpError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PumpError::InvalidSequence {
            step: 3,
            reason: "phase range 5-6 outside sequence of 4 steps".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid sequence at step 3: phase range 5-6 outside sequence of 4 steps"
        );
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(PumpError::Transport("broken pipe".into()).is_connection_loss());
        assert!(PumpError::NotConnected.is_connection_loss());
        assert!(!PumpError::EmptySequence.is_connection_loss());
    }
}
