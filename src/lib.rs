//! Core library for the MINIPULS pump controller.
//!
//! This library contains the bus driver, the sequence model, the plan expander
//! and the executor that runs a sequence against a pump. It is used by the
//! `minipuls` command-line front end and by any other presentation layer.
//!
//! Layering, leaves first:
//!
//! - [`hardware`]: byte transports and the MINIPULS protocol driver
//! - [`sequence`]: Phases, Cycles, editing, the shared interpreter, persistence
//! - [`plan`]: clock-free expansion of a sequence into a [`plan::Timeline`]
//! - [`executor`]: clock-paced, cancellable execution
//! - [`progress`]: runtime state and the periodic progress monitor
//! - [`controller`]: the facade tying them together

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod log_capture;
pub mod plan;
pub mod progress;
pub mod sequence;

pub use controller::{PumpController, RunHandle};
pub use error::{AppResult, PumpError};
