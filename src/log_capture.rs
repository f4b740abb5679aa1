//! In-memory capture of tracing events.
//!
//! Every warning and error the library raises goes through `tracing`. The
//! [`LogCaptureLayer`] mirrors those events into a bounded [`LogBuffer`] so a
//! presentation layer (status pane, CLI summary) can show them without owning
//! the terminal output. This is the single notification channel of the crate.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::ApplicationConfig;

/// A single captured log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Local time the event was recorded
    pub timestamp: DateTime<Local>,
    /// Event level
    pub level: Level,
    /// Module path of the emitter
    pub target: String,
    /// Message plus any structured fields
    pub message: String,
}

impl LogEntry {
    /// `HH:MM:SS - message`, the format of the operator log pane.
    pub fn display_line(&self) -> String {
        format!("{} - {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Bounded, shareable ring of captured log entries.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Buffer holding the 1000 most recent entries.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Buffer holding at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of the buffered entries, oldest first.
    pub fn read(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries at `level` or more severe.
    pub fn at_least(&self, level: Level) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.level <= level)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every retained entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// `tracing` layer that copies every event it sees into a [`LogBuffer`].
pub struct LogCaptureLayer {
    buffer: LogBuffer,
}

impl LogCaptureLayer {
    /// Layer writing into `buffer`.
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        message.push_str(&visitor.fields);

        self.buffer.push(LogEntry {
            timestamp: Local::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message,
        });
    }
}

/// Install the global subscriber: console output filtered by `RUST_LOG` (falling
/// back to the configured level) plus capture into the returned [`LogBuffer`].
///
/// Calling this twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing(config: &ApplicationConfig) -> LogBuffer {
    let buffer = LogBuffer::with_capacity(config.log_capacity);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let capture = LogCaptureLayer::new(buffer.clone());
    let registry = tracing_subscriber::registry().with(filter).with(capture);

    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: Level, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Local::now(),
            level,
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let buffer = LogBuffer::with_capacity(2);
        buffer.push(entry(Level::INFO, "one"));
        buffer.push(entry(Level::INFO, "two"));
        buffer.push(entry(Level::INFO, "three"));

        let messages: Vec<_> = buffer.read().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_severity_filter() {
        let buffer = LogBuffer::new();
        buffer.push(entry(Level::DEBUG, "noise"));
        buffer.push(entry(Level::WARN, "clamped"));
        buffer.push(entry(Level::ERROR, "aborted"));

        let severe = buffer.at_least(Level::WARN);
        assert_eq!(severe.len(), 2);
        assert_eq!(severe[1].message, "aborted");
    }

    #[test]
    fn test_layer_captures_message_and_fields() {
        let buffer = LogBuffer::new();
        let subscriber =
            tracing_subscriber::registry().with(LogCaptureLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(step = 3, "Invalid phase range");
        });

        let entries = buffer.read();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, Level::WARN);
        assert_eq!(entries[0].message, "Invalid phase range step=3");
    }
}
