//! Mock Transport Implementation
//!
//! Provides a simulated GSIOC bus endpoint for testing without a pump attached.
//! All waiting uses `tokio::time`, so tests running on a paused clock complete
//! instantly.
//!
//! # Behaviour
//!
//! - Every written byte is recorded and can be inspected as raw bytes or as
//!   decoded `\n<command>\r` frames.
//! - The unit-select handshake is answered with an echo (configurable: echo,
//!   wrong byte, or silence).
//! - Writes can be made to fail after a number of successful writes to exercise
//!   mid-session transport errors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::transport::Transport;
use crate::error::{AppResult, PumpError};

/// How the mock answers a unit-select byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Echo the select byte back (a healthy pump)
    Echo,
    /// Answer with a fixed, wrong byte
    Byte(u8),
    /// Never answer; reads time out
    Silent,
}

#[derive(Debug)]
struct MockState {
    written: Vec<u8>,
    pending: Option<u8>,
    reply: HandshakeReply,
    writes_before_failure: Option<usize>,
    closed: bool,
}

// =============================================================================
// MockTransport - Recording bus endpoint
// =============================================================================

/// In-memory transport that records traffic.
///
/// Cloning shares the underlying state, so a test can keep one handle while the
/// driver owns the other.
///
/// # Example
///
/// ```rust,ignore
/// let bus = MockTransport::new();
/// driver.connect_via(Box::new(bus.clone())).await?;
/// driver.set_speed(12.5, false).await?;
/// assert_eq!(bus.commands(), vec!["R1250"]);
/// ```
#[derive(Clone, Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Healthy endpoint that echoes the unit-select byte.
    pub fn new() -> Self {
        Self::with_reply(HandshakeReply::Echo)
    }

    /// Endpoint with a specific handshake behaviour.
    pub fn with_reply(reply: HandshakeReply) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                written: Vec::new(),
                pending: None,
                reply,
                writes_before_failure: None,
                closed: false,
            })),
        }
    }

    /// Fail every write after `count` successful ones.
    pub fn fail_after_writes(self, count: usize) -> Self {
        self.state.lock().writes_before_failure = Some(count);
        self
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Decoded `\n<text>\r` command frames, in write order.
    ///
    /// Raw bus bytes (reset, unit select) are not part of any frame and are skipped.
    pub fn commands(&self) -> Vec<String> {
        let written = self.written();
        let mut commands = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for byte in written {
            match (byte, current.as_mut()) {
                (b'\n', _) => current = Some(Vec::new()),
                (b'\r', Some(frame)) => {
                    commands.push(String::from_utf8_lossy(frame).into_owned());
                    current = None;
                }
                (b, Some(frame)) => frame.push(b),
                (_, None) => {}
            }
        }
        commands
    }

    /// Only the `R<nnnn>` speed commands, decoded back into rpm.
    pub fn speed_commands(&self) -> Vec<f64> {
        self.commands()
            .iter()
            .filter_map(|c| c.strip_prefix('R'))
            .filter_map(|v| v.parse::<u32>().ok())
            .map(|v| v as f64 / 100.0)
            .collect()
    }

    /// Forget recorded traffic (keeps behaviour settings).
    pub fn clear(&self) {
        self.state.lock().written.clear();
    }

    /// Whether the driver closed the transport.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PumpError::Transport("Mock transport is closed".to_string()));
        }
        if let Some(remaining) = state.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(PumpError::Transport("Mock write failure".to_string()));
            }
            *remaining -= 1;
        }

        state.written.extend_from_slice(bytes);
        // A lone byte with the high bit set (other than bus reset) is a unit select.
        if let [byte] = bytes {
            if *byte & 0x80 != 0 && *byte != 0xFF {
                let reply = state.reply;
                state.pending = match reply {
                    HandshakeReply::Echo => Some(*byte),
                    HandshakeReply::Byte(b) => Some(b),
                    HandshakeReply::Silent => None,
                };
            }
        }
        Ok(())
    }

    async fn read_byte(&mut self, timeout: Duration) -> AppResult<Option<u8>> {
        let pending = self.state.lock().pending.take();
        match pending {
            Some(byte) => Ok(Some(byte)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "mock transport".to_string()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_frames() {
        let mut bus = MockTransport::new();
        bus.write_all(&[0xFF]).await.unwrap();
        bus.write_all(b"\nK>\r").await.unwrap();
        bus.write_all(b"\nR1250\r").await.unwrap();

        assert_eq!(bus.commands(), vec!["K>", "R1250"]);
        assert_eq!(bus.speed_commands(), vec![12.5]);
        assert_eq!(bus.written()[0], 0xFF);
    }

    #[tokio::test]
    async fn test_mock_echoes_unit_select() {
        let mut bus = MockTransport::new();
        bus.write_all(&[0x80 | 30]).await.unwrap();
        assert_eq!(
            bus.read_byte(Duration::from_millis(10)).await.unwrap(),
            Some(0x80 | 30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_silent_times_out() {
        let mut bus = MockTransport::with_reply(HandshakeReply::Silent);
        bus.write_all(&[0x80 | 30]).await.unwrap();
        assert_eq!(bus.read_byte(Duration::from_secs(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_write_failure() {
        let mut bus = MockTransport::new().fail_after_writes(1);
        bus.write_all(b"\nSR\r").await.unwrap();
        assert!(bus.write_all(b"\nK>\r").await.is_err());
    }
}
