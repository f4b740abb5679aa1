//! Byte-stream transports for the GSIOC bus.
//!
//! The protocol driver only needs three things from the wire: write a burst of
//! bytes, read a single byte with a deadline, and close. [`SerialTransport`] does
//! that over RS-232 with tokio-serial; tests substitute
//! [`MockTransport`](super::mock::MockTransport).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;
#[cfg(feature = "instrument_serial")]
use crate::error::PumpError;

/// Minimal async byte transport used by the protocol driver.
#[async_trait]
pub trait Transport: Send {
    /// Write every byte and flush.
    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read one byte, or `None` if nothing arrived within `timeout`.
    async fn read_byte(&mut self, timeout: Duration) -> AppResult<Option<u8>>;

    /// Release the underlying resource. Further writes fail.
    async fn close(&mut self) -> AppResult<()>;

    /// Human readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Serial line settings of the MINIPULS bus: 8 data bits, even parity, 1 stop bit.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM4")
    pub path: String,
    /// Baud rate (19200 for GSIOC)
    pub baud_rate: u32,
    /// Read timeout
    pub timeout: Duration,
}

impl SerialSettings {
    /// 8E1 settings with a one-second read timeout.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
        }
    }

    /// Override the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// RS-232 transport backed by tokio-serial.
#[cfg(feature = "instrument_serial")]
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<tokio_serial::SerialStream>,
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    /// Open the port with 8E1 framing and no flow control.
    ///
    /// # Errors
    /// Returns [`PumpError::Transport`] if the port cannot be opened.
    pub fn open(settings: SerialSettings) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&settings.path, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(settings.timeout)
            .open_native_async()
            .map_err(|e| {
                PumpError::Transport(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    settings.path, settings.baud_rate, e
                ))
            })?;

        tracing::debug!(
            port = %settings.path,
            baud = settings.baud_rate,
            "Serial port opened"
        );

        Ok(Self {
            settings,
            port: Some(port),
        })
    }

    fn port_mut(&mut self) -> AppResult<&mut tokio_serial::SerialStream> {
        let path = self.settings.path.clone();
        self.port
            .as_mut()
            .ok_or_else(|| PumpError::Transport(format!("Serial port '{}' is closed", path)))
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;

        let port = self.port_mut()?;
        port.write_all(bytes)
            .await
            .map_err(|e| PumpError::Transport(format!("Serial write failed: {}", e)))?;
        port.flush()
            .await
            .map_err(|e| PumpError::Transport(format!("Serial flush failed: {}", e)))
    }

    async fn read_byte(&mut self, timeout: Duration) -> AppResult<Option<u8>> {
        use tokio::io::AsyncReadExt;

        let port = self.port_mut()?;
        let mut buf = [0u8; 1];
        match tokio::time::timeout(timeout, port.read(&mut buf)).await {
            Ok(Ok(1)) => Ok(Some(buf[0])),
            Ok(Ok(_)) => Err(PumpError::Transport(
                "Unexpected EOF from serial port".to_string(),
            )),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(PumpError::Transport(format!("Serial read failed: {}", e))),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut port) = self.port.take() {
            use tokio::io::AsyncWriteExt;
            // Dropping the stream releases the device; a failed flush changes nothing.
            let _ = port.flush().await;
            tracing::debug!(port = %self.settings.path, "Serial port closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud (8E1)", self.settings.path, self.settings.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_settings_defaults() {
        let settings = SerialSettings::new("/dev/ttyUSB0", 19200);
        assert_eq!(settings.path, "/dev/ttyUSB0");
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.timeout, Duration::from_secs(1));
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let result = SerialTransport::open(SerialSettings::new("/dev/does-not-exist-minipuls", 19200));
        assert!(matches!(result, Err(PumpError::Transport(_))));
    }
}
