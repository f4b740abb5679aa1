//! Gilson MINIPULS 3 peristaltic pump driver (GSIOC buffered commands)
//!
//! Protocol Overview:
//! - Bus: multi-drop RS-232/RS-485, 19200 baud, 8 data bits, even parity, 1 stop bit
//! - Reset: a single `0xFF` byte releases whichever unit is selected
//! - Select: `0x80 | unit_id`; the addressed unit echoes the same byte
//! - Buffered commands: `\n<ASCII>\r`, no checksum, no response
//! - Vocabulary: `SR` remote, `SK` keypad, `K>` forward, `K<` backward,
//!   `KH` halt, `R<nnnn>` speed in hundredths of an rpm
//!
//! The pump acknowledges nothing after the handshake, so pacing is the only
//! flow control: buffered commands sent with `wait = true` sleep for the command
//! interval afterwards. Ramps send with `wait = false` and pace themselves.
//!
//! # Example Usage
//!
//! ```no_run
//! use minipuls_control::hardware::minipuls::MinipulsDriver;
//!
//! #[tokio::main]
//! async fn main() -> minipuls_control::error::AppResult<()> {
//!     let mut pump = MinipulsDriver::open("/dev/ttyUSB0", 30, 19200).await?;
//!     pump.set_remote_mode().await?;
//!     pump.set_speed(12.5, true).await?;
//!     pump.start_forward().await?;
//!     pump.stop().await?;
//!     pump.disconnect().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::transport::Transport;
#[cfg(feature = "instrument_serial")]
use super::transport::{SerialSettings, SerialTransport};
use crate::config::{SerialConfig, TimingConfig};
use crate::error::{AppResult, PumpError};

/// Bus reset byte; deselects every unit.
pub const BUS_RESET: u8 = 0xFF;
/// Lowest speed the pump accepts, in rpm.
pub const MIN_RPM: f64 = 0.0;
/// Highest speed the pump accepts, in rpm.
pub const MAX_RPM: f64 = 48.0;

const DEFAULT_COMMAND_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Clamp a speed into the pump's range. NaN becomes 0.
pub fn clamp_rpm(rpm: f64) -> f64 {
    if rpm.is_nan() {
        MIN_RPM
    } else {
        rpm.clamp(MIN_RPM, MAX_RPM)
    }
}

/// Encode a speed command: `R` followed by `round(rpm * 100)`.
pub fn encode_speed(rpm: f64) -> String {
    format!("R{}", (clamp_rpm(rpm) * 100.0).round() as u32)
}

/// Frame a buffered command as `\n<text>\r`.
///
/// # Errors
/// [`PumpError::InputValidation`] for empty, non-ASCII or control-character text.
pub fn frame_command(text: &str) -> AppResult<Vec<u8>> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(PumpError::InputValidation(format!(
            "Command '{}' must be non-empty printable ASCII",
            text.escape_debug()
        )));
    }
    let mut frame = Vec::with_capacity(text.len() + 2);
    frame.push(b'\n');
    frame.extend_from_slice(text.as_bytes());
    frame.push(b'\r');
    Ok(frame)
}

/// Shared, live-adjustable command interval.
///
/// Cloned handles observe the same value, so the interval can be changed while
/// a run owns the driver. Readers sample it when they need it; a ramp already
/// in progress keeps the value it started with.
#[derive(Clone, Debug)]
pub struct CommandInterval {
    tx: Arc<watch::Sender<Duration>>,
}

impl CommandInterval {
    /// Handle holding `interval`.
    pub fn new(interval: Duration) -> Self {
        let (tx, _) = watch::channel(interval);
        Self { tx: Arc::new(tx) }
    }

    /// Current interval.
    pub fn get(&self) -> Duration {
        *self.tx.borrow()
    }

    /// Set the interval from seconds.
    ///
    /// # Errors
    /// [`PumpError::InputValidation`] for negative, non-finite or
    /// unrepresentable values.
    pub fn set_secs(&self, seconds: f64) -> AppResult<Duration> {
        let interval = Duration::try_from_secs_f64(seconds).map_err(|_| {
            PumpError::InputValidation(format!(
                "Command interval must be a non-negative number of seconds, got {}",
                seconds
            ))
        })?;
        self.tx.send_replace(interval);
        info!("Command interval set to: {}s", seconds);
        Ok(interval)
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.tx.subscribe()
    }
}

/// Whether commands reach a transport or are only logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverMode {
    /// Frames go to the transport
    Hardware,
    /// Commands are logged only
    Simulated,
}

/// Driver for one MINIPULS unit on a GSIOC bus.
pub struct MinipulsDriver {
    port: String,
    unit_id: u8,
    baud_rate: u32,
    read_timeout: Duration,
    reset_delay: Duration,
    mode: DriverMode,
    transport: Option<Box<dyn Transport>>,
    connected: bool,
    interval: CommandInterval,
}

impl std::fmt::Debug for MinipulsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinipulsDriver")
            .field("port", &self.port)
            .field("unit_id", &self.unit_id)
            .field("mode", &self.mode)
            .field("connected", &self.connected)
            .field("command_interval", &self.interval.get())
            .finish()
    }
}

impl MinipulsDriver {
    /// Create a disconnected hardware driver.
    ///
    /// # Arguments
    /// * `port` - Serial port path (e.g., "/dev/ttyUSB0" on Linux, "COM4" on Windows)
    /// * `unit_id` - GSIOC unit id of the pump (factory default 30)
    /// * `baud_rate` - Bus speed (19200 for GSIOC)
    pub fn new(port: impl Into<String>, unit_id: u8, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            unit_id,
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
            reset_delay: DEFAULT_RESET_DELAY,
            mode: DriverMode::Hardware,
            transport: None,
            connected: false,
            interval: CommandInterval::new(DEFAULT_COMMAND_INTERVAL),
        }
    }

    /// Create a driver that never touches a transport. `connect` always succeeds.
    pub fn simulated(unit_id: u8) -> Self {
        let mut driver = Self::new("simulated", unit_id, 19200);
        driver.mode = DriverMode::Simulated;
        driver
    }

    /// Build a driver from loaded settings.
    pub fn from_config(serial: &SerialConfig, timing: &TimingConfig) -> Self {
        let driver = if serial.simulate {
            Self::simulated(serial.unit_id)
        } else {
            Self::new(serial.port.clone(), serial.unit_id, serial.baud_rate)
        };
        driver
            .with_read_timeout(serial.read_timeout())
            .with_reset_delay(serial.reset_delay())
            .with_command_interval(timing.command_interval())
    }

    /// Open `port`, handshake with `unit_id`, and return the connected driver.
    pub async fn open(port: &str, unit_id: u8, baud_rate: u32) -> AppResult<Self> {
        let mut driver = Self::new(port, unit_id, baud_rate);
        driver.connect().await?;
        Ok(driver)
    }

    /// Initial command interval.
    pub fn with_command_interval(self, interval: Duration) -> Self {
        self.interval.tx.send_replace(interval);
        self
    }

    /// Handshake read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Pause after the bus-reset byte.
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// GSIOC unit id (0-127).
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Serial port name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Serial baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Hardware or simulated.
    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    /// Whether commands are only logged.
    pub fn is_simulated(&self) -> bool {
        self.mode == DriverMode::Simulated
    }

    /// Whether the handshake succeeded and no write has failed since.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Current inter-command delay.
    pub fn command_interval(&self) -> Duration {
        self.interval.get()
    }

    /// Shared handle to the command interval (survives moving the driver).
    pub fn interval_handle(&self) -> CommandInterval {
        self.interval.clone()
    }

    /// Change the command interval, in seconds.
    pub fn set_command_interval(&self, seconds: f64) -> AppResult<Duration> {
        self.interval.set_secs(seconds)
    }

    fn select_byte(&self) -> u8 {
        0x80 | self.unit_id
    }

    fn connection_failed(&self, reason: impl Into<String>) -> PumpError {
        PumpError::ConnectionFailed {
            port: self.port.clone(),
            unit_id: self.unit_id,
            reason: reason.into(),
        }
    }

    /// Connect to the configured unit.
    ///
    /// Simulation mode succeeds immediately. Otherwise the serial port is opened
    /// and the unit-select handshake performed (see [`Self::connect_via`]).
    pub async fn connect(&mut self) -> AppResult<()> {
        if self.connected {
            debug!(unit_id = self.unit_id, "Already connected");
            return Ok(());
        }

        if self.is_simulated() {
            info!(unit_id = self.unit_id, "Simulation mode: virtual connection established");
            self.connected = true;
            return Ok(());
        }

        #[cfg(feature = "instrument_serial")]
        {
            let settings = SerialSettings::new(self.port.clone(), self.baud_rate)
                .with_timeout(self.read_timeout);
            let transport =
                SerialTransport::open(settings).map_err(|e| self.connection_failed(e.to_string()))?;
            info!(port = %self.port, "Serial port opened");
            self.connect_via(Box::new(transport)).await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(PumpError::SerialFeatureDisabled)
        }
    }

    /// Perform the bus handshake over an already opened transport.
    ///
    /// Sends the bus reset, waits the reset delay, sends the unit-select byte and
    /// expects the identical byte back within the read timeout. On any failure
    /// the transport is closed and [`PumpError::ConnectionFailed`] returned.
    pub async fn connect_via(&mut self, mut transport: Box<dyn Transport>) -> AppResult<()> {
        self.mode = DriverMode::Hardware;
        let select = self.select_byte();
        info!(unit_id = self.unit_id, endpoint = %transport.describe(), "Connecting to unit");

        let outcome = async {
            transport.write_all(&[BUS_RESET]).await?;
            tokio::time::sleep(self.reset_delay).await;
            transport.write_all(&[select]).await?;
            transport.read_byte(self.read_timeout).await
        }
        .await;

        let failure = match outcome {
            Ok(Some(byte)) if byte == select => None,
            Ok(Some(byte)) => Some(format!(
                "expected {:02x} but received {:02x}",
                select, byte
            )),
            Ok(None) => Some(format!(
                "expected {:02x} but received nothing within {:?}",
                select, self.read_timeout
            )),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            warn!(unit_id = self.unit_id, "Connection failed: {}", reason);
            let _ = transport.close().await;
            self.connected = false;
            return Err(self.connection_failed(reason));
        }

        info!(unit_id = self.unit_id, "Successfully connected to pump");
        self.transport = Some(transport);
        self.connected = true;
        Ok(())
    }

    /// Release the unit and close the transport. Safe to call repeatedly.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        if self.is_simulated() {
            if self.connected {
                info!("Simulation mode: virtual connection closed");
            }
            self.connected = false;
            return Ok(());
        }

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.write_all(&[BUS_RESET]).await {
                warn!("Error during disconnect: {}", e);
            } else {
                tokio::time::sleep(self.reset_delay).await;
            }
            transport.close().await?;
            info!(port = %self.port, "Serial port closed");
        }
        self.connected = false;
        Ok(())
    }

    /// Send a buffered command.
    ///
    /// With `wait = true` the call returns only after the command interval has
    /// elapsed; with `wait = false` the caller owns pacing.
    ///
    /// # Errors
    /// - [`PumpError::NotConnected`] without a connection
    /// - [`PumpError::InputValidation`] for text that cannot be framed
    /// - [`PumpError::Transport`] if the write fails; the driver is then disconnected
    pub async fn send_command(&mut self, text: &str, wait: bool) -> AppResult<()> {
        if !self.connected {
            warn!(command = text, "Pump not connected");
            return Err(PumpError::NotConnected);
        }
        let frame = frame_command(text)?;

        match self.mode {
            DriverMode::Simulated => {
                info!(command = text, "SIM CMD >");
            }
            DriverMode::Hardware => {
                let transport = self.transport.as_mut().ok_or(PumpError::NotConnected)?;
                debug!(command = text, "Sending command");
                if let Err(e) = transport.write_all(&frame).await {
                    warn!(command = text, "Transport failure, dropping connection: {}", e);
                    if let Some(mut transport) = self.transport.take() {
                        let _ = transport.close().await;
                    }
                    self.connected = false;
                    return Err(e);
                }
            }
        }

        if wait {
            tokio::time::sleep(self.interval.get()).await;
        }
        Ok(())
    }

    /// Set the pump speed, clamped to 0–48 rpm.
    pub async fn set_speed(&mut self, rpm: f64, wait: bool) -> AppResult<()> {
        let clamped = clamp_rpm(rpm);
        if clamped != rpm {
            warn!("RPM value {} clamped to {}", rpm, clamped);
        }
        self.send_command(&encode_speed(clamped), wait).await
    }

    /// Start rotating forward (`K>`). Does not wait.
    pub async fn start_forward(&mut self) -> AppResult<()> {
        self.send_command("K>", false).await
    }

    /// Start rotating backward (`K<`). Does not wait.
    pub async fn start_backward(&mut self) -> AppResult<()> {
        self.send_command("K<", false).await
    }

    /// Halt the pump (`KH`). Does not wait.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.send_command("KH", false).await
    }

    /// Lock the front panel; the pump obeys the bus (`SR`).
    pub async fn set_remote_mode(&mut self) -> AppResult<()> {
        self.send_command("SR", true).await
    }

    /// Hand control back to the front panel (`SK`).
    pub async fn set_keypad_mode(&mut self) -> AppResult<()> {
        self.send_command("SK", true).await
    }
}
