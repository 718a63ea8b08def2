//! Serial Port Abstractions for the analyzer driver
//!
//! This module provides the byte-level [`Transport`] contract used by the protocol
//! engine, and [`SerialTransport`], the blocking RS-232 implementation built on the
//! `serialport` crate.
//!
//! # Contract
//!
//! - `write` may accept fewer bytes than offered; [`Transport::write_all_with_retry`]
//!   loops until everything is out or the retry budget is spent.
//! - `read` returns fewer bytes than requested (possibly zero) when the timeout
//!   elapses. A short read means "more data may follow", never end-of-stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use daq_core::serial::{SerialConfig, SerialTransport, Transport};
//! use std::time::Duration;
//!
//! let config = SerialConfig::new("/dev/ttyUSB0", 9600);
//! let mut port = SerialTransport::open(&config)?;
//! port.write_all_with_retry(b"*IDN?\n", config.write_retries, "*IDN?")?;
//! let mut buf = [0u8; 64];
//! let n = port.read(&mut buf, Duration::from_millis(500))?;
//! # Ok::<(), daq_core::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Transport Trait
// =============================================================================

/// Raw byte transport to the instrument.
///
/// Implemented by [`SerialTransport`] for real hardware and by the simulated
/// instrument in the driver crate for tests.
pub trait Transport: Send {
    /// Human-readable port identity used in error messages.
    fn describe(&self) -> String;

    /// Write some bytes, returning how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived before the timeout.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard anything buffered on the input side.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Flush buffered output to the wire.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Write all bytes, tolerating up to `retries` stalled or interrupted attempts.
    ///
    /// # Errors
    /// Returns [`DaqError::Transport`] naming `command` when the budget runs out or
    /// the OS reports a hard failure.
    fn write_all_with_retry(&mut self, bytes: &[u8], retries: u32, command: &str) -> AppResult<()> {
        let mut written = 0usize;
        let mut stalls = 0u32;

        while written < bytes.len() {
            match self.write(&bytes[written..]) {
                Ok(0) => stalls += 1,
                Ok(n) => written += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
                    ) =>
                {
                    stalls += 1
                }
                Err(e) => {
                    return Err(DaqError::Transport {
                        command: command.to_string(),
                        reason: e.to_string(),
                    })
                }
            }

            if stalls > retries {
                return Err(DaqError::Transport {
                    command: command.to_string(),
                    reason: format!(
                        "partial write: {} of {} bytes after {} retries",
                        written,
                        bytes.len(),
                        retries
                    ),
                });
            }
        }

        self.flush().map_err(|e| DaqError::Transport {
            command: command.to_string(),
            reason: format!("flush failed: {e}"),
        })
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Type-erased transport, for callers choosing hardware or simulation at runtime.
pub type DynTransport = Box<dyn Transport>;

// =============================================================================
// Port Configuration
// =============================================================================

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Flow control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Serial port settings.
///
/// Defaults match the SR785 rear-panel RS-232 port: 9600 baud, 8N1, no flow control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Flow control
    pub flow_control: FlowControl,
    /// Per-read timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Stalled write attempts tolerated before giving up
    pub write_retries: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            timeout: Duration::from_secs(1),
            write_retries: 3,
        }
    }
}

impl SerialConfig {
    /// Settings for `port` at `baud_rate`, everything else default.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Check values that would otherwise fail deep inside the OS call.
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("serial port name must not be empty".into());
        }
        if self.baud_rate == 0 {
            return Err("baud_rate must be positive".into());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("data_bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("stop_bits must be 1 or 2, got {}", self.stop_bits));
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".into());
        }
        Ok(())
    }
}

// =============================================================================
// Serial Transport
// =============================================================================

/// Blocking RS-232 transport.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    current_timeout: Duration,
}

impl SerialTransport {
    /// Open and configure the port.
    ///
    /// # Errors
    /// Returns [`DaqError::Connection`] if the settings are invalid or the OS refuses the port.
    pub fn open(config: &SerialConfig) -> AppResult<Self> {
        let connection_error = |reason: String| DaqError::Connection {
            port: config.port.clone(),
            reason,
        };

        config.validate().map_err(connection_error)?;

        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };
        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(config.timeout)
            .open()
            .map_err(|e| {
                connection_error(format!(
                    "failed to open at {} baud: {}",
                    config.baud_rate, e
                ))
            })?;

        let mut transport = Self {
            port,
            name: config.port.clone(),
            current_timeout: config.timeout,
        };

        // Stale bytes from a previous session would corrupt the first reply
        transport
            .port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| connection_error(format!("failed to clear buffers: {e}")))?;

        debug!(
            "Serial port '{}' opened at {} baud",
            config.port, config.baud_rate
        );
        Ok(transport)
    }
}

impl Transport for SerialTransport {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.port.write(bytes)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if timeout != self.current_timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
            self.current_timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("Serial port '{}' closed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `chunk` bytes per write and stalls on selected calls.
    struct StutteringPort {
        chunk: usize,
        stall_every: Option<usize>,
        calls: usize,
        written: Vec<u8>,
    }

    impl Transport for StutteringPort {
        fn describe(&self) -> String {
            "stutter".into()
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if let Some(every) = self.stall_every {
                if self.calls % every == 0 {
                    return Ok(0);
                }
            }
            let n = bytes.len().min(self.chunk);
            self.written.extend_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            Ok(0)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_writes_are_completed() {
        let mut port = StutteringPort {
            chunk: 3,
            stall_every: Some(2),
            calls: 0,
            written: Vec::new(),
        };
        port.write_all_with_retry(b"FSPN 2,102400\n", 10, "FSPN")
            .expect("write should complete");
        assert_eq!(port.written, b"FSPN 2,102400\n");
    }

    #[test]
    fn test_stalled_write_exhausts_budget() {
        let mut port = StutteringPort {
            chunk: 0,
            stall_every: None,
            calls: 0,
            written: Vec::new(),
        };
        let err = port
            .write_all_with_retry(b"STRT\n", 2, "STRT")
            .expect_err("write must fail");
        match err {
            DaqError::Transport { command, reason } => {
                assert_eq!(command, "STRT");
                assert!(reason.contains("0 of 5 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_serial_config_defaults_and_validation() {
        let config = SerialConfig::new("COM3", 19200);
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.data_bits, 8);
        assert!(config.validate().is_ok());

        let bad = SerialConfig {
            baud_rate: 0,
            ..SerialConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SerialConfig {
            data_bits: 9,
            ..SerialConfig::default()
        };
        assert!(bad.validate().unwrap_err().contains("data_bits"));
    }

    #[test]
    fn test_serial_config_humantime_roundtrip() {
        let json = r#"{"port": "/dev/ttyS1", "timeout": "250ms", "parity": "even"}"#;
        let config: SerialConfig = serde_json::from_str(json).expect("valid config");
        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let config = SerialConfig::new("/dev/does-not-exist-sr785", 9600);
        match SerialTransport::open(&config) {
            Err(DaqError::Connection { port, .. }) => assert_eq!(port, "/dev/does-not-exist-sr785"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("port should not open"),
        }
    }
}
