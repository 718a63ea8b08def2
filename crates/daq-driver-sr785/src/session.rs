//! Instrument session
//!
//! A [`Session`] is one open connection to the analyzer. It owns the transport
//! for its whole lifetime; dropping it closes the port. There is no internal
//! locking: one caller drives a session at a time, and a running
//! [`Measurement`](crate::measurement::Measurement) holds it by `&mut`.
//!
//! The analyzer's completion bits latch and clear when read, so a session
//! remembers which acquisition it started and has not yet seen finish.
//! [`Session::ensure_idle`] only asks the instrument about that acquisition
//! (or the dialect's non-latching `busy_check`); it never consumes a
//! completion bit on a fresh session.
//!
//! # Example
//!
//! ```rust,no_run
//! use daq_core::serial::SerialConfig;
//! use daq_driver_sr785::{Dialect, PollConfig, Session};
//! use std::time::Duration;
//!
//! let config = SerialConfig::new("/dev/ttyUSB0", 9600);
//! let mut session = Session::connect(&config, Dialect::default())?;
//! println!("Connected to {}", session.identify()?);
//!
//! session.reset(Duration::from_secs(12))?;
//! session.ensure_idle("configure")?;
//! # Ok::<(), daq_core::DaqError>(())
//! ```

use crate::command::{Command, Response};
use crate::dialect::Dialect;
use crate::protocol::{poll_status, unexpected_reply, ProtocolEngine};
use crate::sim::SimulatedInstrument;
use crate::status::{InstrumentStatus, PollConfig, StatusRule};
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::{DynTransport, SerialConfig, SerialTransport, Transport};
use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Identity and link settings of an open session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Port identity
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout
    pub timeout: Duration,
    /// Command echo mode
    pub echo: bool,
    /// Stalled writes tolerated per command
    pub write_retries: u32,
}

impl SessionInfo {
    /// Info for a serial link.
    pub fn from_config(config: &SerialConfig, dialect: &Dialect) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout,
            echo: dialect.echo,
            write_retries: config.write_retries,
        }
    }

    /// Info for an in-memory instrument.
    pub fn simulated() -> Self {
        Self {
            port: "sim".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_millis(1),
            echo: false,
            write_retries: 3,
        }
    }
}

/// One open connection to the analyzer.
pub struct Session<T: Transport = DynTransport> {
    engine: ProtocolEngine<T>,
    info: SessionInfo,
    /// Completion rule of an acquisition started but not yet seen idle
    outstanding: Option<StatusRule>,
}

impl Session<SerialTransport> {
    /// Open the serial port and perform the identify handshake.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if the dialect is invalid, the port cannot be
    /// opened, or the instrument does not answer the identify query.
    #[instrument(skip(config, dialect), fields(port = %config.port), err)]
    pub fn connect(config: &SerialConfig, dialect: Dialect) -> AppResult<Self> {
        dialect.validate().map_err(|reason| DaqError::Connection {
            port: config.port.clone(),
            reason: format!("invalid dialect: {reason}"),
        })?;
        let transport = SerialTransport::open(config)?;
        let info = SessionInfo::from_config(config, &dialect);
        Self::open(transport, dialect, info)
    }
}

impl Session<SimulatedInstrument> {
    /// Session over a simulated instrument, no handshake.
    pub fn simulated(sim: SimulatedInstrument) -> Self {
        Self::with_transport(sim, SimulatedInstrument::dialect(), SessionInfo::simulated())
    }
}

impl<T: Transport> Session<T> {
    /// Wrap an already open transport without any handshake.
    pub fn with_transport(transport: T, dialect: Dialect, info: SessionInfo) -> Self {
        let engine = ProtocolEngine::new(transport, dialect, info.timeout, info.write_retries);
        Self {
            engine,
            info,
            outstanding: None,
        }
    }

    /// Wrap a transport and perform the identify handshake.
    pub fn open(transport: T, dialect: Dialect, info: SessionInfo) -> AppResult<Self> {
        let mut session = Self::with_transport(transport, dialect, info);
        let identity = session.identify().map_err(|e| DaqError::Connection {
            port: session.info.port.clone(),
            reason: format!("identify handshake failed: {e}"),
        })?;
        info!("Connected to '{}' on {}", identity, session.info.port);
        Ok(session)
    }

    /// Link settings.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Wire constants.
    pub fn dialect(&self) -> &Dialect {
        self.engine.dialect()
    }

    /// True once the session lost framing and must be reopened.
    pub fn is_desynchronized(&self) -> bool {
        self.engine.is_desynchronized()
    }

    /// Send one command and return its decoded reply.
    pub fn send(&mut self, command: &Command) -> AppResult<Response> {
        self.engine.exchange(command)
    }

    /// Send a command and require a numeric reply.
    pub fn query_scalar(&mut self, command: &Command) -> AppResult<f64> {
        match self.send(command)? {
            Response::Scalar(value) => Ok(value),
            other => Err(unexpected_reply(&command.mnemonic, &other, "scalar")),
        }
    }

    /// Send a command and return the reply line verbatim.
    pub fn query_text(&mut self, command: &Command) -> AppResult<String> {
        match self.send(command)? {
            Response::Text(text) => Ok(text),
            other => Err(unexpected_reply(&command.mnemonic, &other, "text")),
        }
    }

    /// Query status with an explicit rule.
    pub fn query_status(&mut self, rule: &StatusRule) -> AppResult<InstrumentStatus> {
        self.engine.read_status(rule)
    }

    /// Query status with the dialect's default rule.
    pub fn status(&mut self) -> AppResult<InstrumentStatus> {
        let rule = self.dialect().status.clone();
        self.query_status(&rule)
    }

    /// Poll the default status rule until Idle.
    pub fn poll_until_idle(&mut self, poll: &PollConfig) -> AppResult<u32> {
        let rule = self.dialect().status.clone();
        self.poll_until_idle_with(&rule, poll, |_, _, _| Ok(()))
    }

    /// Record that an acquisition completing on `rule` has been started.
    pub fn begin_acquisition(&mut self, rule: &StatusRule) {
        debug!("Acquisition outstanding on {}", rule.command);
        self.outstanding = Some(rule.clone());
    }

    /// Completion rule of the acquisition still outstanding, if any.
    pub fn outstanding(&self) -> Option<&StatusRule> {
        self.outstanding.as_ref()
    }

    /// Poll `rule` until Idle, calling `on_poll` after each non-idle poll.
    ///
    /// The callback gets the session back, so it can issue progress queries
    /// between polls.
    #[instrument(skip(self, rule, poll, on_poll), fields(status = %rule.command), err)]
    pub fn poll_until_idle_with<F>(
        &mut self,
        rule: &StatusRule,
        poll: &PollConfig,
        on_poll: F,
    ) -> AppResult<u32>
    where
        F: FnMut(&mut Self, u32, InstrumentStatus) -> AppResult<()>,
    {
        let polls = poll_status(
            self,
            rule,
            poll,
            |session, rule| session.query_status(rule),
            on_poll,
        )?;
        if self.outstanding.as_ref() == Some(rule) {
            self.outstanding = None;
        }
        Ok(polls)
    }

    /// Fail with [`DaqError::Conflict`] unless the instrument is idle.
    ///
    /// Called before any new operation so that a measurement left running by
    /// an earlier timeout is never silently overlapped. Queries the dialect's
    /// `busy_check` when one is configured, then the completion rule of an
    /// outstanding acquisition. With neither, nothing is sent.
    pub fn ensure_idle(&mut self, operation: &str) -> AppResult<()> {
        if let Some(rule) = self.dialect().busy_check.clone() {
            self.require_idle(&rule, operation)?;
        }
        if let Some(rule) = self.outstanding.clone() {
            self.require_idle(&rule, operation)?;
            debug!("Outstanding acquisition on {} has finished", rule.command);
            self.outstanding = None;
        }
        Ok(())
    }

    fn require_idle(&mut self, rule: &StatusRule, operation: &str) -> AppResult<()> {
        match self.query_status(rule)? {
            InstrumentStatus::Idle => Ok(()),
            InstrumentStatus::Error(code) => Err(DaqError::InstrumentFault {
                command: rule.command.clone(),
                code,
            }),
            status => Err(DaqError::Conflict {
                operation: operation.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Ask the instrument to identify itself.
    pub fn identify(&mut self) -> AppResult<String> {
        let command = Command::text(self.dialect().identify_command.clone());
        self.query_text(&command)
    }

    /// Send the reset command and wait `settle` for the instrument to recover.
    #[instrument(skip(self), err)]
    pub fn reset(&mut self, settle: Duration) -> AppResult<()> {
        let command = Command::set(self.dialect().reset_command.clone());
        self.send(&command)?;
        self.outstanding = None;
        info!("Instrument reset, settling for {:?}", settle);
        thread::sleep(settle);
        Ok(())
    }

    /// Close the session, releasing the port.
    pub fn close(self) {
        info!("Closing session on {}", self.info.port);
        drop(self.engine.into_transport());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_idle_checks_only_outstanding_acquisition() {
        let sim = SimulatedInstrument::new();
        let handle = sim.handle();
        handle.status_sequence("DSPS?", [0, 1]);
        let mut session = Session::simulated(sim);

        session.ensure_idle("configure").unwrap();
        assert!(handle.commands().is_empty());

        let rule = StatusRule::default();
        session.begin_acquisition(&rule);
        let err = session.ensure_idle("configure").unwrap_err();
        assert!(matches!(err, DaqError::Conflict { .. }));
        assert_eq!(session.outstanding(), Some(&rule));

        session.ensure_idle("configure").unwrap();
        assert!(session.outstanding().is_none());
        assert_eq!(handle.count_of("DSPS?"), 2);
    }

    #[test]
    fn test_faulted_acquisition_is_reported() {
        let sim = SimulatedInstrument::new();
        sim.handle().status_sequence("DSPS?", [8]);
        let mut session = Session::simulated(sim);
        let rule = StatusRule {
            error_mask: 8,
            ..StatusRule::default()
        };
        session.begin_acquisition(&rule);

        let err = session.ensure_idle("read trace").unwrap_err();
        assert!(matches!(err, DaqError::InstrumentFault { code: 8, .. }));
    }

    #[test]
    fn test_reset_forgets_outstanding_acquisition() {
        let mut session = Session::simulated(SimulatedInstrument::new());
        session.begin_acquisition(&StatusRule::default());
        session.reset(Duration::ZERO).unwrap();
        assert!(session.outstanding().is_none());
    }
}
