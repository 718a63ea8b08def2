//! Custom error types for the analyzer stack.
//!
//! This module defines the primary error type, `DaqError`, shared by the transport,
//! the protocol engine, the measurement state machine and the trace decoder. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report failures
//! with enough context (command mnemonic, template parameter) for an operator to act on.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: The instrument cannot be reached (port open or handshake failed),
//!   or the session lost framing and must be reopened.
//! - **`Transport`**: Byte-level I/O failed after the write retry budget was spent.
//! - **`Protocol`**: A reply arrived but could not be interpreted as the expected kind.
//! - **`IncompleteTransfer`**: A block reply delivered fewer bytes than its header declared.
//! - **`Template`**: A measurement template is malformed or a value is out of range.
//! - **`Timeout`**: The instrument did not reach Idle within the poll budget.
//! - **`Conflict`**: The instrument is still busy when a new operation starts.
//! - **`Decode`**: A payload does not have the shape its header declares.
//! - **`InstrumentFault`**: The instrument itself reported an error status word.
//! - **`Parameter`**: Wraps any of the above and names the template parameter being applied.
//! - **`InvalidState`**: An operation was requested in the wrong measurement state.
//! - **`Configuration`**: Settings handed to the core fail semantic validation.
//!
//! Errors are never retried inside the core beyond the bounded poll loop; they
//! propagate to the caller with the offending command or parameter attached.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the analyzer error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for instrument control.
///
/// # Error Categories
///
/// 1. **Link Errors** - `Connection`, `Transport`
///    - Occur while opening the port or moving bytes
///    - Recovery: Check cabling and port settings, reconnect
///
/// 2. **Exchange Errors** - `Protocol`, `IncompleteTransfer`, `Decode`, `Timeout`, `Conflict`
///    - Occur during a command/response exchange or a long-running acquisition
///    - Recovery: The session has already been resynchronized; retry the whole measurement
///
/// 3. **Input Errors** - `Template`, `InvalidState`, `Configuration`
///    - Raised before any byte reaches the instrument
///    - Recovery: Fix the template or the calling code
#[derive(Error, Debug)]
pub enum DaqError {
    /// The instrument could not be reached.
    ///
    /// Occurs when the serial port cannot be opened, when the identify handshake
    /// gets no reply, or when a session lost framing and was marked desynchronized.
    ///
    /// **Error Type**: Permanent for this session.
    ///
    /// **Recovery Strategy**: Check the port name, cabling and instrument power, then reconnect.
    #[error("Connection error on '{port}': {reason}")]
    Connection {
        /// Port identity (device path, or simulator name)
        port: String,
        /// What went wrong
        reason: String,
    },

    /// Byte-level I/O failed.
    ///
    /// Occurs when a write keeps coming back short after the retry budget is spent,
    /// or when the operating system reports a read error.
    ///
    /// **Error Type**: Usually permanent (device unplugged).
    #[error("Transport error while sending '{command}': {reason}")]
    Transport {
        /// Mnemonic of the command being exchanged
        command: String,
        /// Underlying failure
        reason: String,
    },

    /// A reply could not be interpreted.
    ///
    /// Occurs when a scalar reply is not numeric, a status word is not an integer,
    /// a block reply does not start with the header marker, or an echo does not
    /// match the command that was sent.
    #[error("Protocol error for '{command}': {reason} (reply: {reply:?})")]
    Protocol {
        /// Mnemonic of the command whose reply was malformed
        command: String,
        /// Raw reply text (lossy UTF-8)
        reply: String,
        /// What was expected
        reason: String,
    },

    /// A block reply ended before the declared byte count arrived.
    ///
    /// Truncated data is never returned as success.
    ///
    /// **Recovery Strategy**: The engine drains the line before returning this error;
    /// retry the download or the whole measurement.
    #[error("Incomplete transfer for '{command}': expected {expected} bytes, received {received}")]
    IncompleteTransfer {
        /// Mnemonic of the dump command
        command: String,
        /// Bytes declared by the header or length policy
        expected: usize,
        /// Bytes actually received
        received: usize,
    },

    /// A measurement template is invalid.
    ///
    /// **Error Type**: Permanent - requires fixing the template file.
    ///
    /// Raised at load time, before any command is sent.
    #[error("Template error in '{template}'{}: {reason}", parameter.as_ref().map(|p| format!(" (parameter '{p}')")).unwrap_or_default())]
    Template {
        /// Template name
        template: String,
        /// Offending parameter, when the problem is local to one
        parameter: Option<String>,
        /// Description of the problem
        reason: String,
    },

    /// The instrument did not become idle in time.
    ///
    /// The instrument may still be busy; the next operation checks status first.
    #[error("Timeout waiting for '{operation}' after {waited:?}")]
    Timeout {
        /// Operation being waited on (usually the status query mnemonic)
        operation: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// The instrument is busy with an earlier operation.
    ///
    /// **Error Type**: Transient - resolves when the instrument finishes.
    ///
    /// **Recovery Strategy**: Wait for the running acquisition to finish, then retry.
    #[error("Instrument busy when starting '{operation}' (status: {status})")]
    Conflict {
        /// Operation that was refused
        operation: String,
        /// Status observed
        status: String,
    },

    /// A payload did not match the shape its header declared.
    #[error("Decode error for '{command}': {reason}")]
    Decode {
        /// Mnemonic of the dump command
        command: String,
        /// Description of the mismatch
        reason: String,
    },

    /// The instrument reported an error status word.
    #[error("Instrument reported error status {code} after '{command}'")]
    InstrumentFault {
        /// Command that observed the error
        command: String,
        /// Raw status code
        code: i64,
    },

    /// A template parameter could not be applied.
    #[error("Parameter '{parameter}' failed: {source}")]
    Parameter {
        /// Template parameter name
        parameter: String,
        /// Underlying failure
        #[source]
        source: Box<DaqError>,
    },

    /// Operation requested in the wrong measurement state.
    #[error("Cannot {operation} while measurement is {state}")]
    InvalidState {
        /// Requested operation
        operation: String,
        /// Current state label
        state: String,
    },

    /// Settings parsed but failed validation.
    ///
    /// Occurs when a caller-built value such as a poll configuration has a zero
    /// interval or a non-finite backoff.
    ///
    /// **Error Type**: Permanent - requires fixing the configuration values.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// File or OS I/O outside the instrument link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Build a [`DaqError::Template`] naming a parameter.
    pub fn template(
        template: impl Into<String>,
        parameter: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Template {
            template: template.into(),
            parameter: parameter.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Attach a template parameter name to an error.
    ///
    /// An error that already names a parameter is returned unchanged.
    pub fn for_parameter(self, parameter: impl Into<String>) -> Self {
        match self {
            Self::Parameter { .. } => self,
            other => Self::Parameter {
                parameter: parameter.into(),
                source: Box::new(other),
            },
        }
    }

    /// Whether retrying the whole measurement on the same session is reasonable.
    ///
    /// Connection and input errors need operator action; exchange errors leave the
    /// session resynchronized and may succeed on a second attempt.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Protocol { .. }
            | DaqError::IncompleteTransfer { .. }
            | DaqError::Timeout { .. }
            | DaqError::Conflict { .. }
            | DaqError::Decode { .. } => true,
            DaqError::Parameter { source, .. } => source.is_recoverable(),
            DaqError::Connection { .. }
            | DaqError::Transport { .. }
            | DaqError::Template { .. }
            | DaqError::InstrumentFault { .. }
            | DaqError::InvalidState { .. }
            | DaqError::Configuration(_)
            | DaqError::Io(_) => false,
        }
    }
}
