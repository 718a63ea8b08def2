//! SR785 dynamic signal analyzer driver.
//!
//! This crate controls the analyzer over RS-232:
//! - a command/response protocol engine that frames ASCII commands, reads
//!   scalar, text and binary block replies, and resynchronizes after errors
//! - YAML measurement templates and a state machine that applies them,
//!   triggers, and waits for completion
//! - trace download and decoding (binary blocks, ASCII lists, or per-point)
//!
//! Vendor differences (terminators, block header grammar, status bits, sentinel
//! tokens) live in [`Dialect`] rather than in code.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_core::serial::SerialConfig;
//! use daq_driver_sr785::{Dialect, Measurement, MeasurementTemplate, PollConfig, Session};
//!
//! let template = MeasurementTemplate::from_file("templates/spectrum.yaml")?;
//! let mut session = Session::connect(&SerialConfig::new("/dev/ttyUSB0", 9600), Dialect::default())?;
//!
//! let mut measurement = Measurement::new(&mut session, &template);
//! measurement.run(&PollConfig::default())?;
//! let trace = measurement.fetch_trace()?;
//! # Ok::<(), daq_core::DaqError>(())
//! ```

pub mod command;
pub mod decoder;
pub mod dialect;
pub mod measurement;
pub mod protocol;
pub mod readback;
pub mod retrieval;
pub mod session;
pub mod sim;
pub mod status;
pub mod template;

pub use command::{BlockPolicy, Command, ReplyKind, Response};
pub use dialect::{BlockHeader, BlockHeaderFormat, Dialect};
pub use measurement::{Fault, Measurement, MeasurementState};
pub use protocol::ProtocolEngine;
pub use readback::{read_back, ParameterReading};
pub use retrieval::{read_current_trace, retrieve, retrieve_all};
pub use session::{Session, SessionInfo};
pub use status::{InstrumentStatus, PollConfig, StatusRule};
pub use template::{
    DisplayDumps, DumpMode, DumpSpec, MeasurementTemplate, ParamValue, TemplateParameter, TraceDumps,
};
