//! `daq-core`
//!
//! Core types shared by the SR785 driver and the application layer.
//!
//! ## Modules
//!
//! - [`error`]: [`DaqError`](error::DaqError), the single error type for the stack
//! - [`serial`]: the byte-level [`Transport`](serial::Transport) contract and the
//!   blocking RS-232 implementation
//! - [`data`]: decoded trace output ([`TraceDataset`](data::TraceDataset))
//!
//! Everything here is synchronous. The instrument link is half-duplex, so a
//! session performs one exchange at a time on the calling thread.

pub mod data;
pub mod error;
pub mod serial;

pub use data::{Sample, TraceDataset, TracePoint};
pub use error::{AppResult, DaqError};
pub use serial::{DynTransport, SerialConfig, SerialTransport, Transport};
