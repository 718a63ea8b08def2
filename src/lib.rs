//! # SR785 DAQ
//!
//! Application layer for the SR785 dynamic signal analyzer. The instrument
//! driver lives in `daq-driver-sr785` and the shared types in `daq-core`; this
//! crate re-exports both and adds what a command-line run needs around them.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered [`Settings`](config::Settings) (defaults, TOML file,
//!   `SR785_` environment variables) loaded with Figment.
//! - **`logging`**: tracing subscriber setup driven by the settings.
//! - **`storage`**: data, parameter and JSON files for a finished measurement.
//! - **`driver`**: the re-exported `daq-driver-sr785` crate; `daq_core` is
//!   re-exported under its own name.
//!
//! A typical run:
//!
//! ```no_run
//! use sr785_daq::config::Settings;
//! use sr785_daq::driver::{read_back, Measurement, MeasurementTemplate, Session};
//! use sr785_daq::storage;
//!
//! let settings = Settings::load(None)?;
//! let template = MeasurementTemplate::from_file("templates/spectrum.yaml")?;
//! let mut session = Session::connect(&settings.connection, settings.dialect.clone())?;
//!
//! let trace = {
//!     let mut measurement = Measurement::new(&mut session, &template);
//!     measurement.run(&settings.polling)?;
//!     measurement.fetch_trace()?
//! };
//! let params = read_back(&mut session, &template)?;
//!
//! let stem = storage::file_stem(&template.name, trace.acquired_at);
//! let dir = &settings.output.directory;
//! storage::write_dataset(dir, &stem, &trace, settings.output.delimiter)?;
//! storage::write_parameters(dir, &stem, &template.name, &params, settings.output.delimiter)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod logging;
pub mod storage;

pub use daq_core;
pub use daq_driver_sr785 as driver;

pub use daq_core::{AppResult, DaqError, Sample, TraceDataset};
