//! `sr785` command-line entry point
//!
//! Runs templated measurements on an SR785 and writes the results to disk:
//!
//! ```bash
//! sr785 --config config/sr785.toml run templates/spectrum.yaml
//! sr785 --port /dev/ttyS1 dump templates/spectrum.yaml
//! sr785 --simulate run templates/swept_sine.yaml --json
//! ```
//!
//! Instrument I/O is blocking, so each command runs on a blocking worker while
//! the async main task watches for Ctrl-C. An interrupt is reported and the
//! worker is allowed to finish its current exchange; bytes in flight are never
//! abandoned mid-command.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use daq_core::serial::{DynTransport, SerialTransport};
use daq_core::TraceDataset;
use daq_driver_sr785::sim::SimulatedInstrument;
use daq_driver_sr785::{
    read_back, read_current_trace, Measurement, MeasurementTemplate, ParameterReading, Session,
    SessionInfo,
};
use sr785_daq::config::Settings;
use sr785_daq::{logging, storage};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sr785")]
#[command(about = "Templated measurements and trace download for the SR785 analyzer", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overriding the settings
    #[arg(long, global = true)]
    port: Option<String>,

    /// Use the built-in simulated instrument instead of a serial port
    #[arg(long, global = true, conflicts_with = "port")]
    simulate: bool,

    /// Output directory, overriding the settings
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Configure, trigger, wait and download one measurement
    Run {
        /// Measurement template (YAML)
        template: PathBuf,

        /// Also export the trace as JSON
        #[arg(long)]
        json: bool,

        /// Skip the parameter readback file
        #[arg(long)]
        no_params: bool,
    },

    /// Download the trace currently on screen, using a template's dump settings
    Dump {
        /// Measurement template (YAML)
        template: PathBuf,

        /// Also export the trace as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read back a template's parameters from the instrument
    Params {
        /// Measurement template (YAML)
        template: PathBuf,
    },

    /// Print the instrument identification string
    Identify,

    /// Reset the instrument to its power-on state
    Reset {
        /// Seconds to wait for the instrument to recover
        #[arg(long, default_value = "12")]
        settle: u64,
    },

    /// Print the instrument status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        settings.connection.port = port;
    }
    if let Some(output) = cli.output {
        settings.output.directory = output;
    }
    logging::init_from_settings(&settings)?;

    let simulate = cli.simulate;
    let command = cli.command;
    let mut worker = tokio::task::spawn_blocking(move || execute(&settings, simulate, command));

    tokio::select! {
        joined = &mut worker => joined.context("instrument worker panicked")?,
        _ = signal::ctrl_c() => {
            warn!("Interrupt received; waiting for the current exchange to finish");
            eprintln!("Interrupted. Waiting for the instrument exchange in progress...");
            match worker.await.context("instrument worker panicked")? {
                Ok(()) => bail!("interrupted after the operation completed"),
                Err(e) => Err(e.context("interrupted")),
            }
        }
    }
}

fn open_session(settings: &Settings, simulate: bool) -> Result<Session> {
    if simulate {
        info!("Using the simulated SR785");
        let transport: DynTransport = Box::new(SimulatedInstrument::sr785());
        return Ok(Session::open(
            transport,
            SimulatedInstrument::dialect(),
            SessionInfo::simulated(),
        )?);
    }

    let transport: DynTransport = Box::new(SerialTransport::open(&settings.connection)?);
    let info = SessionInfo::from_config(&settings.connection, &settings.dialect);
    Session::open(transport, settings.dialect.clone(), info)
        .with_context(|| format!("failed to connect on {}", settings.connection.port))
}

fn load_template(path: &Path) -> Result<MeasurementTemplate> {
    MeasurementTemplate::from_file(path)
        .with_context(|| format!("failed to load template {}", path.display()))
}

fn execute(settings: &Settings, simulate: bool, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            template,
            json,
            no_params,
        } => {
            let template = load_template(&template)?;
            let mut session = open_session(settings, simulate)?;

            let traces = {
                let mut measurement = Measurement::new(&mut session, &template);
                measurement.run(&settings.polling)?;
                measurement.fetch_traces()?
            };
            let params = if no_params {
                None
            } else {
                Some(read_back(&mut session, &template)?)
            };
            session.close();

            save(settings, &template.name, &traces, params.as_deref(), json)
        }
        Commands::Dump { template, json } => {
            let template = load_template(&template)?;
            let mut session = open_session(settings, simulate)?;
            let traces = read_current_trace(&mut session, &template)?;
            session.close();
            save(settings, &template.name, &traces, None, json)
        }
        Commands::Params { template } => {
            let template = load_template(&template)?;
            let mut session = open_session(settings, simulate)?;
            let readings = read_back(&mut session, &template)?;
            session.close();

            for reading in &readings {
                println!("{:<20} {:<16} {}", reading.name, reading.query, reading.reply);
            }
            let stem = storage::file_stem(&template.name, Utc::now());
            let path = storage::write_parameters(
                &settings.output.directory,
                &stem,
                &template.name,
                &readings,
                settings.output.delimiter,
            )?;
            println!("Parameters written to {}", path.display());
            Ok(())
        }
        Commands::Identify => {
            let mut session = open_session(settings, simulate)?;
            println!("{}", session.identify()?);
            Ok(())
        }
        Commands::Reset { settle } => {
            let mut session = open_session(settings, simulate)?;
            session.reset(Duration::from_secs(settle))?;
            println!("Instrument reset");
            Ok(())
        }
        Commands::Status => {
            let mut session = open_session(settings, simulate)?;
            println!("{}", session.status()?);
            Ok(())
        }
    }
}

fn save(
    settings: &Settings,
    name: &str,
    traces: &[TraceDataset],
    params: Option<&[ParameterReading]>,
    json: bool,
) -> Result<()> {
    let dir = &settings.output.directory;
    let delimiter = settings.output.delimiter;
    let acquired_at = traces.first().map_or_else(Utc::now, |t| t.acquired_at);
    let stem = storage::file_stem(name, acquired_at);

    let path = storage::write_traces(dir, &stem, traces, delimiter)?;
    for trace in traces {
        println!(
            "Display {}: {} points ({} markers)",
            trace.display,
            trace.len(),
            trace.marker_count()
        );
    }
    println!("Data written to {}", path.display());

    if let Some(params) = params {
        let path = storage::write_parameters(dir, &stem, name, params, delimiter)?;
        println!("Parameters written to {}", path.display());
    }
    if json {
        let path = match traces {
            [single] => storage::write_json(dir, &stem, single)?,
            all => storage::write_json(dir, &stem, all)?,
        };
        println!("JSON written to {}", path.display());
    }
    Ok(())
}
