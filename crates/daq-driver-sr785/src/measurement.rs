//! Measurement State Machine
//!
//! Drives one templated measurement over a borrowed [`Session`]:
//!
//! ```text
//! Idle -> Configuring -> Triggered -> Acquiring -> Complete
//!   \___________\____________\___________\-> Error(fault)
//! ```
//!
//! - `configure` checks no earlier acquisition is still running, sends `pre_commands`, then every
//!   parameter's commands in template order. The first failure stops the
//!   sequence, names the parameter and moves to `Error`.
//! - `trigger` sends the trigger command and marks the acquisition outstanding
//!   on the session until its completion bit has been seen.
//! - `wait_complete` polls the completion rule (with optional progress
//!   reporting), then sends `post_commands`.
//! - `fetch_trace` downloads the axes of the first display and `fetch_traces`
//!   those of every display; both are only valid in `Complete`.
//!
//! Once in `Error`, every call fails with [`DaqError::InvalidState`] without
//! sending anything. The machine never re-triggers on its own; retrying means
//! building a new `Measurement`.
//!
//! # Example
//!
//! ```rust,no_run
//! use daq_driver_sr785::{Measurement, MeasurementTemplate, PollConfig, Session};
//! use daq_driver_sr785::sim::SimulatedInstrument;
//!
//! let template = MeasurementTemplate::from_file("templates/spectrum.yaml")?;
//! let mut session = Session::simulated(SimulatedInstrument::sr785());
//!
//! let mut measurement = Measurement::new(&mut session, &template);
//! measurement.run(&PollConfig::default())?;
//! let trace = measurement.fetch_trace()?;
//! println!("{} points", trace.len());
//! # Ok::<(), daq_core::DaqError>(())
//! ```

use crate::command::ReplyKind;
use crate::retrieval;
use crate::session::Session;
use crate::status::{InstrumentStatus, PollConfig};
use crate::template::MeasurementTemplate;
use daq_core::data::TraceDataset;
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::{DynTransport, Transport};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Why a measurement ended in `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Applying this template parameter failed
    Parameter(String),
    /// Completion was not reached in time
    Timeout,
    /// Instrument reported this status code
    Instrument(i64),
    /// Link or protocol failure outside parameter configuration
    Transport(String),
}

impl Fault {
    fn from_error(error: &DaqError) -> Self {
        match error {
            DaqError::Parameter { parameter, .. } => Fault::Parameter(parameter.clone()),
            DaqError::Timeout { .. } => Fault::Timeout,
            DaqError::InstrumentFault { code, .. } => Fault::Instrument(*code),
            other => Fault::Transport(other.to_string()),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Parameter(name) => write!(f, "parameter '{name}'"),
            Fault::Timeout => f.write_str("timeout"),
            Fault::Instrument(code) => write!(f, "instrument status {code}"),
            Fault::Transport(reason) => write!(f, "transport: {reason}"),
        }
    }
}

/// Where a measurement is.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementState {
    /// Nothing sent yet
    Idle,
    /// Parameters applied (or being applied)
    Configuring,
    /// Trigger sent
    Triggered,
    /// Polling for completion
    Acquiring,
    /// Data ready to fetch
    Complete,
    /// Stopped; see the fault
    Error(Fault),
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementState::Idle => f.write_str("idle"),
            MeasurementState::Configuring => f.write_str("configuring"),
            MeasurementState::Triggered => f.write_str("triggered"),
            MeasurementState::Acquiring => f.write_str("acquiring"),
            MeasurementState::Complete => f.write_str("complete"),
            MeasurementState::Error(fault) => write!(f, "failed ({fault})"),
        }
    }
}

/// One templated measurement in progress.
///
/// Holds the session mutably, so no other exchange can interleave with it.
pub struct Measurement<'a, T: Transport = DynTransport> {
    session: &'a mut Session<T>,
    template: &'a MeasurementTemplate,
    state: MeasurementState,
}

impl<'a, T: Transport> Measurement<'a, T> {
    /// Start in `Idle`.
    pub fn new(session: &'a mut Session<T>, template: &'a MeasurementTemplate) -> Self {
        Self {
            session,
            template,
            state: MeasurementState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> &MeasurementState {
        &self.state
    }

    /// Template being run.
    pub fn template(&self) -> &MeasurementTemplate {
        self.template
    }

    fn require(&self, operation: &str, expected: &MeasurementState) -> AppResult<()> {
        if &self.state == expected {
            Ok(())
        } else {
            Err(DaqError::InvalidState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    fn transition(&mut self, next: MeasurementState) {
        info!("Measurement '{}': {} -> {}", self.template.name, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: DaqError) -> DaqError {
        let fault = Fault::from_error(&error);
        warn!("Measurement '{}' failed: {}", self.template.name, error);
        self.transition(MeasurementState::Error(fault));
        error
    }

    /// Apply `pre_commands` and every parameter in template order.
    ///
    /// # Errors
    /// - [`DaqError::Conflict`] if the instrument is busy (state stays `Idle`)
    /// - [`DaqError::Parameter`] naming the parameter whose command failed
    #[instrument(skip(self), fields(template = %self.template.name), err)]
    pub fn configure(&mut self) -> AppResult<()> {
        self.require("configure", &MeasurementState::Idle)?;

        match self.session.ensure_idle("configure") {
            Ok(()) => {}
            Err(e @ DaqError::Conflict { .. }) => return Err(e),
            Err(e) => return Err(self.fail(e)),
        }

        self.transition(MeasurementState::Configuring);

        let template = self.template;
        for line in &template.pre_commands {
            let command = self.session.dialect().parse_command(line, ReplyKind::None);
            if let Err(e) = self.session.send(&command) {
                return Err(self.fail(e));
            }
        }

        let verify_rule = template
            .verify_each
            .then(|| template.completion_rule(self.session.dialect()));

        for param in &template.parameters {
            for command in param.to_commands() {
                let result = self.session.send(&command).and_then(|_| match &verify_rule {
                    Some(rule) => match self.session.query_status(rule)? {
                        InstrumentStatus::Error(code) => Err(DaqError::InstrumentFault {
                            command: command.mnemonic.clone(),
                            code,
                        }),
                        _ => Ok(()),
                    },
                    None => Ok(()),
                });

                if let Err(e) = result {
                    return Err(self.fail(e.for_parameter(param.name.as_str())));
                }
            }
            debug!("Applied '{}' = {}", param.name, param.wire_value);
        }

        Ok(())
    }

    /// Send the trigger command.
    #[instrument(skip(self), fields(template = %self.template.name), err)]
    pub fn trigger(&mut self) -> AppResult<()> {
        self.require("trigger", &MeasurementState::Configuring)?;

        let command = self.template.trigger(self.session.dialect());
        if let Err(e) = self.session.send(&command) {
            return Err(self.fail(e));
        }
        let rule = self.template.completion_rule(self.session.dialect());
        self.session.begin_acquisition(&rule);
        self.transition(MeasurementState::Triggered);
        Ok(())
    }

    /// Poll until the acquisition completes, then send `post_commands`.
    ///
    /// # Errors
    /// [`DaqError::Timeout`] or [`DaqError::InstrumentFault`]; the state moves
    /// to `Error` either way and the instrument may still be busy.
    #[instrument(skip(self, poll), fields(template = %self.template.name), err)]
    pub fn wait_complete(&mut self, poll: &PollConfig) -> AppResult<()> {
        self.require("wait for completion", &MeasurementState::Triggered)?;
        self.transition(MeasurementState::Acquiring);

        let template = self.template;
        let dialect = self.session.dialect();
        let rule = template.completion_rule(dialect);
        let progress = template.completion.progress.as_ref().map(|p| {
            (
                dialect.parse_command(&p.command, ReplyKind::Scalar),
                p.total
                    .as_deref()
                    .map(|t| dialect.parse_command(t, ReplyKind::Scalar)),
            )
        });

        let total = match progress.as_ref().and_then(|(_, total)| total.as_ref()) {
            Some(query) => match self.session.query_scalar(query) {
                Ok(total) => Some(total),
                Err(e) => return Err(self.fail(e)),
            },
            None => None,
        };

        let name = template.name.as_str();
        let result = self
            .session
            .poll_until_idle_with(&rule, poll, |session, polls, status| {
                if let Some((query, _)) = &progress {
                    let done = session.query_scalar(query)?;
                    match total {
                        Some(total) => info!("'{}' progress: {}/{} ({})", name, done, total, status),
                        None => info!("'{}' progress: {} ({})", name, done, status),
                    }
                } else {
                    debug!("'{}' still {} after {} polls", name, status, polls);
                }
                Ok(())
            });

        if let Err(e) = result {
            return Err(self.fail(e));
        }

        for line in &template.post_commands {
            let command = self.session.dialect().parse_command(line, ReplyKind::None);
            if let Err(e) = self.session.send(&command) {
                return Err(self.fail(e));
            }
        }

        self.transition(MeasurementState::Complete);
        Ok(())
    }

    /// `configure`, `trigger` and `wait_complete` in sequence.
    pub fn run(&mut self, poll: &PollConfig) -> AppResult<()> {
        self.configure()?;
        self.trigger()?;
        self.wait_complete(poll)
    }

    /// Download the trace.
    ///
    /// A failed download leaves the state at `Complete`, so the caller may try
    /// again on the resynchronized session.
    pub fn fetch_trace(&mut self) -> AppResult<TraceDataset> {
        self.require("fetch trace", &MeasurementState::Complete)?;
        retrieval::retrieve(self.session, self.template)
    }

    /// Download every display the template dumps, lowest display first.
    pub fn fetch_traces(&mut self) -> AppResult<Vec<TraceDataset>> {
        self.require("fetch trace", &MeasurementState::Complete)?;
        retrieval::retrieve_all(self.session, self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedInstrument;
    use crate::status::StatusRule;
    use std::time::Duration;
    use tracing_test::traced_test;

    const TEMPLATE: &str = r#"
name: unit
parameters:
  span: { command: FSPN, args: [2], value: 1000 }
trigger_command: STRT
dump_commands:
  - { axis: x, command: "DSPX?", args: [0] }
  - { axis: y, command: "DSPB?", args: [0] }
"#;

    fn poll() -> PollConfig {
        PollConfig::fixed(Duration::from_secs(1), Duration::from_millis(1))
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        let template = MeasurementTemplate::from_yaml_str(TEMPLATE).unwrap();
        let sim = SimulatedInstrument::sr785();
        let handle = sim.handle();
        let mut session = Session::simulated(sim);
        let mut m = Measurement::new(&mut session, &template);

        let err = m.trigger().unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));
        let err = m.fetch_trace().unwrap_err();
        assert_eq!(err.to_string(), "Cannot fetch trace while measurement is idle");
        assert_eq!(handle.bytes_written(), 0);
    }

    #[test]
    fn test_states_advance_through_run() {
        let template = MeasurementTemplate::from_yaml_str(TEMPLATE).unwrap();
        let mut session = Session::simulated(SimulatedInstrument::sr785());
        let mut m = Measurement::new(&mut session, &template);

        m.configure().unwrap();
        assert_eq!(m.state(), &MeasurementState::Configuring);
        m.trigger().unwrap();
        assert_eq!(m.state(), &MeasurementState::Triggered);
        m.wait_complete(&poll()).unwrap();
        assert_eq!(m.state(), &MeasurementState::Complete);
        assert_eq!(m.fetch_traces().unwrap().len(), 1);
        assert!(session.outstanding().is_none());
    }

    #[test]
    fn test_trigger_marks_acquisition_outstanding() {
        let template = MeasurementTemplate::from_yaml_str(TEMPLATE).unwrap();
        let mut session = Session::simulated(SimulatedInstrument::sr785());
        {
            let mut m = Measurement::new(&mut session, &template);
            m.configure().unwrap();
            m.trigger().unwrap();
        }
        assert_eq!(session.outstanding(), Some(&StatusRule::default()));
    }

    #[test]
    fn test_timeout_moves_to_error() {
        let template = MeasurementTemplate::from_yaml_str(TEMPLATE).unwrap();
        let sim = SimulatedInstrument::sr785();
        sim.handle().acquisition("STRT", "DSPS?", usize::MAX);
        let mut session = Session::simulated(sim);
        let mut m = Measurement::new(&mut session, &template);

        m.configure().unwrap();
        m.trigger().unwrap();
        let short = PollConfig::fixed(Duration::from_millis(10), Duration::from_millis(2));
        let err = m.wait_complete(&short).unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert_eq!(m.state(), &MeasurementState::Error(Fault::Timeout));
    }

    #[test]
    #[traced_test]
    fn test_progress_is_reported_while_acquiring() {
        let yaml = format!(
            "{TEMPLATE}completion:\n  progress: {{ command: \"NAVG? 0\", total: \"FAVN? 0\" }}\n"
        );
        let template = MeasurementTemplate::from_yaml_str(&yaml).unwrap();
        let sim = SimulatedInstrument::sr785();
        let handle = sim.handle();
        let mut session = Session::simulated(sim);
        let mut m = Measurement::new(&mut session, &template);

        m.run(&poll()).unwrap();
        assert_eq!(handle.count_of("FAVN?"), 1);
        assert_eq!(handle.count_of("NAVG?"), 3);
        assert!(logs_contain("progress: 4/10"));
        assert!(logs_contain("acquiring -> complete"));
    }
}
