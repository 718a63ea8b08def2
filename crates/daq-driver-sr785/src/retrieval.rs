//! Trace retrieval
//!
//! Issues a template's dump commands and assembles the decoded axes into a
//! [`TraceDataset`] per display. Either every requested axis decodes
//! completely or the call fails; no partial dataset is returned.

use crate::command::{Command, Response};
use crate::decoder::{decode_ascii_list, decode_ascii_value, decode_block};
use crate::protocol::unexpected_reply;
use crate::session::Session;
use crate::template::{DisplayDumps, DumpMode, DumpSpec, MeasurementTemplate};
use chrono::{DateTime, Utc};
use daq_core::data::{Sample, TraceDataset};
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::Transport;
use tracing::{debug, instrument};

/// Upper bound on a per-point count reply.
const MAX_POINTS: usize = 1 << 16;

/// Download and decode one axis.
pub fn fetch_axis<T: Transport>(session: &mut Session<T>, spec: &DumpSpec) -> AppResult<Vec<Sample>> {
    let command = spec.to_command();

    let samples = match spec.mode {
        DumpMode::Block => match session.send(&command)? {
            Response::Block { payload, header } => {
                decode_block(&payload, &header, spec.format, spec.endian, &spec.command)?
            }
            other => return Err(unexpected_reply(&spec.command, &other, "block")),
        },
        DumpMode::Ascii => {
            let text = session.query_text(&command)?;
            decode_ascii_list(&text, session.dialect(), &spec.command)?
        }
        DumpMode::PerPoint => fetch_per_point(session, spec)?,
    };

    debug!(
        "{:?} axis: {} points from '{}'",
        spec.axis,
        samples.len(),
        spec.command
    );
    Ok(samples.into_iter().map(|s| s.scaled(spec.scale)).collect())
}

fn fetch_per_point<T: Transport>(session: &mut Session<T>, spec: &DumpSpec) -> AppResult<Vec<Sample>> {
    let count_mnemonic = spec.count_command.as_deref().ok_or_else(|| DaqError::Decode {
        command: spec.command.clone(),
        reason: "per_point dump without count_command".into(),
    })?;

    let count_query = Command::scalar(count_mnemonic).args(&spec.args);
    let count = session.query_scalar(&count_query)?;
    if count < 0.0 || count.fract() != 0.0 || count > MAX_POINTS as f64 {
        return Err(DaqError::Decode {
            command: count_mnemonic.to_string(),
            reason: format!("point count {count} is not a valid length"),
        });
    }
    let count = count as usize;

    let mut samples = Vec::with_capacity(count);
    for index in 0..count {
        let query = Command::text(spec.command.as_str()).args(&spec.args).arg(index);
        let text = session.query_text(&query)?;
        samples.push(decode_ascii_value(&text, session.dialect(), &spec.command)?);
    }
    Ok(samples)
}

fn fetch_display<T: Transport>(
    session: &mut Session<T>,
    template: &MeasurementTemplate,
    dumps: &DisplayDumps,
    acquired_at: DateTime<Utc>,
) -> AppResult<TraceDataset> {
    let x = fetch_axis(session, &dumps.x)?;
    let y = fetch_axis(session, &dumps.y)?;

    let dataset = TraceDataset::from_axes(
        template.name.as_str(),
        dumps.x.units.clone().unwrap_or_default(),
        dumps.y.units.clone().unwrap_or_default(),
        x,
        y,
        acquired_at,
    )?;
    Ok(dataset.with_display(dumps.display))
}

/// Fetch both axes of the template's lowest display and pair them up.
#[instrument(skip(session, template), fields(template = %template.name), err)]
pub fn retrieve<T: Transport>(
    session: &mut Session<T>,
    template: &MeasurementTemplate,
) -> AppResult<TraceDataset> {
    fetch_display(session, template, &template.dumps.primary, Utc::now())
}

/// Fetch every display the template dumps, lowest display first.
///
/// All datasets carry the same timestamp.
#[instrument(skip(session, template), fields(template = %template.name), err)]
pub fn retrieve_all<T: Transport>(
    session: &mut Session<T>,
    template: &MeasurementTemplate,
) -> AppResult<Vec<TraceDataset>> {
    let acquired_at = Utc::now();
    template
        .dumps
        .iter()
        .map(|dumps| fetch_display(session, template, dumps, acquired_at))
        .collect()
}

/// Download whatever the displays currently show, without running a measurement.
///
/// The instrument must be idle.
pub fn read_current_trace<T: Transport>(
    session: &mut Session<T>,
    template: &MeasurementTemplate,
) -> AppResult<Vec<TraceDataset>> {
    session.ensure_idle("read trace")?;
    retrieve_all(session, template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{BlockHeaderFormat, Dialect};
    use crate::session::SessionInfo;
    use crate::sim::SimulatedInstrument;

    fn spec(yaml: &str) -> DumpSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_exponent_block_is_scaled_twice() {
        let sim = SimulatedInstrument::new();
        let handle = sim.handle();
        let mut reply = b"#14E-01".to_vec();
        reply.extend(100i16.to_le_bytes());
        reply.extend((-200i16).to_le_bytes());
        reply.push(b'\n');
        handle.respond_raw("DSPB?", reply);

        let dialect = Dialect {
            block_header: BlockHeaderFormat::DefiniteWithExponent,
            ..SimulatedInstrument::dialect()
        };
        let mut session = Session::with_transport(sim, dialect, SessionInfo::simulated());

        let y = spec("{ axis: y, command: \"DSPB?\", args: [0], format: int16, scale: 3.0 }");
        let samples = fetch_axis(&mut session, &y).unwrap();
        // header exponent 2^-1, then the template scale
        assert_eq!(samples, vec![Sample::Value(150.0), Sample::Value(-300.0)]);
        assert_eq!(handle.unread(), 0);
    }

    #[test]
    fn test_scale_overflow_becomes_marker() {
        let sim = SimulatedInstrument::new();
        sim.handle().respond("DSPY?", "1e300");
        let mut session = Session::simulated(sim);

        let y = spec("{ axis: y, command: \"DSPY?\", mode: ascii, scale: 1e10 }");
        assert_eq!(fetch_axis(&mut session, &y).unwrap(), vec![Sample::Overflow]);
    }

    #[test]
    fn test_per_point_count_must_be_whole() {
        let sim = SimulatedInstrument::sr785();
        sim.handle().respond("DSPN?", "2.5");
        let mut session = Session::simulated(sim);

        let x = spec("{ axis: x, command: \"DBIN?\", args: [0], mode: per_point, count_command: \"DSPN?\" }");
        let err = fetch_axis(&mut session, &x).unwrap_err();
        assert!(matches!(err, DaqError::Decode { .. }));
    }

    #[test]
    fn test_failed_display_fails_the_whole_download() {
        let yaml = r#"
name: t
trigger_command: STRT
dump_commands:
  - { axis: x, command: "DSPX?", args: [0] }
  - { axis: y, command: "DSPB?", args: [0] }
  - { axis: x, display: 1, command: "DSPX?", args: [1] }
  - { axis: y, display: 1, command: "DSPB?", args: [1], format: int16 }
"#;
        let template = MeasurementTemplate::from_yaml_str(yaml).unwrap();
        let sim = SimulatedInstrument::sr785();
        // odd length cannot hold int16 elements
        sim.handle().respond_block("DSPB? 1", vec![0u8; 5]);
        let mut session = Session::simulated(sim);

        assert!(retrieve_all(&mut session, &template).is_err());
        assert_eq!(retrieve(&mut session, &template).unwrap().display, 0);
    }
}
