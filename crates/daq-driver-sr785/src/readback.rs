//! Parameter readback
//!
//! Queries each template parameter back from the instrument (`<MNEMONIC>? <args>`)
//! so the applied settings can be stored next to the trace.

use crate::session::Session;
use crate::template::MeasurementTemplate;
use daq_core::error::AppResult;
use daq_core::serial::Transport;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::{debug, instrument};

#[allow(clippy::expect_used)]
static LEADING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)").expect("Invalid number regex")
});

/// One parameter as reported by the instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterReading {
    /// Template parameter name
    pub name: String,
    /// Query that was sent
    pub query: String,
    /// Raw reply text
    pub reply: String,
    /// Leading number of the reply, if any
    pub value: Option<f64>,
}

/// Leading numeric value of a reply such as `"102400, 2"` or `"1.0E+3 Hz"`.
pub fn leading_number(reply: &str) -> Option<f64> {
    LEADING_NUMBER
        .captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Read every parameter of `template` back, in template order.
///
/// Parameters with several commands produce one reading per command.
#[instrument(skip(session, template), fields(template = %template.name), err)]
pub fn read_back<T: Transport>(
    session: &mut Session<T>,
    template: &MeasurementTemplate,
) -> AppResult<Vec<ParameterReading>> {
    let mut readings = Vec::new();
    for param in &template.parameters {
        for query in param.to_queries() {
            let reply = session
                .query_text(&query)
                .map_err(|e| e.for_parameter(param.name.as_str()))?;
            debug!("{} -> {:?}", query, reply);
            readings.push(ParameterReading {
                name: param.name.clone(),
                query: query.to_string(),
                value: leading_number(&reply),
                reply,
            });
        }
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number("102400"), Some(102400.0));
        assert_eq!(leading_number(" -3.5e2,1"), Some(-350.0));
        assert_eq!(leading_number(".25 V"), Some(0.25));
        assert_eq!(leading_number("HANNING"), None);
        assert_eq!(leading_number(""), None);
    }
}
