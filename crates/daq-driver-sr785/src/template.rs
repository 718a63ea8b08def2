//! Measurement templates
//!
//! A template is a YAML recipe: which parameters to set (in order), how to
//! trigger, how to tell when the acquisition is done, and which dump commands
//! fetch the X and Y axes of each display. Dump entries without a `display`
//! key belong to display 0; every display listed needs exactly one X and one Y
//! entry. Templates are validated completely at load time, so
//! a bad template never causes a partially configured instrument.
//!
//! ```yaml
//! name: spectrum
//! parameters:
//!   span:
//!     command: FSPN
//!     args: [2]
//!     value: 102400
//!     units: Hz
//!     valid_range: [0.195, 102400]
//!   window:
//!     command: FWIN
//!     args: [2]
//!     value: Hanning
//!     choices: { Uniform: 0, Flattop: 1, Hanning: 2, BMH: 3 }
//! trigger_command: STRT
//! completion:
//!   status: { command: "DSPS?", args: [1], idle_mask: 1 }
//!   progress: { command: "NAVG? 0", total: "FAVN? 0" }
//! post_commands: [ASCL 0]
//! dump_commands:
//!   - { axis: x, command: "DSPX?", args: [0], units: Hz }
//!   - { axis: y, command: "DSPB?", args: [0], format: float32, units: dBV }
//! ```

use crate::command::{BlockPolicy, Command, ReplyKind};
use crate::dialect::Dialect;
use crate::status::StatusRule;
use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

// =============================================================================
// Values
// =============================================================================

/// A scalar from the template file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// `true` / `false`, sent as 1 / 0
    Bool(bool),
    /// Any number
    Number(f64),
    /// Text, sent verbatim unless mapped through `choices`
    Text(String),
}

impl ParamValue {
    /// Numeric view, parsing text when possible.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(t) => t.trim().parse().ok(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            ParamValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(t) => f.write_str(t),
        }
    }
}

/// Accept numbers or strings in argument lists.
pub(crate) fn de_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<ParamValue>::deserialize(deserializer)?;
    Ok(values.iter().map(ToString::to_string).collect())
}

/// One mnemonic or several, each receiving the same arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    One(String),
    Many(Vec<String>),
}

impl CommandSpec {
    fn into_vec(self) -> Vec<String> {
        match self {
            CommandSpec::One(c) => vec![c],
            CommandSpec::Many(cs) => cs,
        }
    }
}

// =============================================================================
// Raw file layout
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTemplate {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    parameters: Mapping,
    sequence: Option<Vec<String>>,
    trigger_command: Option<String>,
    dump_commands: Option<Vec<Value>>,
    #[serde(default)]
    completion: Completion,
    #[serde(default)]
    pre_commands: Vec<String>,
    #[serde(default)]
    post_commands: Vec<String>,
    #[serde(default)]
    verify_each: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParameter {
    command: CommandSpec,
    #[serde(default, deserialize_with = "de_args")]
    args: Vec<String>,
    value: ParamValue,
    units: Option<String>,
    valid_range: Option<[f64; 2]>,
    choices: Option<BTreeMap<String, ParamValue>>,
}

// =============================================================================
// Validated template
// =============================================================================

/// One configured setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateParameter {
    /// Parameter name (key in the template)
    pub name: String,
    /// Mnemonics to send, in order
    pub commands: Vec<String>,
    /// Fixed leading arguments (e.g. display number)
    pub args: Vec<String>,
    /// Value as written in the template
    pub value: ParamValue,
    /// Wire form of the value after `choices` mapping
    pub wire_value: String,
    /// Units, informational
    pub units: Option<String>,
    /// Inclusive bounds the value was checked against
    pub valid_range: Option<(f64, f64)>,
}

impl TemplateParameter {
    /// Setting commands for this parameter.
    pub fn to_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .map(|mnemonic| {
                Command::set(mnemonic.as_str())
                    .args(&self.args)
                    .arg(&self.wire_value)
            })
            .collect()
    }

    /// Readback query for each mnemonic (`<MNEMONIC>? <args>`).
    pub fn to_queries(&self) -> Vec<Command> {
        self.commands
            .iter()
            .map(|mnemonic| Command::text(format!("{mnemonic}?")).args(&self.args))
            .collect()
    }
}

/// Trace axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Bin positions
    X,
    /// Measured values
    Y,
}

/// How a dump command returns its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    /// One binary block reply
    #[default]
    Block,
    /// One ASCII line of separated values
    Ascii,
    /// `count_command` gives N, then one query per point index
    PerPoint,
}

/// Binary element layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// IEEE-754 single precision
    #[default]
    Float32,
    /// Signed 16-bit integer
    Int16,
}

impl SampleFormat {
    /// Bytes per element.
    pub fn width(&self) -> usize {
        match self {
            SampleFormat::Float32 => 4,
            SampleFormat::Int16 => 2,
        }
    }
}

/// Byte order of binary elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    /// Least significant byte first (SR785 binary transfers)
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

fn default_scale() -> f64 {
    1.0
}

/// One axis retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpSpec {
    /// Which axis this fills
    pub axis: Axis,
    /// Display the axis belongs to
    #[serde(default)]
    pub display: u8,
    /// Dump query mnemonic
    pub command: String,
    /// Query arguments
    #[serde(default, deserialize_with = "de_args")]
    pub args: Vec<String>,
    /// Reply shape
    #[serde(default)]
    pub mode: DumpMode,
    /// Binary element layout
    #[serde(default)]
    pub format: SampleFormat,
    /// Binary byte order
    #[serde(default)]
    pub endian: Endian,
    /// Fixed payload length, for replies without a header
    pub length: Option<usize>,
    /// Point-count query for `per_point` mode (same args)
    pub count_command: Option<String>,
    /// Axis unit
    pub units: Option<String>,
    /// Multiplier to engineering units
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl DumpSpec {
    /// The dump query itself.
    pub fn to_command(&self) -> Command {
        let reply = match self.mode {
            DumpMode::Block => ReplyKind::Block(match self.length {
                Some(len) => BlockPolicy::Fixed(len),
                None => BlockPolicy::LengthPrefixed,
            }),
            DumpMode::Ascii => ReplyKind::Text,
            DumpMode::PerPoint => ReplyKind::Text,
        };
        Command::new(self.command.as_str(), reply).args(&self.args)
    }
}

/// Progress reporting while waiting for completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressSpec {
    /// Query line returning the current count (e.g. averages done)
    pub command: String,
    /// Query line returning the target count, asked once
    pub total: Option<String>,
}

/// How to detect the end of the acquisition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Completion {
    /// Status rule; the dialect default when absent
    pub status: Option<StatusRule>,
    /// Progress query
    pub progress: Option<ProgressSpec>,
}

/// X and Y dump specifications of one display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayDumps {
    /// Display number
    pub display: u8,
    /// X axis
    pub x: DumpSpec,
    /// Y axis
    pub y: DumpSpec,
}

/// Dump specifications for every display, lowest display first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceDumps {
    /// Lowest-numbered display
    pub primary: DisplayDumps,
    /// Remaining displays in ascending order
    pub secondary: Vec<DisplayDumps>,
}

impl TraceDumps {
    /// All displays in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &DisplayDumps> {
        std::iter::once(&self.primary).chain(&self.secondary)
    }

    /// Number of displays.
    pub fn len(&self) -> usize {
        1 + self.secondary.len()
    }

    /// Always false; a template has at least one display.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A validated measurement recipe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementTemplate {
    /// Template name, used as dataset source
    pub name: String,
    /// Free text
    pub description: Option<String>,
    /// Parameters in application order
    pub parameters: Vec<TemplateParameter>,
    /// Raw command line that starts the acquisition
    pub trigger_command: String,
    /// Axis retrieval
    pub dumps: TraceDumps,
    /// Completion detection
    pub completion: Completion,
    /// Raw command lines sent before configuration
    pub pre_commands: Vec<String>,
    /// Raw command lines sent once the acquisition is complete
    pub post_commands: Vec<String>,
    /// Query status after every parameter command
    pub verify_each: bool,
}

impl MeasurementTemplate {
    /// Parse and validate a YAML template.
    ///
    /// # Errors
    /// [`DaqError::Template`] naming the template and, when local to one, the
    /// offending parameter.
    pub fn from_yaml_str(text: &str) -> AppResult<Self> {
        Self::parse(text, None)
    }

    /// Read, parse and validate a template file.
    ///
    /// A template without `name` is named after the file stem.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::template(path.display().to_string(), None, format!("cannot read file: {e}"))
        })?;
        let stem = path.file_stem().and_then(|s| s.to_str());
        let template = Self::parse(&text, stem)?;
        debug!(
            "Loaded template '{}' from {} ({} parameters)",
            template.name,
            path.display(),
            template.parameters.len()
        );
        Ok(template)
    }

    fn parse(text: &str, fallback_name: Option<&str>) -> AppResult<Self> {
        let label = fallback_name.unwrap_or("<template>");
        let raw: RawTemplate = serde_yaml::from_str(text)
            .map_err(|e| DaqError::template(label, None, format!("invalid YAML: {e}")))?;

        let name = match raw.name.or_else(|| fallback_name.map(str::to_string)) {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(DaqError::template(label, None, "missing required key 'name'")),
        };
        let err = |parameter: Option<&str>, reason: String| {
            DaqError::template(name.as_str(), parameter, reason)
        };

        let trigger_command = match raw.trigger_command {
            Some(t) if !t.trim().is_empty() => t,
            Some(_) => return Err(err(None, "trigger_command is empty".into())),
            None => return Err(err(None, "missing required key 'trigger_command'".into())),
        };

        let Some(dump_values) = raw.dump_commands else {
            return Err(err(None, "missing required key 'dump_commands'".into()));
        };
        let dumps = validate_dumps(dump_values).map_err(|reason| err(None, reason))?;

        // Declared order
        let mut declared = Vec::with_capacity(raw.parameters.len());
        for (key, value) in raw.parameters {
            let param_name = match key {
                Value::String(name) => name,
                other => {
                    return Err(err(None, format!("parameter name {other:?} is not a string")))
                }
            };
            let raw_param: RawParameter = serde_yaml::from_value(value)
                .map_err(|e| err(Some(&param_name), e.to_string()))?;
            let param = validate_parameter(&param_name, raw_param)
                .map_err(|reason| err(Some(&param_name), reason))?;
            declared.push(param);
        }

        let parameters = match raw.sequence {
            None => declared,
            Some(sequence) => apply_sequence(declared, &sequence)
                .map_err(|(parameter, reason)| err(Some(&parameter), reason))?,
        };

        if let Some(status) = &raw.completion.status {
            if status.command.trim().is_empty() {
                return Err(err(None, "completion status command is empty".into()));
            }
        }

        Ok(Self {
            name: name.clone(),
            description: raw.description,
            parameters,
            trigger_command,
            dumps,
            completion: raw.completion,
            pre_commands: raw.pre_commands,
            post_commands: raw.post_commands,
            verify_each: raw.verify_each,
        })
    }

    /// Parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&TemplateParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Status rule used to detect completion.
    pub fn completion_rule(&self, dialect: &Dialect) -> StatusRule {
        self.completion
            .status
            .clone()
            .unwrap_or_else(|| dialect.status.clone())
    }

    /// The trigger as a command.
    pub fn trigger(&self, dialect: &Dialect) -> Command {
        dialect.parse_command(&self.trigger_command, ReplyKind::None)
    }
}

fn validate_parameter(name: &str, raw: RawParameter) -> Result<TemplateParameter, String> {
    let commands = raw.command.into_vec();
    if commands.is_empty() || commands.iter().any(|c| c.trim().is_empty()) {
        return Err("command must be a non-empty mnemonic or list of mnemonics".into());
    }

    let wire_value = match &raw.choices {
        Some(choices) => {
            let key = raw.value.to_string();
            match choices.get(&key) {
                Some(code) => code.to_string(),
                None => {
                    let known: Vec<&str> = choices.keys().map(String::as_str).collect();
                    return Err(format!(
                        "value '{}' is not one of [{}]",
                        key,
                        known.join(", ")
                    ));
                }
            }
        }
        None => raw.value.to_string(),
    };

    if let ParamValue::Number(n) = raw.value {
        if !n.is_finite() {
            return Err(format!("value {n} is not finite"));
        }
    }

    let valid_range = match raw.valid_range {
        Some([lo, hi]) => {
            if lo > hi {
                return Err(format!("valid_range [{lo}, {hi}] is inverted"));
            }
            let Some(v) = raw.value.as_f64() else {
                return Err(format!(
                    "value '{}' is not numeric but valid_range is set",
                    raw.value
                ));
            };
            if v < lo || v > hi {
                return Err(format!("value {v} outside valid_range [{lo}, {hi}]"));
            }
            Some((lo, hi))
        }
        None => None,
    };

    Ok(TemplateParameter {
        name: name.to_string(),
        commands,
        args: raw.args,
        value: raw.value,
        wire_value,
        units: raw.units,
        valid_range,
    })
}

fn apply_sequence(
    declared: Vec<TemplateParameter>,
    sequence: &[String],
) -> Result<Vec<TemplateParameter>, (String, String)> {
    let mut seen = HashSet::new();
    for name in sequence {
        if !seen.insert(name.as_str()) {
            return Err((name.clone(), "listed twice in sequence".into()));
        }
        if !declared.iter().any(|p| &p.name == name) {
            return Err((name.clone(), "listed in sequence but not defined".into()));
        }
    }
    if let Some(missing) = declared.iter().find(|p| !seen.contains(p.name.as_str())) {
        return Err((missing.name.clone(), "defined but missing from sequence".into()));
    }

    let mut by_name: Vec<Option<TemplateParameter>> = declared.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(sequence.len());
    for name in sequence {
        if let Some(slot) = by_name
            .iter_mut()
            .find(|p| p.as_ref().is_some_and(|p| &p.name == name))
        {
            if let Some(param) = slot.take() {
                ordered.push(param);
            }
        }
    }
    Ok(ordered)
}

fn validate_dumps(values: Vec<Value>) -> Result<TraceDumps, String> {
    let mut axes: BTreeMap<u8, (Option<DumpSpec>, Option<DumpSpec>)> = BTreeMap::new();

    for (index, value) in values.into_iter().enumerate() {
        let spec: DumpSpec = serde_yaml::from_value(value)
            .map_err(|e| format!("dump_commands[{index}]: {e}"))?;

        if spec.command.trim().is_empty() {
            return Err(format!("dump_commands[{index}]: command is empty"));
        }
        if spec.mode == DumpMode::PerPoint && spec.count_command.is_none() {
            return Err(format!(
                "dump_commands[{index}]: per_point mode needs count_command"
            ));
        }
        if let Some(len) = spec.length {
            if len % spec.format.width() != 0 {
                return Err(format!(
                    "dump_commands[{index}]: length {len} is not a multiple of {} bytes",
                    spec.format.width()
                ));
            }
        }
        if !spec.scale.is_finite() || spec.scale == 0.0 {
            return Err(format!(
                "dump_commands[{index}]: scale must be finite and non-zero"
            ));
        }

        let display = spec.display;
        let (x, y) = axes.entry(display).or_default();
        let slot = match spec.axis {
            Axis::X => x,
            Axis::Y => y,
        };
        if slot.is_some() {
            return Err(format!(
                "more than one {:?} axis dump for display {display}",
                spec.axis
            ));
        }
        *slot = Some(spec);
    }

    let mut displays = Vec::with_capacity(axes.len());
    for (display, pair) in axes {
        match pair {
            (Some(x), Some(y)) => displays.push(DisplayDumps { display, x, y }),
            (None, _) => {
                return Err(format!("dump_commands needs an x axis entry for display {display}"))
            }
            (_, None) => {
                return Err(format!("dump_commands needs a y axis entry for display {display}"))
            }
        }
    }

    let mut displays = displays.into_iter();
    let Some(primary) = displays.next() else {
        return Err("dump_commands needs an x and a y axis entry".into());
    };
    Ok(TraceDumps {
        primary,
        secondary: displays.collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECTRUM: &str = r#"
name: spectrum
parameters:
  display_format:
    command: DFMT
    value: 0
  coupling:
    command: [I1CP, I2CP]
    value: AC
    choices: { DC: 0, AC: 1 }
  span:
    command: FSPN
    args: [2]
    value: 102400
    units: Hz
    valid_range: [0.195, 102400]
  averages:
    command: FAVN
    args: [2]
    value: 10
trigger_command: STRT
dump_commands:
  - { axis: x, command: "DSPX?", args: [0], units: Hz }
  - { axis: y, command: "DSPB?", args: [0], units: dBV }
"#;

    fn with(body: &str) -> String {
        format!(
            "name: t\n{body}\ntrigger_command: STRT\ndump_commands:\n  - {{ axis: x, command: \"DSPX?\" }}\n  - {{ axis: y, command: \"DSPB?\" }}\n"
        )
    }

    #[test]
    fn test_parameters_keep_declared_order() {
        let t = MeasurementTemplate::from_yaml_str(SPECTRUM).unwrap();
        let names: Vec<_> = t.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["display_format", "coupling", "span", "averages"]);
    }

    #[test]
    fn test_commands_from_parameters() {
        let t = MeasurementTemplate::from_yaml_str(SPECTRUM).unwrap();
        let dialect = Dialect::default();

        let coupling = t.parameter("coupling").unwrap();
        let lines: Vec<_> = coupling
            .to_commands()
            .iter()
            .map(|c| String::from_utf8(dialect.encode(c)).unwrap())
            .collect();
        assert_eq!(lines, vec!["I1CP 1\n", "I2CP 1\n"]);

        let span = t.parameter("span").unwrap();
        assert_eq!(span.to_commands()[0].to_string(), "FSPN 2,102400");
        assert_eq!(span.to_queries()[0].to_string(), "FSPN? 2");
    }

    #[test]
    fn test_missing_trigger_command() {
        let yaml = "name: t\ndump_commands:\n  - { axis: x, command: \"DSPX?\" }\n  - { axis: y, command: \"DSPB?\" }\n";
        let err = MeasurementTemplate::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, DaqError::Template { .. }));
        assert!(err.to_string().contains("trigger_command"));
    }

    #[test]
    fn test_missing_dump_commands() {
        let err = MeasurementTemplate::from_yaml_str("name: t\ntrigger_command: STRT\n").unwrap_err();
        assert!(err.to_string().contains("dump_commands"));
    }

    #[test]
    fn test_value_outside_range_names_parameter() {
        let yaml = with(
            "parameters:\n  span:\n    command: FSPN\n    value: 200000\n    valid_range: [0, 102400]",
        );
        let err = MeasurementTemplate::from_yaml_str(&yaml).unwrap_err();
        match err {
            DaqError::Template {
                parameter, reason, ..
            } => {
                assert_eq!(parameter.as_deref(), Some("span"));
                assert!(reason.contains("outside valid_range"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_value_names_parameter() {
        let yaml = with("parameters:\n  span:\n    command: FSPN");
        let err = MeasurementTemplate::from_yaml_str(&yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("parameter 'span'"));
        assert!(msg.contains("value"));
    }

    #[test]
    fn test_unknown_choice() {
        let yaml = with(
            "parameters:\n  window:\n    command: FWIN\n    value: Gaussian\n    choices: { Uniform: 0, Hanning: 2 }",
        );
        let err = MeasurementTemplate::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("not one of [Hanning, Uniform]"));
    }

    #[test]
    fn test_sequence_reorders_and_checks() {
        let params = "parameters:\n  a: { command: AAAA, value: 1 }\n  b: { command: BBBB, value: 2 }";
        let yaml = with(&format!("{params}\nsequence: [b, a]"));
        let t = MeasurementTemplate::from_yaml_str(&yaml).unwrap();
        assert_eq!(t.parameters[0].name, "b");

        let yaml = with(&format!("{params}\nsequence: [b, c]"));
        let err = MeasurementTemplate::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("parameter 'c'"));

        let yaml = with(&format!("{params}\nsequence: [b]"));
        let err = MeasurementTemplate::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("missing from sequence"));
    }

    #[test]
    fn test_dump_axes_must_be_unique() {
        let yaml = "name: t\ntrigger_command: STRT\ndump_commands:\n  - { axis: y, command: A }\n  - { axis: y, command: B }\n";
        let err = MeasurementTemplate::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than one"));

        let yaml = "name: t\ntrigger_command: STRT\ndump_commands:\n  - { axis: x, command: A, mode: per_point }\n  - { axis: y, command: B }\n";
        let err = MeasurementTemplate::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("count_command"));
    }

    #[test]
    fn test_dumps_group_by_display() {
        let yaml = r#"
name: t
trigger_command: STRT
dump_commands:
  - { axis: y, display: 1, command: "DSPB?", args: [1], units: deg }
  - { axis: x, command: "DSPX?", args: [0] }
  - { axis: y, command: "DSPB?", args: [0] }
  - { axis: x, display: 1, command: "DSPX?", args: [1] }
"#;
        let template = MeasurementTemplate::from_yaml_str(yaml).unwrap();
        assert_eq!(template.dumps.len(), 2);
        assert_eq!(template.dumps.primary.display, 0);
        assert_eq!(template.dumps.primary.y.args, ["0"]);
        let second = &template.dumps.secondary[0];
        assert_eq!(second.display, 1);
        assert_eq!(second.y.units.as_deref(), Some("deg"));

        let displays: Vec<u8> = template.dumps.iter().map(|d| d.display).collect();
        assert_eq!(displays, [0, 1]);
    }

    #[test]
    fn test_display_without_both_axes_is_rejected() {
        let yaml = "name: t\ntrigger_command: STRT\ndump_commands:\n  - { axis: x, command: A }\n  - { axis: y, command: B }\n  - { axis: y, display: 1, command: C }\n";
        let err = MeasurementTemplate::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("x axis entry for display 1"));

        let yaml = "name: t\ntrigger_command: STRT\ndump_commands: []\n";
        assert!(MeasurementTemplate::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_value_formatting() {
        assert_eq!(ParamValue::Number(102400.0).to_string(), "102400");
        assert_eq!(ParamValue::Number(0.195).to_string(), "0.195");
        assert_eq!(ParamValue::Bool(true).to_string(), "1");
        assert_eq!(ParamValue::Text("10.0mV".into()).to_string(), "10.0mV");
    }

    #[test]
    fn test_from_file_uses_stem_as_fallback_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swept_sine.yaml");
        let body = "trigger_command: STRT\ndump_commands:\n  - { axis: x, command: A }\n  - { axis: y, command: B }\n";
        std::fs::write(&path, body).unwrap();

        let t = MeasurementTemplate::from_file(&path).unwrap();
        assert_eq!(t.name, "swept_sine");
        assert!(t.parameters.is_empty());
    }
}
