//! Domain types shared by the engine, its observers and the daemon.
//!
//! A [`SequenceDefinition`] arrives from a transport as a structured document.
//! Each step is decoded once into a typed [`StepKind`] so the executor
//! dispatches on the variant, never on strings. Decoding never fails for a
//! single bad step: unknown step types and undecodable parameters become
//! [`StepKind::Unsupported`] and [`StepKind::Malformed`], which the executor
//! turns into step-local failures.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SequenceError;

/// Default tolerance for measurement steps (absolute).
pub const DEFAULT_TOLERANCE: f64 = 0.05;
/// Default delay step duration in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 100;
/// Default power supply current limit in amperes.
pub const DEFAULT_CURRENT_LIMIT: f64 = 1.0;

// ─── Sequence ────────────────────────────────────────────────────────

/// An ordered list of steps defining one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    /// Stable identifier
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default = "default_sequence_name")]
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,
    /// Instruments the sequence expects to be registered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_instruments: Vec<String>,
    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

fn default_sequence_name() -> String {
    "Unknown".to_owned()
}

fn default_version() -> String {
    "1.0".to_owned()
}

impl SequenceDefinition {
    /// Creates a sequence from already-decoded steps.
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: default_version(),
            required_instruments: Vec::new(),
            steps,
        }
    }

    /// Number of steps in the sequence.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Decodes a sequence from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, SequenceError> {
        serde_json::from_str(json).map_err(|e| SequenceError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Decodes a sequence from a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, SequenceError> {
        toml::from_str(toml_str).map_err(|e| SequenceError::ParseFailed {
            reason: e.to_string(),
        })
    }
}

// ─── StepType ────────────────────────────────────────────────────────

/// Step types understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Drive a power supply set-point and verify the readback
    PowerSupply,
    /// Acquire a value and compare it against an expectation
    Measurement,
    /// Wait for a fixed time
    Delay,
    /// Evaluate a boolean condition
    Validation,
}

impl StepType {
    /// Wire name of the step type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerSupply => "power_supply",
            Self::Measurement => "measurement",
            Self::Delay => "delay",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power_supply" => Ok(Self::PowerSupply),
            "measurement" => Ok(Self::Measurement),
            "delay" => Ok(Self::Delay),
            "validation" => Ok(Self::Validation),
            other => Err(other.to_owned()),
        }
    }
}

// ─── Step parameters ─────────────────────────────────────────────────

/// Parameters of a power supply step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSupplyParams {
    /// Voltage set-point in volts
    pub voltage: f64,
    /// Current limit in amperes
    pub current_limit: f64,
    /// Registry name of the supply to drive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Settling wait before the readback; engine default when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stabilization_ms: Option<u64>,
}

impl Default for PowerSupplyParams {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            current_limit: DEFAULT_CURRENT_LIMIT,
            instrument: None,
            stabilization_ms: None,
        }
    }
}

/// How a measurement tolerance is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceType {
    /// Same unit as the measured value
    #[default]
    Absolute,
    /// Percent of `|expected_value|`
    Percentage,
}

/// Parameters of a measurement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementParams {
    /// Quantity label, also the key of the recorded value
    pub measurement_type: String,
    /// Expected value
    pub expected_value: f64,
    /// Allowed deviation; configured or built-in default when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    /// Interpretation of `tolerance`
    pub tolerance_type: ToleranceType,
    /// Instrument channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Registry name of the instrument to read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
}

impl Default for MeasurementParams {
    fn default() -> Self {
        Self {
            measurement_type: "voltage".to_owned(),
            expected_value: 0.0,
            tolerance: None,
            tolerance_type: ToleranceType::Absolute,
            channel: None,
            instrument: None,
        }
    }
}

/// Parameters of a delay step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayParams {
    /// Requested wait in milliseconds
    pub delay_ms: u64,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

/// Parameters of a validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// Boolean expression over `variables`
    pub condition: String,
    /// Values the condition may reference by name
    pub variables: BTreeMap<String, Value>,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            condition: "true".to_owned(),
            variables: BTreeMap::new(),
        }
    }
}

// ─── StepKind / StepDefinition ───────────────────────────────────────

/// A step's type together with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    PowerSupply(PowerSupplyParams),
    Measurement(MeasurementParams),
    Delay(DelayParams),
    Validation(ValidationParams),
    /// The `type` tag names no known step type
    Unsupported {
        type_name: String,
        parameters: Map<String, Value>,
    },
    /// Known type whose parameters could not be decoded
    Malformed {
        step_type: StepType,
        reason: String,
        parameters: Map<String, Value>,
    },
}

impl StepKind {
    /// Decodes a raw `type` tag and parameter map into a typed step.
    pub fn decode(type_name: &str, parameters: Map<String, Value>) -> Self {
        let step_type = match type_name.parse::<StepType>() {
            Ok(step_type) => step_type,
            Err(type_name) => {
                return Self::Unsupported {
                    type_name,
                    parameters,
                };
            }
        };

        let value = Value::Object(parameters.clone());
        let decoded = match step_type {
            StepType::PowerSupply => serde_json::from_value(value).map(Self::PowerSupply),
            StepType::Measurement => serde_json::from_value(value).map(Self::Measurement),
            StepType::Delay => serde_json::from_value(value).map(Self::Delay),
            StepType::Validation => serde_json::from_value(value).map(Self::Validation),
        };

        decoded.unwrap_or_else(|e| Self::Malformed {
            step_type,
            reason: e.to_string(),
            parameters,
        })
    }

    /// The wire name of this step's type.
    pub fn type_name(&self) -> &str {
        match self {
            Self::PowerSupply(_) => StepType::PowerSupply.as_str(),
            Self::Measurement(_) => StepType::Measurement.as_str(),
            Self::Delay(_) => StepType::Delay.as_str(),
            Self::Validation(_) => StepType::Validation.as_str(),
            Self::Unsupported { type_name, .. } => type_name,
            Self::Malformed { step_type, .. } => step_type.as_str(),
        }
    }

    fn parameters(&self) -> Map<String, Value> {
        let encoded = match self {
            Self::PowerSupply(p) => serde_json::to_value(p),
            Self::Measurement(p) => serde_json::to_value(p),
            Self::Delay(p) => serde_json::to_value(p),
            Self::Validation(p) => serde_json::to_value(p),
            Self::Unsupported { parameters, .. } | Self::Malformed { parameters, .. } => {
                return parameters.clone();
            }
        };
        match encoded {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// One unit of work within a sequence.
///
/// On the wire parameters may be nested under `parameters` or written inline
/// next to `name` and `type`; nested values win on conflict. `timeout_seconds`
/// sits next to `type`, never among the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStep", into = "RawStep")]
pub struct StepDefinition {
    /// Step name; may be empty, see [`StepDefinition::display_name`]
    pub name: String,
    /// Typed step
    pub kind: StepKind,
    /// Time limit in seconds; the engine default applies when absent
    pub timeout_seconds: Option<f64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout_seconds: None,
        }
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// The step's own time limit. Zero, negative and non-finite values are
    /// ignored.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|limit| !limit.is_zero())
    }

    /// Name used in events; falls back to `Step <n>` for unnamed steps.
    pub fn display_name(&self, step_number: usize) -> String {
        if self.name.is_empty() {
            format!("Step {step_number}")
        } else {
            self.name.clone()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default = "unknown_type")]
    step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    parameters: Map<String, Value>,
    #[serde(flatten)]
    inline: Map<String, Value>,
}

fn unknown_type() -> String {
    "unknown".to_owned()
}

impl From<RawStep> for StepDefinition {
    fn from(raw: RawStep) -> Self {
        let mut parameters = raw.inline;
        parameters.extend(raw.parameters);
        Self {
            name: raw.name,
            kind: StepKind::decode(&raw.step_type, parameters),
            timeout_seconds: raw.timeout_seconds,
        }
    }
}

impl From<StepDefinition> for RawStep {
    fn from(step: StepDefinition) -> Self {
        Self {
            step_type: step.kind.type_name().to_owned(),
            parameters: step.kind.parameters(),
            timeout_seconds: step.timeout_seconds,
            name: step.name,
            inline: Map::new(),
        }
    }
}

// ─── Results ─────────────────────────────────────────────────────────

/// What a step handler concluded. `passed` has no default: every
/// constructor sets it.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    passed: bool,
    measurements: BTreeMap<String, Value>,
    error: Option<String>,
}

impl StepOutcome {
    /// Outcome decided by a check.
    pub fn evaluated(passed: bool, measurements: BTreeMap<String, Value>) -> Self {
        Self {
            passed,
            measurements,
            error: None,
        }
    }

    /// Passing outcome.
    pub fn pass(measurements: BTreeMap<String, Value>) -> Self {
        Self::evaluated(true, measurements)
    }

    /// Failing outcome with an error message.
    pub fn fail(error: impl Into<String>, measurements: BTreeMap<String, Value>) -> Self {
        Self {
            passed: false,
            measurements,
            error: Some(error.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Start-of-step bookkeeping, finalized into a [`StepResult`].
#[derive(Debug, Clone)]
pub struct StepShell {
    pub step_name: String,
    pub step_number: usize,
    pub step_type: String,
    pub start_time: DateTime<Utc>,
    started: Instant,
}

impl StepShell {
    /// Opens a result shell; the step's clock starts now.
    pub fn open(step: &StepDefinition, step_number: usize) -> Self {
        Self {
            step_name: step.display_name(step_number),
            step_number,
            step_type: step.kind.type_name().to_owned(),
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Closes the shell with the handler's outcome.
    pub fn finalize(self, outcome: StepOutcome) -> StepResult {
        StepResult {
            duration_seconds: self.started.elapsed().as_secs_f64(),
            end_time: Utc::now(),
            step_name: self.step_name,
            step_number: self.step_number,
            step_type: self.step_type,
            start_time: self.start_time,
            passed: outcome.passed,
            measurements: outcome.measurements,
            error: outcome.error,
        }
    }
}

/// Final record of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name as shown to observers
    pub step_name: String,
    /// 1-based position in the sequence
    pub step_number: usize,
    /// Wire name of the step type
    pub step_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Handler time only; event emission excluded
    pub duration_seconds: f64,
    pub passed: bool,
    /// Recorded values keyed by quantity
    pub measurements: BTreeMap<String, Value>,
    /// Failure reason for step-local failures
    pub error: Option<String>,
}

/// Collects `(key, value)` pairs into a measurement map.
pub fn measurements<const N: usize>(entries: [(&str, Value); N]) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_from(value: Value) -> StepDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn nested_parameters_decode_into_typed_variant() {
        let step = step_from(json!({
            "name": "Set 5V",
            "type": "power_supply",
            "parameters": { "voltage": 5, "current_limit": 0.5 }
        }));
        assert_eq!(step.name, "Set 5V");
        let StepKind::PowerSupply(params) = step.kind else {
            panic!("expected power supply step");
        };
        assert_eq!(params.voltage, 5.0);
        assert_eq!(params.current_limit, 0.5);
    }

    #[test]
    fn inline_parameters_are_accepted() {
        let step = step_from(json!({ "name": "Wait", "type": "delay", "delay_ms": 10 }));
        assert_eq!(step.kind, StepKind::Delay(DelayParams { delay_ms: 10 }));
    }

    #[test]
    fn nested_parameters_win_over_inline() {
        let step = step_from(json!({
            "type": "delay",
            "delay_ms": 10,
            "parameters": { "delay_ms": 20 }
        }));
        assert_eq!(step.kind, StepKind::Delay(DelayParams { delay_ms: 20 }));
    }

    #[test]
    fn missing_parameters_fall_back_to_defaults() {
        let power = step_from(json!({ "type": "power_supply" }));
        assert_eq!(power.kind, StepKind::PowerSupply(PowerSupplyParams::default()));

        let delay = step_from(json!({ "type": "delay" }));
        assert_eq!(delay.kind, StepKind::Delay(DelayParams { delay_ms: 100 }));

        let StepKind::Measurement(m) = step_from(json!({ "type": "measurement" })).kind else {
            panic!("expected measurement step");
        };
        assert_eq!(m.measurement_type, "voltage");
        assert_eq!(m.tolerance, None);
        assert_eq!(m.tolerance_type, ToleranceType::Absolute);

        let StepKind::Validation(v) = step_from(json!({ "type": "validation" })).kind else {
            panic!("expected validation step");
        };
        assert_eq!(v.condition, "true");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let step = step_from(json!({
            "type": "delay",
            "description": "settle",
            "parameters": { "delay_ms": 5, "jitter": true }
        }));
        assert_eq!(step.kind, StepKind::Delay(DelayParams { delay_ms: 5 }));
    }

    #[test]
    fn timeout_is_read_next_to_type() {
        let step = step_from(json!({
            "type": "measurement",
            "timeout_seconds": 2.5,
            "parameters": { "expected_value": 1.0 }
        }));
        assert_eq!(step.timeout(), Some(Duration::from_millis(2500)));
        assert!(matches!(step.kind, StepKind::Measurement(_)));

        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["timeout_seconds"], 2.5);
        assert!(value["parameters"].get("timeout_seconds").is_none());
    }

    #[test]
    fn unusable_timeouts_are_ignored() {
        let step = StepDefinition::new("Wait", StepKind::Delay(DelayParams::default()));
        assert_eq!(step.timeout(), None);
        for seconds in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert_eq!(step.clone().with_timeout_seconds(seconds).timeout(), None);
        }
    }

    #[test]
    fn unknown_type_becomes_unsupported() {
        let step = step_from(json!({ "name": "Scope", "type": "oscilloscope_capture" }));
        assert_eq!(step.kind.type_name(), "oscilloscope_capture");
        assert!(matches!(step.kind, StepKind::Unsupported { .. }));
    }

    #[test]
    fn missing_type_becomes_unsupported() {
        let step = step_from(json!({ "name": "No type" }));
        assert_eq!(step.kind.type_name(), "unknown");
    }

    #[test]
    fn wrong_parameter_type_becomes_malformed() {
        let step = step_from(json!({ "type": "delay", "delay_ms": "soon" }));
        let StepKind::Malformed {
            step_type, reason, ..
        } = step.kind
        else {
            panic!("expected malformed step");
        };
        assert_eq!(step_type, StepType::Delay);
        assert!(!reason.is_empty());
    }

    #[test]
    fn step_serializes_with_nested_parameters() {
        let step = StepDefinition::new("Wait", StepKind::Delay(DelayParams { delay_ms: 250 }));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "delay");
        assert_eq!(value["parameters"]["delay_ms"], 250);
        let back: StepDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn display_name_falls_back_to_position() {
        let step = StepDefinition::new("", StepKind::Delay(DelayParams::default()));
        assert_eq!(step.display_name(4), "Step 4");
    }

    #[test]
    fn sequence_from_json_applies_defaults() {
        let seq = SequenceDefinition::from_json_str(
            r#"{"id":"basic_power_test","steps":[{"type":"delay","delay_ms":10}]}"#,
        )
        .unwrap();
        assert_eq!(seq.name, "Unknown");
        assert_eq!(seq.version, "1.0");
        assert_eq!(seq.total_steps(), 1);
    }

    #[test]
    fn sequence_from_toml() {
        let seq = SequenceDefinition::from_toml_str(
            r#"
id = "basic_power_test"
name = "Basic power test"

[[steps]]
name = "Enable 5V rail"
type = "power_supply"
voltage = 5.0
current_limit = 1.0

[[steps]]
name = "Check rail"
type = "measurement"
[steps.parameters]
measurement_type = "voltage"
expected_value = 5.0
tolerance = 0.1
"#,
        )
        .unwrap();
        assert_eq!(seq.total_steps(), 2);
        assert!(matches!(seq.steps[0].kind, StepKind::PowerSupply(_)));
        let StepKind::Measurement(m) = &seq.steps[1].kind else {
            panic!("expected measurement step");
        };
        assert_eq!(m.tolerance, Some(0.1));
    }

    #[test]
    fn sequence_parse_error_is_reported() {
        let err = SequenceDefinition::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, SequenceError::ParseFailed { .. }));
    }

    #[test]
    fn shell_finalize_copies_outcome() {
        let step = StepDefinition::new("Check", StepKind::Validation(ValidationParams::default()));
        let shell = StepShell::open(&step, 2);
        let result = shell.finalize(StepOutcome::fail(
            "condition false",
            measurements([("condition_evaluated", json!("x > 1"))]),
        ));
        assert_eq!(result.step_number, 2);
        assert_eq!(result.step_type, "validation");
        assert!(!result.passed);
        assert_eq!(result.error.as_deref(), Some("condition false"));
        assert!(result.end_time >= result.start_time);
        assert!(result.duration_seconds >= 0.0);
    }
}
