//! Step executor: one handler per step type.
//!
//! Handlers report expected conditions (out-of-tolerance readings, safety
//! violations, bad parameters, step-level instrument errors) as failed
//! [`StepOutcome`]s. Only fatal instrument errors leave as `Err`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use testbench_core::config::{SafetyConfig, TestbenchConfig};
use testbench_core::error::InstrumentError;
use testbench_core::types::{
    DEFAULT_TOLERANCE, DelayParams, MeasurementParams, PowerSupplyParams, StepDefinition, StepKind,
    StepOutcome, ToleranceType, ValidationParams, measurements,
};

use crate::backend::{InstrumentBackend, MeasurementRequest, PowerSetpoint};
use crate::expr;

/// Largest relative readback error a power step accepts.
pub const POWER_READBACK_TOLERANCE: f64 = 0.01;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Default settling wait after applying power
    pub power_stabilization: Duration,
    /// Settling wait before a measurement read
    pub measurement_settle: Duration,
    /// Upper bound for a delay step
    pub max_delay: Duration,
    pub safety: SafetyConfig,
    /// Default absolute tolerance per measurement type
    pub tolerances: BTreeMap<String, f64>,
}

impl ExecutorConfig {
    pub fn from_config(config: &TestbenchConfig) -> Self {
        Self {
            power_stabilization: config.engine.power_stabilization(),
            measurement_settle: config.engine.measurement_settle(),
            max_delay: Duration::from_millis(config.engine.max_delay_ms),
            safety: config.safety.clone(),
            tolerances: config.tolerances.clone(),
        }
    }
}

impl ExecutorConfig {
    /// Configured tolerance for a measurement type, if any.
    pub fn tolerance_for(&self, measurement_type: &str) -> Option<f64> {
        self.tolerances.get(measurement_type).copied()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&TestbenchConfig::default())
    }
}

/// Dispatches steps to their handlers.
#[derive(Debug)]
pub struct StepExecutor<B: InstrumentBackend> {
    backend: B,
    config: ExecutorConfig,
}

/// Splits an instrument result into fatal errors (outer `Err`) and
/// step-local failure reasons (inner `Err`).
fn step_local<T>(result: Result<T, InstrumentError>) -> Result<Result<T, String>, InstrumentError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(Err(e.to_string())),
    }
}

impl<B: InstrumentBackend> StepExecutor<B> {
    pub fn new(backend: B, config: ExecutorConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs one step.
    pub async fn execute(&self, step: &StepDefinition) -> Result<StepOutcome, InstrumentError> {
        match &step.kind {
            StepKind::PowerSupply(params) => self.power_supply(params).await,
            StepKind::Measurement(params) => self.measurement(params).await,
            StepKind::Delay(params) => Ok(self.delay(params).await),
            StepKind::Validation(params) => Ok(Self::validation(params)),
            StepKind::Unsupported { type_name, .. } => {
                warn!(step = %step.name, step_type = %type_name, "unsupported step type");
                Ok(StepOutcome::fail(
                    format!("unsupported step type: {type_name}"),
                    BTreeMap::new(),
                ))
            }
            StepKind::Malformed {
                step_type, reason, ..
            } => {
                warn!(step = %step.name, %step_type, reason = %reason, "malformed step parameters");
                Ok(StepOutcome::fail(
                    format!("invalid parameters for {step_type} step: {reason}"),
                    BTreeMap::new(),
                ))
            }
        }
    }

    async fn power_supply(&self, params: &PowerSupplyParams) -> Result<StepOutcome, InstrumentError> {
        let voltage = params.voltage;
        let current_limit = params.current_limit;
        let mut recorded = measurements([
            ("voltage_set", json!(voltage)),
            ("current_limit", json!(current_limit)),
        ]);

        if let Some(violation) = self.safety_violation(voltage, current_limit) {
            warn!(voltage, current_limit, %violation, "power set-point rejected");
            return Ok(StepOutcome::fail(violation, recorded));
        }

        let instrument = params.instrument.as_deref();
        let setpoint = PowerSetpoint {
            instrument,
            voltage,
            current_limit,
        };
        if let Err(reason) = step_local(self.backend.apply_power(setpoint).await)? {
            return Ok(StepOutcome::fail(reason, recorded));
        }

        let stabilization = params
            .stabilization_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.power_stabilization);
        tokio::time::sleep(stabilization).await;

        let reading = match step_local(self.backend.read_power(instrument).await)? {
            Ok(reading) => reading,
            Err(reason) => return Ok(StepOutcome::fail(reason, recorded)),
        };

        recorded.insert("voltage_measured".to_owned(), json!(reading.voltage));
        recorded.insert("current_measured".to_owned(), json!(reading.current));
        recorded.insert("power".to_owned(), json!(reading.power()));

        let relative_error = if voltage > 0.0 {
            (reading.voltage - voltage).abs() / voltage
        } else {
            0.0
        };
        let passed = relative_error < POWER_READBACK_TOLERANCE;
        debug!(voltage, measured = reading.voltage, relative_error, passed, "power step evaluated");
        Ok(StepOutcome::evaluated(passed, recorded))
    }

    fn safety_violation(&self, voltage: f64, current_limit: f64) -> Option<String> {
        let limits = &self.config.safety;
        if !voltage.is_finite() || voltage.abs() > limits.max_voltage {
            return Some(format!(
                "voltage {voltage} V exceeds safety limit of {} V",
                limits.max_voltage
            ));
        }
        if !current_limit.is_finite() || current_limit < 0.0 {
            return Some(format!("current limit {current_limit} A is invalid"));
        }
        if current_limit > limits.max_current {
            return Some(format!(
                "current limit {current_limit} A exceeds safety limit of {} A",
                limits.max_current
            ));
        }
        let power = voltage.abs() * current_limit;
        if power > limits.max_power {
            return Some(format!(
                "power {power} W exceeds safety limit of {} W",
                limits.max_power
            ));
        }
        None
    }

    /// Absolute tolerance for a measurement step.
    fn tolerance(&self, params: &MeasurementParams) -> f64 {
        let tolerance = params
            .tolerance
            .or_else(|| self.config.tolerance_for(&params.measurement_type))
            .unwrap_or(DEFAULT_TOLERANCE);
        match params.tolerance_type {
            ToleranceType::Absolute => tolerance,
            ToleranceType::Percentage => params.expected_value.abs() * tolerance / 100.0,
        }
    }

    async fn measurement(&self, params: &MeasurementParams) -> Result<StepOutcome, InstrumentError> {
        let expected = params.expected_value;
        let tolerance = self.tolerance(params);
        let mut recorded = measurements([
            ("expected", json!(expected)),
            ("tolerance", json!(tolerance)),
        ]);

        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Ok(StepOutcome::fail(
                format!("tolerance {tolerance} must be a non-negative number"),
                recorded,
            ));
        }

        tokio::time::sleep(self.config.measurement_settle).await;

        let request = MeasurementRequest {
            instrument: params.instrument.as_deref(),
            quantity: &params.measurement_type,
            channel: params.channel.as_deref(),
            expected,
            tolerance,
        };
        let measured = match step_local(self.backend.measure(request).await)? {
            Ok(value) => value,
            Err(reason) => return Ok(StepOutcome::fail(reason, recorded)),
        };

        let deviation = (measured - expected).abs();
        recorded.insert(params.measurement_type.clone(), json!(measured));
        recorded.insert("deviation".to_owned(), json!(deviation));

        let passed = deviation <= tolerance;
        debug!(
            measurement_type = %params.measurement_type,
            measured,
            expected,
            tolerance,
            passed,
            "measurement evaluated"
        );
        Ok(StepOutcome::evaluated(passed, recorded))
    }

    async fn delay(&self, params: &DelayParams) -> StepOutcome {
        let requested = Duration::from_millis(params.delay_ms);
        let applied = requested.min(self.config.max_delay);
        let mut recorded = measurements([("delay_applied_ms", json!(applied.as_millis() as u64))]);
        if applied < requested {
            warn!(
                requested_ms = params.delay_ms,
                applied_ms = applied.as_millis() as u64,
                "delay clamped to configured maximum"
            );
            recorded.insert("delay_requested_ms".to_owned(), json!(params.delay_ms));
        }

        tokio::time::sleep(applied).await;
        StepOutcome::pass(recorded)
    }

    fn validation(params: &ValidationParams) -> StepOutcome {
        let mut recorded = measurements([("condition_evaluated", json!(params.condition))]);
        match expr::evaluate(&params.condition, &params.variables) {
            Ok(result) => {
                recorded.insert("condition_result".to_owned(), json!(result));
                StepOutcome::evaluated(result, recorded)
            }
            Err(e) => {
                recorded.insert("condition_result".to_owned(), Value::Null);
                StepOutcome::fail(format!("condition evaluation failed: {e}"), recorded)
            }
        }
    }
}
