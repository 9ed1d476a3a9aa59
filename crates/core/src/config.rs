//! Configuration: `testbench.toml` parsing and runtime settings.
//!
//! [`TestbenchConfig`] is the top-level structure holding every section.
//!
//! # Loading precedence
//! 1. CLI arguments (highest)
//! 2. Environment variables (`TESTBENCH_ENGINE_MAX_DELAY_MS=5000` form)
//! 3. Config file (`testbench.toml`)
//! 4. Defaults (`Default` impls)
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), testbench_core::error::TestbenchError> {
//! use testbench_core::config::TestbenchConfig;
//!
//! // file + env overrides
//! let config = TestbenchConfig::load("testbench.toml").await?;
//!
//! // straight from a TOML string
//! let config = TestbenchConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{ConfigError, TestbenchError};
use crate::instrument::InstrumentKind;

/// Backend names accepted by `engine.backend`.
pub const BACKEND_SIMULATED: &str = "simulated";
pub const BACKEND_REGISTRY: &str = "registry";

/// Top-level testbench configuration.
///
/// Each component reads only its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestbenchConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Default absolute tolerance per measurement type. Entries in the file
    /// replace the built-in value for their type only.
    #[serde(default = "default_tolerances", deserialize_with = "tolerances_over_defaults")]
    pub tolerances: BTreeMap<String, f64>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Instruments to register when `engine.backend = "registry"`
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for TestbenchConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            safety: SafetyConfig::default(),
            tolerances: default_tolerances(),
            metrics: MetricsConfig::default(),
            instruments: Vec::new(),
        }
    }
}

/// Built-in tolerances for the common measurement types.
pub fn default_tolerances() -> BTreeMap<String, f64> {
    [
        ("current", 0.1),
        ("frequency", 0.01),
        ("temperature", 1.0),
        ("voltage", 0.05),
    ]
    .into_iter()
    .map(|(kind, tolerance)| (kind.to_owned(), tolerance))
    .collect()
}

fn tolerances_over_defaults<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut tolerances = default_tolerances();
    tolerances.extend(BTreeMap::<String, f64>::deserialize(deserializer)?);
    Ok(tolerances)
}

impl TestbenchConfig {
    /// Loads a TOML file and applies environment overrides.
    ///
    /// The result is not validated: callers apply their own overrides first
    /// and call [`validate`](Self::validate) once at the end.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TestbenchError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads a TOML file without environment overrides or validation.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, TestbenchError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TestbenchError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                TestbenchError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, TestbenchError> {
        toml::from_str(toml_str).map_err(|e| {
            TestbenchError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Overrides values from environment variables.
    ///
    /// Naming: `TESTBENCH_{SECTION}_{FIELD}`, e.g. `TESTBENCH_SAFETY_MAX_VOLTAGE=12`.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "TESTBENCH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "TESTBENCH_GENERAL_LOG_FORMAT");

        // Engine
        override_string(&mut self.engine.backend, "TESTBENCH_ENGINE_BACKEND");
        override_u64(
            &mut self.engine.inter_step_delay_ms,
            "TESTBENCH_ENGINE_INTER_STEP_DELAY_MS",
        );
        override_u64(&mut self.engine.max_delay_ms, "TESTBENCH_ENGINE_MAX_DELAY_MS");
        override_u64(
            &mut self.engine.power_stabilization_ms,
            "TESTBENCH_ENGINE_POWER_STABILIZATION_MS",
        );
        override_u64(
            &mut self.engine.measurement_settle_ms,
            "TESTBENCH_ENGINE_MEASUREMENT_SETTLE_MS",
        );
        override_u64(&mut self.engine.step_timeout_ms, "TESTBENCH_ENGINE_STEP_TIMEOUT_MS");
        override_u64(
            &mut self.engine.observer_timeout_ms,
            "TESTBENCH_ENGINE_OBSERVER_TIMEOUT_MS",
        );
        override_string(
            &mut self.engine.default_power_supply,
            "TESTBENCH_ENGINE_DEFAULT_POWER_SUPPLY",
        );
        override_string(
            &mut self.engine.default_meter,
            "TESTBENCH_ENGINE_DEFAULT_METER",
        );

        // Safety
        override_f64(&mut self.safety.max_voltage, "TESTBENCH_SAFETY_MAX_VOLTAGE");
        override_f64(&mut self.safety.max_current, "TESTBENCH_SAFETY_MAX_CURRENT");
        override_f64(&mut self.safety.max_power, "TESTBENCH_SAFETY_MAX_POWER");

        // Metrics
        override_bool(&mut self.metrics.enabled, "TESTBENCH_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "TESTBENCH_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "TESTBENCH_METRICS_PORT");
    }

    /// Validates field values.
    pub fn validate(&self) -> Result<(), TestbenchError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        let valid_backends = [BACKEND_SIMULATED, BACKEND_REGISTRY];
        if !valid_backends.contains(&self.engine.backend.as_str()) {
            return Err(invalid(
                "engine.backend",
                format!("must be one of: {}", valid_backends.join(", ")),
            ));
        }

        if self.engine.max_delay_ms == 0 {
            return Err(invalid("engine.max_delay_ms", "must be greater than 0".to_owned()));
        }

        if self.engine.step_timeout_ms == 0 {
            return Err(invalid("engine.step_timeout_ms", "must be greater than 0".to_owned()));
        }

        for (field, value) in [
            ("safety.max_voltage", self.safety.max_voltage),
            ("safety.max_current", self.safety.max_current),
            ("safety.max_power", self.safety.max_power),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, "must be a positive number".to_owned()));
            }
        }

        for (measurement_type, tolerance) in &self.tolerances {
            if !(tolerance.is_finite() && *tolerance >= 0.0) {
                return Err(invalid(
                    &format!("tolerances.{measurement_type}"),
                    "must be a non-negative number".to_owned(),
                ));
            }
        }

        if self.metrics.enabled && !self.metrics.endpoint.starts_with('/') {
            return Err(invalid(
                "metrics.endpoint",
                "must start with '/'".to_owned(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for instrument in &self.instruments {
            if instrument.name.is_empty() {
                return Err(invalid("instruments.name", "must not be empty".to_owned()));
            }
            if !seen.insert(instrument.name.as_str()) {
                return Err(invalid(
                    "instruments.name",
                    format!("duplicate instrument '{}'", instrument.name),
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> TestbenchError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// Sequence engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instrument backend (simulated, registry)
    pub backend: String,
    /// Yield between consecutive steps
    pub inter_step_delay_ms: u64,
    /// Upper bound for a single delay step
    pub max_delay_ms: u64,
    /// Settling wait after driving a power supply
    pub power_stabilization_ms: u64,
    /// Settling wait before a measurement read
    pub measurement_settle_ms: u64,
    /// Time limit of a step without its own `timeout_seconds`
    pub step_timeout_ms: u64,
    /// Per-event delivery timeout for channel observers
    pub observer_timeout_ms: u64,
    /// Instrument used by power steps without an `instrument` parameter
    pub default_power_supply: String,
    /// Instrument used by measurement steps without an `instrument` parameter
    pub default_meter: String,
}

impl EngineConfig {
    pub fn inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.inter_step_delay_ms)
    }

    pub fn power_stabilization(&self) -> Duration {
        Duration::from_millis(self.power_stabilization_ms)
    }

    pub fn measurement_settle(&self) -> Duration {
        Duration::from_millis(self.measurement_settle_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn observer_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BACKEND_SIMULATED.to_owned(),
            inter_step_delay_ms: 10,
            max_delay_ms: 60_000,
            power_stabilization_ms: 50,
            measurement_settle_ms: 20,
            step_timeout_ms: 30_000,
            observer_timeout_ms: 1_000,
            default_power_supply: "power_supply_1".to_owned(),
            default_meter: "dmm_1".to_owned(),
        }
    }
}

/// Power supply safety limits. A power step exceeding any limit fails
/// without driving the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Volts
    pub max_voltage: f64,
    /// Amperes
    pub max_current: f64,
    /// Watts, checked against `voltage * current_limit`
    pub max_power: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_voltage: 30.0,
            max_current: 5.0,
            max_power: 100.0,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// One `[[instruments]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub name: String,
    pub kind: InstrumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_f64(target: &mut f64, env_key: &str) {
    override_parsed(target, env_key, "f64");
}
