//! testbench.toml integration tests
//!
//! - parsing testbench.toml.example
//! - partial configs (single sections)
//! - environment override precedence
//! - empty and malformed input

use testbench_core::config::TestbenchConfig;
use testbench_core::error::{ConfigError, TestbenchError};
use testbench_core::instrument::InstrumentKind;

const EXAMPLE: &str = include_str!("../../../testbench.toml.example");

/// Sets an env var for the duration of `f`, restoring the previous value.
fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    let original = std::env::var(key).ok();
    // SAFETY: callers are #[serial]; no concurrent env access.
    unsafe {
        std::env::set_var(key, value);
    }

    let result = f();

    // SAFETY: test cleanup
    unsafe {
        match original {
            Some(val) => std::env::set_var(key, val),
            None => std::env::remove_var(key),
        }
    }
    result
}

// =============================================================================
// testbench.toml.example
// =============================================================================

#[test]
fn example_config_parses_and_validates() {
    let config = TestbenchConfig::parse(EXAMPLE).expect("example config should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_matches_code_defaults() {
    let from_file = TestbenchConfig::parse(EXAMPLE).expect("should parse");
    let from_code = TestbenchConfig::default();

    assert_eq!(from_file.general.log_level, from_code.general.log_level);
    assert_eq!(from_file.general.log_format, from_code.general.log_format);

    assert_eq!(from_file.engine.backend, from_code.engine.backend);
    assert_eq!(
        from_file.engine.inter_step_delay_ms,
        from_code.engine.inter_step_delay_ms
    );
    assert_eq!(from_file.engine.max_delay_ms, from_code.engine.max_delay_ms);
    assert_eq!(
        from_file.engine.power_stabilization_ms,
        from_code.engine.power_stabilization_ms
    );
    assert_eq!(
        from_file.engine.measurement_settle_ms,
        from_code.engine.measurement_settle_ms
    );
    assert_eq!(
        from_file.engine.observer_timeout_ms,
        from_code.engine.observer_timeout_ms
    );
    assert_eq!(
        from_file.engine.default_power_supply,
        from_code.engine.default_power_supply
    );
    assert_eq!(from_file.engine.default_meter, from_code.engine.default_meter);
    assert_eq!(
        from_file.engine.step_timeout_ms,
        from_code.engine.step_timeout_ms
    );

    assert_eq!(from_file.safety.max_voltage, from_code.safety.max_voltage);
    assert_eq!(from_file.safety.max_current, from_code.safety.max_current);
    assert_eq!(from_file.safety.max_power, from_code.safety.max_power);

    assert_eq!(from_file.tolerances, from_code.tolerances);

    assert_eq!(from_file.metrics.enabled, from_code.metrics.enabled);
    assert_eq!(from_file.metrics.listen_addr, from_code.metrics.listen_addr);
    assert_eq!(from_file.metrics.port, from_code.metrics.port);
    assert_eq!(from_file.metrics.endpoint, from_code.metrics.endpoint);

    assert_eq!(from_file.instruments, from_code.instruments);
}

// =============================================================================
// partial configs
// =============================================================================

#[test]
fn partial_config_safety_only() {
    let toml = r#"
[safety]
max_voltage = 12.0
"#;
    let config = TestbenchConfig::parse(toml).expect("should parse");
    assert_eq!(config.safety.max_voltage, 12.0);
    assert_eq!(config.safety.max_current, 5.0);
    assert_eq!(config.engine.max_delay_ms, 60_000);
}

#[test]
fn partial_config_registry_backend() {
    let toml = r#"
[engine]
backend = "registry"
default_meter = "daq_1"

[[instruments]]
name = "daq_1"
kind = "daq"
"#;
    let config = TestbenchConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");
    assert_eq!(config.engine.backend, "registry");
    assert_eq!(config.engine.default_meter, "daq_1");
    assert_eq!(config.engine.default_power_supply, "power_supply_1");
    assert_eq!(config.instruments[0].kind, InstrumentKind::Daq);
}

#[test]
fn partial_config_tolerances() {
    let toml = r#"
[tolerances]
voltage = 0.02
current = 0.005
"#;
    let config = TestbenchConfig::parse(toml).expect("should parse");
    assert_eq!(config.tolerances.get("voltage"), Some(&0.02));
    assert_eq!(config.tolerances.get("current"), Some(&0.005));
    assert_eq!(config.tolerances.get("frequency"), Some(&0.01));
    assert_eq!(config.tolerances.get("resistance"), None);
}

// =============================================================================
// environment precedence
// =============================================================================

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[general]
log_level = "info"
"#;
    let result = with_env("TESTBENCH_GENERAL_LOG_LEVEL", "error", || {
        let mut config = TestbenchConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.general.log_level
    });
    assert_eq!(result, "error");
}

#[test]
#[serial_test::serial]
fn env_override_numeric_field() {
    let result = with_env("TESTBENCH_ENGINE_MAX_DELAY_MS", "2500", || {
        let mut config = TestbenchConfig::default();
        config.apply_env_overrides();
        config.engine.max_delay_ms
    });
    assert_eq!(result, 2500);
}

#[test]
#[serial_test::serial]
fn env_override_float_field() {
    let result = with_env("TESTBENCH_SAFETY_MAX_VOLTAGE", "12.5", || {
        let mut config = TestbenchConfig::default();
        config.apply_env_overrides();
        config.safety.max_voltage
    });
    assert_eq!(result, 12.5);
}

#[test]
#[serial_test::serial]
fn env_override_bool_field() {
    let result = with_env("TESTBENCH_METRICS_ENABLED", "true", || {
        let mut config = TestbenchConfig::default();
        config.apply_env_overrides();
        config.metrics.enabled
    });
    assert!(result);
}

#[test]
#[serial_test::serial]
fn env_override_invalid_value_keeps_toml_value() {
    let toml = r#"
[metrics]
port = 9100
"#;
    let result = with_env("TESTBENCH_METRICS_PORT", "not-a-port", || {
        let mut config = TestbenchConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.metrics.port
    });
    assert_eq!(result, 9100);
}

#[test]
#[serial_test::serial]
fn env_override_can_fail_validation() {
    let result = with_env("TESTBENCH_ENGINE_BACKEND", "serial", || {
        let mut config = TestbenchConfig::default();
        config.apply_env_overrides();
        config.validate()
    });
    assert!(matches!(
        result,
        Err(TestbenchError::Config(ConfigError::InvalidValue { field, .. })) if field == "engine.backend"
    ));
}

// =============================================================================
// empty / malformed input
// =============================================================================

#[test]
fn comments_only_parses_with_defaults() {
    let config = TestbenchConfig::parse("# nothing here\n# at all\n").expect("should parse");
    assert_eq!(config.general.log_level, "info");
}

#[test]
fn wrong_type_for_numeric_field() {
    let toml = r#"
[engine]
max_delay_ms = "sixty seconds"
"#;
    assert!(matches!(
        TestbenchConfig::parse(toml),
        Err(TestbenchError::Config(ConfigError::ParseFailed { .. }))
    ));
}

#[test]
fn unknown_instrument_kind_is_parse_error() {
    let toml = r#"
[[instruments]]
name = "x"
kind = "toaster"
"#;
    assert!(TestbenchConfig::parse(toml).is_err());
}

#[tokio::test]
async fn from_file_nonexistent_returns_file_not_found() {
    let result = TestbenchConfig::from_file("/tmp/testbench_nonexistent_12345.toml").await;
    assert!(matches!(
        result,
        Err(TestbenchError::Config(ConfigError::FileNotFound { .. }))
    ));
}

#[tokio::test]
async fn load_example_config_from_disk() {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let example_path = format!("{}/../../testbench.toml.example", manifest_dir);

    let config = TestbenchConfig::from_file(&example_path)
        .await
        .expect("example config should load");
    assert_eq!(config.engine.backend, "simulated");
}

#[test]
fn example_config_serialize_roundtrip() {
    let config = TestbenchConfig::parse(EXAMPLE).expect("should parse");
    let serialized = toml::to_string_pretty(&config).expect("should serialize");
    let reparsed = TestbenchConfig::parse(&serialized).expect("should reparse");
    reparsed.validate().expect("should validate");
    assert_eq!(config.safety.max_power, reparsed.safety.max_power);
}
