//! Daemon configuration loading tests.
//!
//! Covers precedence (file -> env -> CLI) and the missing-file fallback.

use std::io::Write;

use serial_test::serial;
use testbench_core::config::TestbenchConfig;
use testbench_daemon::orchestrator::{ConfigOverrides, load_config};

fn write_config(config: &TestbenchConfig) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    let content = toml::to_string(config).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
#[serial]
async fn file_values_are_loaded() {
    let mut config = TestbenchConfig::default();
    config.safety.max_voltage = 12.0;
    config.engine.inter_step_delay_ms = 25;
    let file = write_config(&config);

    let loaded = load_config(file.path(), false, &ConfigOverrides::default())
        .await
        .unwrap();

    assert_eq!(loaded.safety.max_voltage, 12.0);
    assert_eq!(loaded.engine.inter_step_delay_ms, 25);
}

#[tokio::test]
#[serial]
async fn cli_overrides_beat_env_and_file() {
    let mut config = TestbenchConfig::default();
    config.general.log_level = "warn".to_owned();
    let file = write_config(&config);

    // SAFETY: test is #[serial]; no concurrent env access.
    unsafe { std::env::set_var("TESTBENCH_GENERAL_LOG_LEVEL", "error") };
    let env_only = load_config(file.path(), false, &ConfigOverrides::default()).await;
    let with_cli = load_config(
        file.path(),
        false,
        &ConfigOverrides {
            log_level: Some("debug".to_owned()),
            log_format: Some("json".to_owned()),
        },
    )
    .await;
    // SAFETY: test is #[serial]; no concurrent env access.
    unsafe { std::env::remove_var("TESTBENCH_GENERAL_LOG_LEVEL") };

    assert_eq!(env_only.unwrap().general.log_level, "error");
    let with_cli = with_cli.unwrap();
    assert_eq!(with_cli.general.log_level, "debug");
    assert_eq!(with_cli.general.log_format, "json");
}

#[tokio::test]
#[serial]
async fn cli_override_replaces_invalid_env_value() {
    let file = write_config(&TestbenchConfig::default());

    // SAFETY: test is #[serial]; no concurrent env access.
    unsafe { std::env::set_var("TESTBENCH_GENERAL_LOG_LEVEL", "verbose") };
    let env_only = load_config(file.path(), false, &ConfigOverrides::default()).await;
    let with_cli = load_config(
        file.path(),
        false,
        &ConfigOverrides {
            log_level: Some("debug".to_owned()),
            log_format: None,
        },
    )
    .await;
    // SAFETY: test is #[serial]; no concurrent env access.
    unsafe { std::env::remove_var("TESTBENCH_GENERAL_LOG_LEVEL") };

    let err = env_only.unwrap_err();
    assert!(err.to_string().contains("config validation failed"), "{err}");
    assert_eq!(with_cli.unwrap().general.log_level, "debug");
}

#[tokio::test]
#[serial]
async fn cli_override_replaces_invalid_file_value() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(b"[general]\nlog_format = \"xml\"\n").unwrap();

    let config = load_config(
        file.path(),
        false,
        &ConfigOverrides {
            log_level: None,
            log_format: Some("json".to_owned()),
        },
    )
    .await
    .unwrap();
    assert_eq!(config.general.log_format, "json");
}

#[tokio::test]
#[serial]
async fn invalid_cli_override_is_rejected() {
    let file = write_config(&TestbenchConfig::default());
    let err = load_config(
        file.path(),
        false,
        &ConfigOverrides {
            log_level: None,
            log_format: Some("xml".to_owned()),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("config validation failed"));
}

#[tokio::test]
#[serial]
async fn missing_file_falls_back_to_defaults_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testbench.toml");

    let config = load_config(&path, true, &ConfigOverrides::default())
        .await
        .unwrap();
    assert_eq!(config.engine.backend, "simulated");

    let err = load_config(&path, false, &ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to load config"));
}

#[tokio::test]
#[serial]
async fn malformed_file_is_never_replaced_by_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(b"[engine\nbackend = ").unwrap();

    assert!(
        load_config(file.path(), true, &ConfigOverrides::default())
            .await
            .is_err()
    );
}
