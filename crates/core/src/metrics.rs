//! Metric names and descriptions.
//!
//! Every Prometheus metric name is defined here. Components call
//! `metrics::counter!()`, `metrics::gauge!()` and `metrics::histogram!()`
//! with these constants. Without an installed recorder the calls are no-ops.
//!
//! # Naming
//!
//! - prefix: `testbench_`
//! - suffix: `_total` (counter), `_seconds` (histogram), none (gauge)
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(testbench_core::metrics::ENGINE_RUNS_TOTAL, "outcome" => "completed").increment(1);
//! ```

// ─── Label keys ─────────────────────────────────────────────────────

/// Run outcome label (completed, failed, stopped, error)
pub const LABEL_OUTCOME: &str = "outcome";

/// Step type label (power_supply, measurement, ...)
pub const LABEL_STEP_TYPE: &str = "step_type";

/// Step result label (pass, fail)
pub const LABEL_RESULT: &str = "result";

/// Observer name label
pub const LABEL_OBSERVER: &str = "observer";

// ─── Engine ─────────────────────────────────────────────────────────

/// Finished runs (counter, label: outcome)
pub const ENGINE_RUNS_TOTAL: &str = "testbench_engine_runs_total";

/// Runs rejected because another run was active (counter)
pub const ENGINE_RUNS_REJECTED_TOTAL: &str = "testbench_engine_runs_rejected_total";

/// 1 while a run is active (gauge)
pub const ENGINE_RUNNING: &str = "testbench_engine_running";

/// Executed steps (counter, labels: step_type, result)
pub const ENGINE_STEPS_TOTAL: &str = "testbench_engine_steps_total";

/// Step handler duration (histogram, seconds, label: step_type)
pub const ENGINE_STEP_DURATION_SECONDS: &str = "testbench_engine_step_duration_seconds";

/// Steps aborted at their time limit (counter)
pub const ENGINE_STEP_TIMEOUTS_TOTAL: &str = "testbench_engine_step_timeouts_total";

// ─── Reporter ───────────────────────────────────────────────────────

/// Delivered progress events (counter)
pub const REPORTER_EVENTS_TOTAL: &str = "testbench_reporter_events_total";

/// Failed observer deliveries (counter, label: observer)
pub const REPORTER_DELIVERY_FAILURES_TOTAL: &str = "testbench_reporter_delivery_failures_total";

// ─── Daemon ─────────────────────────────────────────────────────────

/// Build information (gauge, always 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "testbench_daemon_build_info";

/// Registered instruments (gauge)
pub const DAEMON_INSTRUMENTS_REGISTERED: &str = "testbench_daemon_instruments_registered";

// ─── Histogram buckets ──────────────────────────────────────────────

/// Step duration buckets (seconds).
///
/// 1ms to 60s; delay steps may legitimately reach the configured maximum.
pub const STEP_DURATION_BUCKETS: [f64; 10] =
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0];

/// Registers HELP text for every metric.
///
/// Call once after installing the global recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        ENGINE_RUNS_TOTAL,
        "Total number of finished test runs by outcome"
    );
    describe_counter!(
        ENGINE_RUNS_REJECTED_TOTAL,
        "Total number of run requests rejected because a test was already running"
    );
    describe_gauge!(ENGINE_RUNNING, "Whether a test run is currently active");
    describe_counter!(
        ENGINE_STEPS_TOTAL,
        "Total number of executed steps by type and result"
    );
    describe_histogram!(
        ENGINE_STEP_DURATION_SECONDS,
        "Step handler execution time in seconds"
    );
    describe_counter!(
        ENGINE_STEP_TIMEOUTS_TOTAL,
        "Total number of steps aborted at their time limit"
    );

    describe_counter!(
        REPORTER_EVENTS_TOTAL,
        "Total number of progress events emitted"
    );
    describe_counter!(
        REPORTER_DELIVERY_FAILURES_TOTAL,
        "Total number of failed progress event deliveries per observer"
    );

    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
    describe_gauge!(
        DAEMON_INSTRUMENTS_REGISTERED,
        "Number of instruments registered in the daemon"
    );
}
