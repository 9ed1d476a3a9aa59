//! Testbench daemon library.
//!
//! This library exposes internal modules for integration testing.
//! In production, `testbench-daemon` is used as a binary (main.rs).

pub mod health;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod sequence_loader;
pub mod sinks;
