#![doc = include_str!("../README.md")]
//!
//! # Modules
//! - [`engine`]: run lifecycle, single-run slot, stop handling
//! - [`executor`]: per-step-type handlers and safety limits
//! - [`backend`]: instrument access seam, registry-backed implementation
//! - [`simulated`]: hardware-free backend and loopback instrument
//! - [`expr`]: validation condition evaluator
//! - [`reporter`]: observer fan-out
//! - [`state`]: run ids, status snapshots, run summaries

pub mod backend;
pub mod engine;
pub mod executor;
pub mod expr;
pub mod reporter;
pub mod simulated;
pub mod state;

pub use backend::{InstrumentBackend, MeasurementRequest, PowerReading, PowerSetpoint, RegistryBackend};
pub use engine::{DEFAULT_INTER_STEP_DELAY, DEFAULT_STEP_TIMEOUT, SequenceEngine};
pub use executor::{ExecutorConfig, StepExecutor};
pub use expr::{ExprError, MAX_DEPTH, evaluate};
pub use reporter::{ChannelObserver, DynObserver, Observer, ProgressReporter, TracingObserver};
pub use simulated::{SimulatedBackend, SimulatedInstrument};
pub use state::{EngineStatus, RunOutcome, RunSummary, TestId};
