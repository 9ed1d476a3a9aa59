//! Shared building blocks of the testbench: domain types, progress events,
//! instrument access, errors, configuration and metric names.
//!
//! Every other crate in the workspace depends on this one; it has no
//! knowledge of how runs are scheduled.

pub mod config;
pub mod error;
pub mod event;
pub mod instrument;
pub mod metrics;
pub mod types;

// --- re-exports ---

// errors
pub use error::{
    ConfigError, DeliveryError, EngineError, InstrumentError, SequenceError, TestbenchError,
};

// configuration
pub use config::TestbenchConfig;

// events
pub use event::{ProgressEvent, ProgressKind, RunStatus};

// instruments
pub use instrument::{
    BoxFuture, DynInstrument, Instrument, InstrumentInfo, InstrumentKind, InstrumentRegistry,
    InstrumentStatus,
};

// domain types
pub use types::{SequenceDefinition, StepDefinition, StepKind, StepOutcome, StepResult, StepType};
