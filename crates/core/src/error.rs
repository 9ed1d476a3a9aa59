//! Error types, grouped by domain.
//!
//! [`TestbenchError`] is the top-level error; every domain error converts into
//! it with `?`. Step-local failures are *not* errors: they are recorded in the
//! step result. Only conditions listed here leave their layer.

/// Top-level testbench error.
#[derive(Debug, thiserror::Error)]
pub enum TestbenchError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Sequence definition error
    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// Instrument access error
    #[error("instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// Run lifecycle error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Config file could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds an invalid value
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors raised while loading or decoding a sequence definition.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    /// Sequence file does not exist
    #[error("sequence file not found: {path}")]
    FileNotFound { path: String },

    /// File extension is neither json nor toml
    #[error("unsupported sequence format: {0}")]
    UnsupportedFormat(String),

    /// Document could not be decoded
    #[error("failed to parse sequence: {reason}")]
    ParseFailed { reason: String },
}

/// Instrument access errors.
///
/// Everything except [`InstrumentError::Internal`] is an expected domain
/// condition and ends up in the step result. `Internal` marks a broken
/// invariant inside a driver and aborts the whole run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstrumentError {
    /// No instrument registered under this name
    #[error("instrument not found: {0}")]
    NotFound(String),

    /// An instrument with this name is already registered
    #[error("instrument already registered: {0}")]
    AlreadyRegistered(String),

    /// The instrument is registered but not connected
    #[error("instrument '{name}' is not connected")]
    Disconnected { name: String },

    /// The read returned no usable value
    #[error("read of '{quantity}' on '{name}' failed: {reason}")]
    ReadFailed {
        name: String,
        quantity: String,
        reason: String,
    },

    /// The write was rejected
    #[error("write of '{setting}' on '{name}' failed: {reason}")]
    WriteFailed {
        name: String,
        setting: String,
        reason: String,
    },

    /// Driver-internal failure; not recoverable at step level
    #[error("internal instrument failure: {0}")]
    Internal(String),
}

impl InstrumentError {
    /// Whether the error must escalate past the step boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Run lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another run holds the single-flight slot
    #[error("a test is already running: {test_id}")]
    AlreadyRunning { test_id: String },

    /// An instrument failure escaped a step handler
    #[error("step {step_number} ('{step}') aborted the run: {source}")]
    StepAborted {
        step: String,
        step_number: usize,
        #[source]
        source: InstrumentError,
    },

    /// A step task panicked or was cancelled by the runtime
    #[error("step {step_number} ('{step}') terminated unexpectedly: {reason}")]
    StepPanicked {
        step: String,
        step_number: usize,
        reason: String,
    },
}

/// Observer delivery errors. Never propagated into a run.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Receiving side is gone
    #[error("observer disconnected")]
    Disconnected,

    /// Observer did not accept the event in time
    #[error("delivery timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Event could not be encoded
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// Underlying sink failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
