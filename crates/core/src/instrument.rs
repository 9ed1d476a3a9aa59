//! Instrument access: the capability steps use to reach hardware.
//!
//! [`Instrument`] is the driver-facing trait (RPITIT, so drivers write plain
//! `async fn`). [`DynInstrument`] is its dyn-compatible twin returning
//! [`BoxFuture`], implemented automatically for every `Instrument`, so the
//! [`InstrumentRegistry`] can hold heterogeneous handles.
//!
//! ```text
//! step handler ──> InstrumentBackend ──> InstrumentRegistry ──> dyn DynInstrument
//! ```
//!
//! The registry performs no per-instrument locking; drivers that can be
//! reached from several tasks synchronise internally.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InstrumentError;

/// Boxed, sendable future used by dyn-compatible traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── InstrumentKind ──────────────────────────────────────────────────

/// Instrument category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    PowerSupply,
    Daq,
    Multimeter,
    Oscilloscope,
    SignalGenerator,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerSupply => write!(f, "power_supply"),
            Self::Daq => write!(f, "daq"),
            Self::Multimeter => write!(f, "multimeter"),
            Self::Oscilloscope => write!(f, "oscilloscope"),
            Self::SignalGenerator => write!(f, "signal_generator"),
        }
    }
}

// ─── InstrumentInfo / InstrumentStatus ───────────────────────────────

/// Static description of an instrument handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    /// Registry name (e.g. `"power_supply_1"`)
    pub name: String,
    /// Category
    pub kind: InstrumentKind,
    /// Driver resource address (VISA string, device name, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl InstrumentInfo {
    pub fn new(name: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            resource: None,
        }
    }
}

/// Point-in-time status reported by an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentStatus {
    pub name: String,
    pub kind: InstrumentKind,
    pub connected: bool,
    /// Driver status word ("connected", "idle", "error: ...")
    pub status: String,
    /// Most recent readings keyed by quantity
    #[serde(default)]
    pub readings: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstrumentStatus {
    /// Status entry for an instrument whose status query failed.
    pub fn unreachable(info: &InstrumentInfo, error: &InstrumentError) -> Self {
        Self {
            name: info.name.clone(),
            kind: info.kind,
            connected: false,
            status: format!("error: {error}"),
            readings: BTreeMap::new(),
            last_error: Some(error.to_string()),
        }
    }
}

// ─── Instrument Trait ────────────────────────────────────────────────

/// Driver interface for a named instrument.
///
/// # Implementation example
/// ```ignore
/// struct Dmm { info: InstrumentInfo }
///
/// impl Instrument for Dmm {
///     fn info(&self) -> &InstrumentInfo { &self.info }
///
///     async fn get_status(&self) -> Result<InstrumentStatus, InstrumentError> { ... }
///     async fn read(&self, quantity: &str, channel: Option<&str>) -> Result<f64, InstrumentError> { ... }
///     async fn write(&self, setting: &str, value: f64) -> Result<(), InstrumentError> { ... }
/// }
/// ```
pub trait Instrument: Send + Sync + 'static {
    /// Static description.
    fn info(&self) -> &InstrumentInfo;

    /// Queries connection state and latest readings.
    fn get_status(
        &self,
    ) -> impl Future<Output = Result<InstrumentStatus, InstrumentError>> + Send;

    /// Reads one quantity (e.g. `"voltage"`), optionally on a channel.
    fn read(
        &self,
        quantity: &str,
        channel: Option<&str>,
    ) -> impl Future<Output = Result<f64, InstrumentError>> + Send;

    /// Applies one setting (e.g. `"voltage"`, `"current_limit"`).
    fn write(
        &self,
        setting: &str,
        value: f64,
    ) -> impl Future<Output = Result<(), InstrumentError>> + Send;
}

// ─── DynInstrument Trait ─────────────────────────────────────────────

/// dyn-compatible form of [`Instrument`].
pub trait DynInstrument: Send + Sync {
    fn info(&self) -> &InstrumentInfo;

    fn get_status(&self) -> BoxFuture<'_, Result<InstrumentStatus, InstrumentError>>;

    fn read<'a>(
        &'a self,
        quantity: &'a str,
        channel: Option<&'a str>,
    ) -> BoxFuture<'a, Result<f64, InstrumentError>>;

    fn write<'a>(&'a self, setting: &'a str, value: f64)
    -> BoxFuture<'a, Result<(), InstrumentError>>;
}

impl<T: Instrument> DynInstrument for T {
    fn info(&self) -> &InstrumentInfo {
        Instrument::info(self)
    }

    fn get_status(&self) -> BoxFuture<'_, Result<InstrumentStatus, InstrumentError>> {
        Box::pin(Instrument::get_status(self))
    }

    fn read<'a>(
        &'a self,
        quantity: &'a str,
        channel: Option<&'a str>,
    ) -> BoxFuture<'a, Result<f64, InstrumentError>> {
        Box::pin(Instrument::read(self, quantity, channel))
    }

    fn write<'a>(
        &'a self,
        setting: &'a str,
        value: f64,
    ) -> BoxFuture<'a, Result<(), InstrumentError>> {
        Box::pin(Instrument::write(self, setting, value))
    }
}

// ─── InstrumentRegistry ──────────────────────────────────────────────

/// Named instrument handles.
///
/// Registration normally happens during setup; lookups are cheap clones of
/// the stored `Arc`, so no lock is held while a handle is in use.
#[derive(Default)]
pub struct InstrumentRegistry {
    instruments: RwLock<BTreeMap<String, Arc<dyn DynInstrument>>>,
}

impl InstrumentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle under its `info().name`.
    ///
    /// Fails if the name is already taken.
    pub fn register(&self, instrument: Arc<dyn DynInstrument>) -> Result<(), InstrumentError> {
        let name = instrument.info().name.clone();
        let mut map = self
            .instruments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&name) {
            return Err(InstrumentError::AlreadyRegistered(name));
        }
        map.insert(name, instrument);
        Ok(())
    }

    /// Removes a handle and returns it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn DynInstrument>, InstrumentError> {
        self.instruments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| InstrumentError::NotFound(name.to_owned()))
    }

    /// Looks up a handle by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DynInstrument>, InstrumentError> {
        self.instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| InstrumentError::NotFound(name.to_owned()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Names from `required` that are not registered.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        let map = self
            .instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        required
            .iter()
            .filter(|name| !map.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Queries every instrument's status.
    ///
    /// A failing query yields an `unreachable` entry instead of an error,
    /// so one broken driver does not hide the others.
    pub async fn statuses(&self) -> Vec<InstrumentStatus> {
        let handles: Vec<Arc<dyn DynInstrument>> = self
            .instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.get_status().await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(instrument = %handle.info().name, error = %e, "instrument status query failed");
                    statuses.push(InstrumentStatus::unreachable(handle.info(), &e));
                }
            }
        }
        statuses
    }

    /// Self-test: the instrument answers a status query and reports itself
    /// connected.
    pub async fn self_test(&self, name: &str) -> bool {
        match self.get(name) {
            Ok(handle) => matches!(handle.get_status().await, Ok(status) if status.connected),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("instruments", &self.names())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
