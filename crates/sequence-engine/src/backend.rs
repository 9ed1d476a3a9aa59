//! Instrument backends: the seam between step handlers and hardware.
//!
//! [`InstrumentBackend`] exposes the three operations power and measurement
//! steps need. [`RegistryBackend`] routes them to named handles in an
//! [`InstrumentRegistry`]; `SimulatedBackend` (see [`crate::simulated`])
//! answers them from a numeric model.
//!
//! ```text
//! StepExecutor ──> InstrumentBackend (trait)
//!                      │            │
//!                      ▼            ▼
//!              RegistryBackend   SimulatedBackend
//!                      │
//!                      ▼
//!             InstrumentRegistry ──> dyn DynInstrument
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use testbench_core::error::InstrumentError;
use testbench_core::instrument::InstrumentRegistry;

/// Power supply set-point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSetpoint<'a> {
    /// Supply to drive; backend default when `None`
    pub instrument: Option<&'a str>,
    pub voltage: f64,
    pub current_limit: f64,
}

/// Power supply readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
}

impl PowerReading {
    /// Delivered power in watts.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// A single measurement request.
///
/// `expected` and `tolerance` describe the check the caller will apply; real
/// instruments ignore them, the simulated backend uses them to place its
/// reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRequest<'a> {
    /// Meter to read; backend default when `None`
    pub instrument: Option<&'a str>,
    /// Quantity (e.g. `"voltage"`, `"current"`)
    pub quantity: &'a str,
    pub channel: Option<&'a str>,
    pub expected: f64,
    /// Absolute tolerance
    pub tolerance: f64,
}

/// Instrument operations used by step handlers.
///
/// Returning [`InstrumentError::Internal`] aborts the run; every other error
/// fails only the current step.
pub trait InstrumentBackend: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Applies a voltage set-point and current limit.
    fn apply_power(
        &self,
        setpoint: PowerSetpoint<'_>,
    ) -> impl Future<Output = Result<(), InstrumentError>> + Send;

    /// Reads back output voltage and current.
    fn read_power(
        &self,
        instrument: Option<&str>,
    ) -> impl Future<Output = Result<PowerReading, InstrumentError>> + Send;

    /// Takes one measurement.
    fn measure(
        &self,
        request: MeasurementRequest<'_>,
    ) -> impl Future<Output = Result<f64, InstrumentError>> + Send;
}

// ─── RegistryBackend ─────────────────────────────────────────────────

/// Backend driving registered instruments.
///
/// Steps without an `instrument` parameter use the configured default
/// supply or meter.
#[derive(Debug, Clone)]
pub struct RegistryBackend {
    registry: Arc<InstrumentRegistry>,
    default_power_supply: String,
    default_meter: String,
}

impl RegistryBackend {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        default_power_supply: impl Into<String>,
        default_meter: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            default_power_supply: default_power_supply.into(),
            default_meter: default_meter.into(),
        }
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    fn supply_name<'a>(&'a self, instrument: Option<&'a str>) -> &'a str {
        instrument.unwrap_or(&self.default_power_supply)
    }

    fn meter_name<'a>(&'a self, instrument: Option<&'a str>) -> &'a str {
        instrument.unwrap_or(&self.default_meter)
    }
}

impl InstrumentBackend for RegistryBackend {
    fn name(&self) -> &str {
        "registry"
    }

    async fn apply_power(&self, setpoint: PowerSetpoint<'_>) -> Result<(), InstrumentError> {
        let name = self.supply_name(setpoint.instrument);
        let supply = self.registry.get(name)?;
        debug!(
            instrument = name,
            voltage = setpoint.voltage,
            current_limit = setpoint.current_limit,
            "applying power set-point"
        );
        supply.write("current_limit", setpoint.current_limit).await?;
        supply.write("voltage", setpoint.voltage).await
    }

    async fn read_power(&self, instrument: Option<&str>) -> Result<PowerReading, InstrumentError> {
        let name = self.supply_name(instrument);
        let supply = self.registry.get(name)?;
        let voltage = supply.read("voltage", None).await?;
        let current = supply.read("current", None).await?;
        Ok(PowerReading { voltage, current })
    }

    async fn measure(&self, request: MeasurementRequest<'_>) -> Result<f64, InstrumentError> {
        let name = self.meter_name(request.instrument);
        let meter = self.registry.get(name)?;
        let value = meter.read(request.quantity, request.channel).await?;
        if !value.is_finite() {
            return Err(InstrumentError::ReadFailed {
                name: name.to_owned(),
                quantity: request.quantity.to_owned(),
                reason: format!("non-finite reading {value}"),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use testbench_core::instrument::{
        Instrument, InstrumentInfo, InstrumentKind, InstrumentStatus,
    };

    /// Records writes and answers reads from a fixed table.
    struct TableInstrument {
        info: InstrumentInfo,
        table: BTreeMap<String, f64>,
        writes: Mutex<Vec<(String, f64)>>,
    }

    impl TableInstrument {
        fn new(name: &str, kind: InstrumentKind, table: &[(&str, f64)]) -> Self {
            Self {
                info: InstrumentInfo::new(name, kind),
                table: table.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl Instrument for TableInstrument {
        fn info(&self) -> &InstrumentInfo {
            &self.info
        }

        async fn get_status(&self) -> Result<InstrumentStatus, InstrumentError> {
            Ok(InstrumentStatus {
                name: self.info.name.clone(),
                kind: self.info.kind,
                connected: true,
                status: "connected".to_owned(),
                readings: self.table.clone(),
                last_error: None,
            })
        }

        async fn read(&self, quantity: &str, _channel: Option<&str>) -> Result<f64, InstrumentError> {
            self.table
                .get(quantity)
                .copied()
                .ok_or_else(|| InstrumentError::ReadFailed {
                    name: self.info.name.clone(),
                    quantity: quantity.to_owned(),
                    reason: "unsupported quantity".to_owned(),
                })
        }

        async fn write(&self, setting: &str, value: f64) -> Result<(), InstrumentError> {
            self.writes.lock().unwrap().push((setting.to_owned(), value));
            Ok(())
        }
    }

    fn backend_with(instruments: Vec<Arc<TableInstrument>>) -> RegistryBackend {
        let registry = Arc::new(InstrumentRegistry::new());
        for instrument in instruments {
            registry.register(instrument).unwrap();
        }
        RegistryBackend::new(registry, "psu", "dmm")
    }

    #[tokio::test]
    async fn power_goes_to_default_supply() {
        let psu = Arc::new(TableInstrument::new(
            "psu",
            InstrumentKind::PowerSupply,
            &[("voltage", 5.01), ("current", 0.2)],
        ));
        let backend = backend_with(vec![psu.clone()]);

        backend
            .apply_power(PowerSetpoint {
                instrument: None,
                voltage: 5.0,
                current_limit: 1.0,
            })
            .await
            .unwrap();
        let reading = backend.read_power(None).await.unwrap();

        assert_eq!(reading.voltage, 5.01);
        assert!((reading.power() - 1.002).abs() < 1e-9);
        assert_eq!(
            psu.writes.lock().unwrap().as_slice(),
            &[("current_limit".to_owned(), 1.0), ("voltage".to_owned(), 5.0)]
        );
    }

    #[tokio::test]
    async fn named_instrument_overrides_default() {
        let dmm = Arc::new(TableInstrument::new("dmm", InstrumentKind::Multimeter, &[("voltage", 1.0)]));
        let daq = Arc::new(TableInstrument::new("daq", InstrumentKind::Daq, &[("voltage", 2.0)]));
        let backend = backend_with(vec![dmm, daq]);

        let request = |instrument| MeasurementRequest {
            instrument,
            quantity: "voltage",
            channel: None,
            expected: 0.0,
            tolerance: 0.0,
        };
        assert_eq!(backend.measure(request(None)).await.unwrap(), 1.0);
        assert_eq!(backend.measure(request(Some("daq"))).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn missing_instrument_is_not_found() {
        let backend = backend_with(Vec::new());
        let err = backend.read_power(Some("psu_9")).await.unwrap_err();
        assert_eq!(err, InstrumentError::NotFound("psu_9".to_owned()));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn non_finite_reading_is_rejected() {
        let dmm = Arc::new(TableInstrument::new(
            "dmm",
            InstrumentKind::Multimeter,
            &[("resistance", f64::INFINITY)],
        ));
        let backend = backend_with(vec![dmm]);
        let err = backend
            .measure(MeasurementRequest {
                instrument: None,
                quantity: "resistance",
                channel: None,
                expected: 100.0,
                tolerance: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::ReadFailed { .. }));
    }
}
