//! Hardware-free instrument model.
//!
//! [`SimulatedBackend`] answers the backend operations directly:
//! - power readback tracks the set-point with a +0.1% gain error and draws
//!   a fixed 100 mA load (capped by the current limit);
//! - a measurement lands uniformly within half the tolerance of the expected
//!   value, so simulated measurements always pass.
//!
//! [`SimulatedInstrument`] is a loopback [`Instrument`] for exercising the
//! registry path without hardware: reads return the last written value of
//! the same quantity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use rand::Rng;

use testbench_core::error::InstrumentError;
use testbench_core::instrument::{Instrument, InstrumentInfo, InstrumentKind, InstrumentStatus};

use crate::backend::{InstrumentBackend, MeasurementRequest, PowerReading, PowerSetpoint};

/// Relative gain error of the simulated supply readback.
pub const SIMULATED_GAIN_ERROR: f64 = 0.001;
/// Load current drawn from a simulated supply, in amperes.
pub const SIMULATED_LOAD_CURRENT: f64 = 0.1;

const DEFAULT_SUPPLY_KEY: &str = "";

/// Backend with no instruments behind it.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    /// Last set-point per supply name
    setpoints: Mutex<HashMap<String, (f64, f64)>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn readback(voltage: f64, current_limit: f64) -> PowerReading {
        let current = if voltage == 0.0 {
            0.0
        } else {
            SIMULATED_LOAD_CURRENT.min(current_limit.abs())
        };
        PowerReading {
            voltage: voltage * (1.0 + SIMULATED_GAIN_ERROR),
            current,
        }
    }
}

impl InstrumentBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn apply_power(&self, setpoint: PowerSetpoint<'_>) -> Result<(), InstrumentError> {
        let key = setpoint.instrument.unwrap_or(DEFAULT_SUPPLY_KEY).to_owned();
        self.setpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (setpoint.voltage, setpoint.current_limit));
        Ok(())
    }

    async fn read_power(&self, instrument: Option<&str>) -> Result<PowerReading, InstrumentError> {
        let key = instrument.unwrap_or(DEFAULT_SUPPLY_KEY);
        let (voltage, current_limit) = self
            .setpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or((0.0, 0.0));
        Ok(Self::readback(voltage, current_limit))
    }

    async fn measure(&self, request: MeasurementRequest<'_>) -> Result<f64, InstrumentError> {
        let half = request.tolerance.abs() / 2.0;
        if half == 0.0 || !half.is_finite() {
            return Ok(request.expected);
        }
        let offset = rand::thread_rng().gen_range(-half..=half);
        Ok(request.expected + offset)
    }
}

// ─── SimulatedInstrument ─────────────────────────────────────────────

/// Loopback instrument.
///
/// A supply reports its voltage set-point with the simulated gain error and
/// the simulated load current; any other quantity reads back its last
/// written value, or `0.0`.
#[derive(Debug)]
pub struct SimulatedInstrument {
    info: InstrumentInfo,
    values: Mutex<BTreeMap<String, f64>>,
}

impl SimulatedInstrument {
    pub fn new(info: InstrumentInfo) -> Self {
        Self {
            info,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    /// Presets the value returned for `quantity`.
    pub fn with_value(self, quantity: &str, value: f64) -> Self {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(quantity.to_owned(), value);
        self
    }

    fn value(&self, quantity: &str) -> f64 {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = |key: &str| values.get(key).copied().unwrap_or(0.0);
        match (self.info.kind, quantity) {
            (InstrumentKind::PowerSupply, "voltage") => {
                SimulatedBackend::readback(stored("voltage"), stored("current_limit")).voltage
            }
            (InstrumentKind::PowerSupply, "current") => {
                SimulatedBackend::readback(stored("voltage"), stored("current_limit")).current
            }
            _ => stored(quantity),
        }
    }
}

impl Instrument for SimulatedInstrument {
    fn info(&self) -> &InstrumentInfo {
        &self.info
    }

    async fn get_status(&self) -> Result<InstrumentStatus, InstrumentError> {
        let readings = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(InstrumentStatus {
            name: self.info.name.clone(),
            kind: self.info.kind,
            connected: true,
            status: "connected".to_owned(),
            readings,
            last_error: None,
        })
    }

    async fn read(&self, quantity: &str, _channel: Option<&str>) -> Result<f64, InstrumentError> {
        Ok(self.value(quantity))
    }

    async fn write(&self, setting: &str, value: f64) -> Result<(), InstrumentError> {
        if !value.is_finite() {
            return Err(InstrumentError::WriteFailed {
                name: self.info.name.clone(),
                setting: setting.to_owned(),
                reason: format!("non-finite value {value}"),
            });
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(setting.to_owned(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setpoint(voltage: f64, current_limit: f64) -> PowerSetpoint<'static> {
        PowerSetpoint {
            instrument: None,
            voltage,
            current_limit,
        }
    }

    #[tokio::test]
    async fn readback_within_one_percent() {
        let backend = SimulatedBackend::new();
        backend.apply_power(setpoint(5.0, 1.0)).await.unwrap();
        let reading = backend.read_power(None).await.unwrap();
        assert!((reading.voltage - 5.0).abs() / 5.0 < 0.01);
        assert_eq!(reading.current, SIMULATED_LOAD_CURRENT);
    }

    #[tokio::test]
    async fn load_current_capped_by_limit() {
        let backend = SimulatedBackend::new();
        backend.apply_power(setpoint(3.3, 0.05)).await.unwrap();
        assert_eq!(backend.read_power(None).await.unwrap().current, 0.05);
    }

    #[tokio::test]
    async fn supplies_are_tracked_by_name() {
        let backend = SimulatedBackend::new();
        backend
            .apply_power(PowerSetpoint {
                instrument: Some("psu_2"),
                voltage: 12.0,
                current_limit: 1.0,
            })
            .await
            .unwrap();
        assert_eq!(backend.read_power(None).await.unwrap().voltage, 0.0);
        assert!(backend.read_power(Some("psu_2")).await.unwrap().voltage > 12.0);
    }

    #[tokio::test]
    async fn measurement_within_half_tolerance() {
        let backend = SimulatedBackend::new();
        for _ in 0..200 {
            let value = backend
                .measure(MeasurementRequest {
                    instrument: None,
                    quantity: "voltage",
                    channel: None,
                    expected: 3.3,
                    tolerance: 0.1,
                })
                .await
                .unwrap();
            assert!((value - 3.3).abs() <= 0.05 + 1e-12, "{value}");
        }
    }

    #[tokio::test]
    async fn zero_tolerance_returns_expected() {
        let backend = SimulatedBackend::new();
        let value = backend
            .measure(MeasurementRequest {
                instrument: None,
                quantity: "current",
                channel: None,
                expected: 0.25,
                tolerance: 0.0,
            })
            .await
            .unwrap();
        assert_eq!(value, 0.25);
    }

    #[tokio::test]
    async fn loopback_supply_reports_setpoint() {
        let psu = SimulatedInstrument::new(InstrumentInfo::new("psu", InstrumentKind::PowerSupply));
        psu.write("current_limit", 1.0).await.unwrap();
        psu.write("voltage", 5.0).await.unwrap();
        let voltage = psu.read("voltage", None).await.unwrap();
        assert!((voltage - 5.005).abs() < 1e-9);
        assert_eq!(psu.read("current", None).await.unwrap(), SIMULATED_LOAD_CURRENT);
    }

    #[tokio::test]
    async fn loopback_meter_returns_preset() {
        let dmm = SimulatedInstrument::new(InstrumentInfo::new("dmm", InstrumentKind::Multimeter))
            .with_value("voltage", 3.3);
        assert_eq!(dmm.read("voltage", Some("ch1")).await.unwrap(), 3.3);
        assert_eq!(dmm.read("resistance", None).await.unwrap(), 0.0);
        let status = dmm.get_status().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.readings["voltage"], 3.3);
    }

    #[tokio::test]
    async fn loopback_rejects_non_finite_write() {
        let psu = SimulatedInstrument::new(InstrumentInfo::new("psu", InstrumentKind::PowerSupply));
        assert!(psu.write("voltage", f64::NAN).await.is_err());
    }
}
