//! Instrument health reporting.
//!
//! Before a run the daemon polls every registered instrument and checks the
//! sequence's `required_instruments` against the registry. The overall
//! status is the worst status among all instruments.
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)
//!
//! A disconnected instrument is Unhealthy when the sequence requires it and
//! Degraded otherwise. A required instrument missing from the registry is
//! Unhealthy.

use std::fmt;

use serde::Serialize;

use testbench_core::instrument::InstrumentStatus;

/// Health of one instrument or of the whole daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst status of all instruments.
    pub status: HealthStatus,
    /// Instrument backend in use.
    pub backend: String,
    /// Per-instrument reports.
    pub instruments: Vec<InstrumentHealth>,
}

/// Health of a single instrument.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentHealth {
    pub name: String,
    /// Whether the sequence about to run lists this instrument.
    pub required: bool,
    pub status: HealthStatus,
}

/// Classify registry statuses against the required instrument names.
///
/// `unregistered` lists required names the registry does not know; each is
/// reported as unhealthy.
pub fn instrument_health(
    statuses: Vec<InstrumentStatus>,
    required: &[String],
    unregistered: &[&str],
) -> Vec<InstrumentHealth> {
    let mut report: Vec<InstrumentHealth> = statuses
        .into_iter()
        .map(|status| {
            let is_required = required.contains(&status.name);
            let health = if status.connected {
                HealthStatus::Healthy
            } else {
                let reason = status.last_error.unwrap_or(status.status);
                if is_required {
                    HealthStatus::Unhealthy(reason)
                } else {
                    HealthStatus::Degraded(reason)
                }
            };
            InstrumentHealth {
                name: status.name,
                required: is_required,
                status: health,
            }
        })
        .collect();

    report.extend(unregistered.iter().map(|name| InstrumentHealth {
        name: (*name).to_owned(),
        required: true,
        status: HealthStatus::Unhealthy("not registered".to_owned()),
    }));
    report
}

/// Aggregate instrument statuses into a single status.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(instruments: &[InstrumentHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for instrument in instruments {
        match &instrument.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                if !worst.is_unhealthy() {
                    reasons.push(format!("{}: {}", instrument.name, reason));
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                if !worst.is_unhealthy() {
                    reasons.clear();
                }
                reasons.push(format!("{}: {}", instrument.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}
