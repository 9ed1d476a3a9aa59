//! Log output for testbench-daemon.
//!
//! Everything goes to stderr; stdout carries the run summary or the event
//! stream. The filter is taken from `RUST_LOG` when it holds a usable
//! directive, otherwise from `[general] log_level`.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use testbench_core::config::GeneralConfig;

/// Shape of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Where the active filter came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    /// `RUST_LOG`.
    Environment,
    /// `[general] log_level`; holds the `RUST_LOG` value if one was rejected.
    Config { rejected_env: Option<String> },
}

/// Pick the filter: a parseable, non-empty `from_env` wins over `configured`.
///
/// # Errors
///
/// Returns an error if `configured` is needed and is not a valid directive.
pub fn build_filter(configured: &str, from_env: Option<&str>) -> Result<(EnvFilter, FilterSource)> {
    let mut rejected_env = None;
    if let Some(directives) = from_env.map(str::trim).filter(|d| !d.is_empty()) {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return Ok((filter, FilterSource::Environment)),
            Err(_) => rejected_env = Some(directives.to_owned()),
        }
    }

    let filter = EnvFilter::try_new(configured)
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", configured, e))?;
    Ok((filter, FilterSource::Config { rejected_env }))
}

/// Install the global subscriber.
///
/// Call once, before anything logs.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (filter, source) = build_filter(&config.log_level, from_env.as_deref())?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize {} log output: {}", format, e))?;

    match source {
        FilterSource::Environment => {
            tracing::debug!(format = %format, "log filter taken from {}", EnvFilter::DEFAULT_ENV);
        }
        FilterSource::Config {
            rejected_env: Some(value),
        } => {
            tracing::warn!(
                value = %value,
                level = %config.log_level,
                "ignoring unparseable {}, using configured level",
                EnvFilter::DEFAULT_ENV
            );
        }
        FilterSource::Config { rejected_env: None } => {}
    }
    Ok(())
}
