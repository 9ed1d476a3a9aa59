//! Run orchestration: instrument setup, backend selection, signal handling.
//!
//! The [`Orchestrator`] is the central coordinator of `testbench-daemon`.
//! It owns the validated configuration and the instrument registry, wires
//! the progress observers, and drives one sequence run to its end.
//!
//! # Run flow
//!
//! 1. Check instrument health against `required_instruments`
//!    (registry backend only)
//! 2. Build the engine for the configured backend
//! 3. Run the sequence; SIGINT/SIGTERM request a cooperative stop
//! 4. Return the run summary once the engine has finished

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use testbench_core::config::{BACKEND_REGISTRY, BACKEND_SIMULATED, TestbenchConfig};
use testbench_core::error::{ConfigError, TestbenchError};
use testbench_core::event::ProgressEvent;
use testbench_core::instrument::{InstrumentInfo, InstrumentRegistry};
use testbench_core::metrics as names;
use testbench_core::types::SequenceDefinition;
use testbench_engine::{
    ChannelObserver, InstrumentBackend, ProgressReporter, RegistryBackend, RunSummary,
    SequenceEngine, SimulatedBackend, SimulatedInstrument, TracingObserver,
};

use crate::health::{DaemonHealth, aggregate_status, instrument_health};
use crate::metrics_server;
use crate::sinks::JsonLinesObserver;

/// Capacity of the stdout event stream channel.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Where progress events go besides the log.
#[derive(Debug, Clone, Default)]
pub struct OutputOptions<'a> {
    /// Append events as JSON lines to this file.
    pub events_file: Option<&'a Path>,
    /// Print events as JSON lines on stdout.
    pub stream_stdout: bool,
}

/// Progress reporter plus the task printing streamed events, if any.
///
/// Drop the reporter after the run so the printer sees the channel close.
pub struct RunOutputs {
    pub reporter: ProgressReporter,
    pub printer: Option<JoinHandle<usize>>,
}

/// Command-line settings that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// Load the daemon configuration: file, then environment, then `overrides`.
///
/// With `allow_missing`, a missing file yields the built-in defaults (with
/// environment overrides applied) instead of an error.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the final
/// configuration does not validate.
pub async fn load_config(
    path: &Path,
    allow_missing: bool,
    overrides: &ConfigOverrides,
) -> Result<TestbenchConfig> {
    let mut config = match TestbenchConfig::load(path).await {
        Ok(config) => config,
        Err(TestbenchError::Config(ConfigError::FileNotFound { .. })) if allow_missing => {
            let mut config = TestbenchConfig::default();
            config.apply_env_overrides();
            config
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to load config {}: {}",
                path.display(),
                e
            ));
        }
    };

    if let Some(level) = &overrides.log_level {
        config.general.log_level = level.clone();
    }
    if let Some(format) = &overrides.log_format {
        config.general.log_format = format.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
    Ok(config)
}

/// The daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: TestbenchConfig,
    /// Instruments declared in `[[instruments]]`.
    registry: Arc<InstrumentRegistry>,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read, parsed or
    /// validated, or if the metrics endpoint cannot be installed.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path, false, &ConfigOverrides::default()).await?;
        Self::build_from_config(config)
    }

    /// Build from an already-loaded configuration.
    ///
    /// Every `[[instruments]]` entry is registered as a loopback instrument;
    /// driver implementations for real hardware register through the same
    /// registry.
    pub fn build_from_config(config: TestbenchConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let registry = Arc::new(InstrumentRegistry::new());
        for entry in &config.instruments {
            let mut info = InstrumentInfo::new(&entry.name, entry.kind);
            info.resource = entry.resource.clone();
            registry
                .register(Arc::new(SimulatedInstrument::new(info)))
                .map_err(|e| anyhow::anyhow!("failed to register instrument: {}", e))?;
            tracing::debug!(instrument = %entry.name, kind = %entry.kind, "instrument registered");
        }

        metrics::gauge!(names::DAEMON_INSTRUMENTS_REGISTERED).set(registry.count() as f64);
        tracing::info!(
            backend = %config.engine.backend,
            instruments = registry.count(),
            "orchestrator initialized"
        );

        Ok(Self { config, registry })
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &TestbenchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Build the progress reporter for one run.
    ///
    /// Events are always logged through `tracing`; the file and stdout
    /// outputs are optional.
    pub async fn outputs(&self, options: &OutputOptions<'_>) -> Result<RunOutputs> {
        let mut reporter = ProgressReporter::new().with_observer(TracingObserver::new());

        if let Some(path) = options.events_file {
            let sink = JsonLinesObserver::open(path).await.map_err(|e| {
                anyhow::anyhow!("failed to open event log {}: {}", path.display(), e)
            })?;
            reporter = reporter.with_observer(sink);
        }

        let printer = if options.stream_stdout {
            let (observer, rx) = ChannelObserver::channel(
                "stdout",
                STREAM_CHANNEL_CAPACITY,
                self.config.engine.observer_timeout(),
            );
            reporter = reporter.with_observer(observer);
            Some(spawn_event_printer(rx))
        } else {
            None
        };

        Ok(RunOutputs { reporter, printer })
    }

    /// Instrument health for `sequence`.
    pub async fn health(&self, sequence: &SequenceDefinition) -> DaemonHealth {
        let required: &[String] = if self.uses_registry() {
            &sequence.required_instruments
        } else {
            &[]
        };
        let unregistered = self.registry.missing(required);
        let instruments =
            instrument_health(self.registry.statuses().await, required, &unregistered);
        DaemonHealth {
            status: aggregate_status(&instruments),
            backend: self.config.engine.backend.clone(),
            instruments,
        }
    }

    /// Run `sequence`, stopping cooperatively on SIGINT or SIGTERM.
    pub async fn run(
        &self,
        sequence: &SequenceDefinition,
        reporter: &ProgressReporter,
    ) -> Result<RunSummary> {
        self.run_until(sequence, reporter, shutdown_signal()).await
    }

    /// Run `sequence`, requesting a stop when `shutdown` resolves.
    ///
    /// The returned summary is the engine's; a stopped run is not an error.
    ///
    /// # Errors
    ///
    /// - A required instrument is missing or disconnected
    /// - The engine rejected the run
    pub async fn run_until<F>(
        &self,
        sequence: &SequenceDefinition,
        reporter: &ProgressReporter,
        shutdown: F,
    ) -> Result<RunSummary>
    where
        F: Future<Output = &'static str>,
    {
        let health = self.health(sequence).await;
        match &health.status {
            status if status.is_unhealthy() => {
                return Err(anyhow::anyhow!(
                    "instruments not ready for '{}': {}",
                    sequence.name,
                    status
                ));
            }
            status if !status.is_healthy() => {
                tracing::warn!(status = %status, "running with degraded instruments");
            }
            _ => {}
        }

        match self.config.engine.backend.as_str() {
            BACKEND_REGISTRY => {
                let backend = RegistryBackend::new(
                    Arc::clone(&self.registry),
                    &self.config.engine.default_power_supply,
                    &self.config.engine.default_meter,
                );
                let engine = SequenceEngine::from_config(backend, &self.config);
                drive(&engine, sequence, reporter, shutdown).await
            }
            BACKEND_SIMULATED => {
                let engine = SequenceEngine::from_config(SimulatedBackend::new(), &self.config);
                drive(&engine, sequence, reporter, shutdown).await
            }
            other => Err(anyhow::anyhow!("unknown engine backend '{}'", other)),
        }
    }

    fn uses_registry(&self) -> bool {
        self.config.engine.backend == BACKEND_REGISTRY
    }
}

/// Run to completion, translating `shutdown` into one `stop()` call.
async fn drive<B, F>(
    engine: &SequenceEngine<B>,
    sequence: &SequenceDefinition,
    reporter: &ProgressReporter,
    shutdown: F,
) -> Result<RunSummary>
where
    B: InstrumentBackend,
    F: Future<Output = &'static str>,
{
    let run = engine.run(sequence, reporter);
    tokio::pin!(run);
    tokio::pin!(shutdown);
    let mut stop_requested = false;

    loop {
        tokio::select! {
            summary = &mut run => {
                return summary.map_err(|e| anyhow::anyhow!("run rejected: {}", e));
            }
            signal = &mut shutdown, if !stop_requested => {
                tracing::info!(signal = signal, "shutdown signal received, stopping run");
                engine.stop();
                stop_requested = true;
            }
        }
    }
}

/// Print streamed events as JSON lines; returns the number printed.
fn spawn_event_printer(mut rx: mpsc::Receiver<ProgressEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut printed = 0;
        while let Some(event) = rx.recv().await {
            let line = match event.to_json() {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode event for stdout");
                    continue;
                }
            };
            if let Err(e) = stdout.write_all(format!("{line}\n").as_bytes()).await {
                tracing::warn!(error = %e, "stdout closed, event stream ends");
                break;
            }
            printed += 1;
        }
        let _ = stdout.flush().await;
        printed
    })
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal. If the handlers cannot be installed the
/// run can only end on its own.
async fn shutdown_signal() -> &'static str {
    match wait_for_shutdown_signal().await {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!(error = %e, "signal handlers unavailable");
            std::future::pending().await
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to install Ctrl+C handler: {}", e))?;
    Ok("CTRL_C")
}
