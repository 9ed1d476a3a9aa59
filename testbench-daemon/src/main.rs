use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use testbench_daemon::logging;
use testbench_daemon::orchestrator::{
    ConfigOverrides, Orchestrator, OutputOptions, RunOutputs, load_config,
};
use testbench_daemon::sequence_loader::load_sequence;

mod cli;

use cli::{DEFAULT_CONFIG_PATH, DaemonCli};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = DaemonCli::parse();

    let overrides = ConfigOverrides {
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
    };
    let allow_missing = cli.config == Path::new(DEFAULT_CONFIG_PATH);
    let config = load_config(&cli.config, allow_missing, &overrides).await?;

    if cli.validate {
        println!("configuration is valid: {}", cli.config.display());
        if let Some(path) = &cli.sequence {
            let sequence = load_sequence(path)
                .await
                .map_err(|e| anyhow::anyhow!("invalid sequence {}: {}", path.display(), e))?;
            println!(
                "sequence is valid: {} ({} steps)",
                sequence.name,
                sequence.total_steps()
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "testbench-daemon starting");

    let Some(sequence_path) = cli.sequence.as_deref() else {
        return Err(anyhow::anyhow!("no sequence file given"));
    };
    let sequence = load_sequence(sequence_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load sequence: {}", e))?;

    let orchestrator = Orchestrator::build_from_config(config)?;
    let RunOutputs { reporter, printer } = orchestrator
        .outputs(&OutputOptions {
            events_file: cli.events.as_deref(),
            stream_stdout: cli.stream,
        })
        .await?;

    let summary = orchestrator.run(&sequence, &reporter).await;

    // closes the stdout stream
    drop(reporter);
    if let Some(printer) = printer {
        match printer.await {
            Ok(printed) => tracing::debug!(printed, "event stream closed"),
            Err(e) => tracing::warn!(error = %e, "event printer failed"),
        }
    }

    let summary = summary?;
    if !cli.stream {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    tracing::info!(
        test_id = %summary.test_id,
        outcome = %summary.outcome,
        "testbench-daemon finished"
    );

    Ok(if summary.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
