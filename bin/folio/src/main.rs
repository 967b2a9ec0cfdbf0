use std::process::ExitCode;

use clap::{Parser, Subcommand};
use folio_utils::logging::{self, OpenTelemetry};
use tracing::error;

mod commands;

// COMMANDS
// ================================================================================================

#[derive(Parser)]
#[command(version, about = "Folio batch-inference orchestrator", long_about = None)]
pub struct Cli {
    /// Enables the OpenTelemetry OTLP span exporter (configured via OTEL_EXPORTER_OTLP_*
    /// environment variables).
    #[arg(long, global = true)]
    open_telemetry: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Drives the orchestration state machine to quiescence, then exits.
    RunOnce(commands::RunOnceCommand),

    /// Resets dead-letter failure counters so the matching records become schedulable again.
    ResetFailures(commands::ResetFailuresCommand),

    /// Prints the current orchestration state: active batches, in-flight records, dead letters.
    Status(commands::StatusCommand),
}

// MAIN
// ================================================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let otel = if cli.open_telemetry {
        OpenTelemetry::Enabled
    } else {
        OpenTelemetry::Disabled
    };
    if let Err(err) = logging::setup_tracing(otel) {
        eprintln!("failed to initialize logging: {err:#}");
        return commands::CommandError::exit_failure();
    }

    let result = match cli.command {
        Command::RunOnce(command) => command.run().await,
        Command::ResetFailures(command) => command.run().await,
        Command::Status(command) => command.run().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            error!("{:#}", anyhow::Error::new(err));
            code
        },
    }
}
