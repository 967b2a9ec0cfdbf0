use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Args;
use folio_orchestrator::{
    config::OrchestratorConfig,
    gateway::UnconfiguredGateway,
    observer::NoopObserver,
    orchestrator::Orchestrator,
    validator::JsonObjectValidator,
};
use folio_store::db::{Db, FailureFilter};
use folio_utils::config::load_config;
use thiserror::Error;
use tracing::info;

const ENV_CONFIG: &str = "FOLIO_CONFIG";

/// Exit code for unrecoverable configuration errors (and other command failures).
const EXIT_CONFIG: u8 = 1;
/// Exit code for unrecoverable state-store corruption.
const EXIT_STORE: u8 = 2;

// COMMAND ERRORS
// ================================================================================================

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid configuration")]
    Config(#[source] anyhow::Error),

    #[error("state store unusable")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CommandError::Config(_) | CommandError::Other(_) => ExitCode::from(EXIT_CONFIG),
            CommandError::Store(_) => ExitCode::from(EXIT_STORE),
        }
    }

    pub fn exit_failure() -> ExitCode {
        ExitCode::from(EXIT_CONFIG)
    }
}

/// Loads and validates the configuration file; every violation is fatal with exit code 1.
fn load_validated_config(path: &PathBuf) -> Result<OrchestratorConfig, CommandError> {
    let config: OrchestratorConfig = load_config(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
        .map_err(CommandError::Config)?;
    config.validate().map_err(|err| CommandError::Config(err.into()))?;
    Ok(config)
}

/// Opens the state store; failures here mean the database is unusable, exit code 2.
async fn open_store(config: &OrchestratorConfig) -> Result<Db, CommandError> {
    Db::setup(config.database_filepath())
        .await
        .context("failed to open the state store")
        .map_err(CommandError::Store)
}

// RUN-ONCE
// ================================================================================================

#[derive(Args)]
pub struct RunOnceCommand {
    /// Path of the orchestrator configuration file.
    #[arg(long, env = ENV_CONFIG, default_value = "folio.toml")]
    config: PathBuf,
}

impl RunOnceCommand {
    pub async fn run(self) -> Result<(), CommandError> {
        let config = load_validated_config(&self.config)?;
        info!(%config, "Starting orchestrator");

        let db = open_store(&config).await?;
        let orchestrator = Orchestrator::new(
            db,
            Arc::new(UnconfiguredGateway),
            Arc::new(JsonObjectValidator),
            Arc::new(NoopObserver),
            config,
        );

        // A signal lets the current phase finish; transactions are never interrupted.
        let shutdown = orchestrator.shutdown_flag();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown requested; finishing the current phase");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        });

        let report = orchestrator
            .run_to_quiescence()
            .await
            .map_err(|err| {
                if err.is_store_corruption() {
                    CommandError::Store(err.into())
                } else {
                    CommandError::Other(err.into())
                }
            })?;

        info!(
            waves = report.waves,
            succeeded = report.succeeded,
            failed = report.failed,
            interrupted = report.interrupted,
            "Run complete"
        );
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// RESET-FAILURES
// ================================================================================================

#[derive(Args)]
pub struct ResetFailuresCommand {
    /// Path of the orchestrator configuration file.
    #[arg(long, env = ENV_CONFIG, default_value = "folio.toml")]
    config: PathBuf,

    /// Only reset counters of this state.
    #[arg(long)]
    state: Option<String>,

    /// Only reset counters of this school.
    #[arg(long)]
    school: Option<String>,

    /// Only reset counters of this year.
    #[arg(long)]
    year: Option<u32>,
}

impl ResetFailuresCommand {
    pub async fn run(self) -> Result<(), CommandError> {
        let config = load_validated_config(&self.config)?;
        let db = open_store(&config).await?;

        let filter = FailureFilter { state: self.state, school: self.school, year: self.year };
        let deleted = db
            .reset_failure_counts(filter)
            .await
            .context("failed to reset failure counters")
            .map_err(CommandError::Store)?;

        println!("reset {deleted} failure counter(s)");
        Ok(())
    }
}

// STATUS
// ================================================================================================

#[derive(Args)]
pub struct StatusCommand {
    /// Path of the orchestrator configuration file.
    #[arg(long, env = ENV_CONFIG, default_value = "folio.toml")]
    config: PathBuf,
}

impl StatusCommand {
    pub async fn run(self) -> Result<(), CommandError> {
        let config = load_validated_config(&self.config)?;
        let db = open_store(&config).await?;

        let active = db
            .select_active_batches()
            .await
            .context("failed to read active batches")
            .map_err(CommandError::Store)?;
        let inflight = db
            .select_inflight_records()
            .await
            .context("failed to read in-flight records")
            .map_err(CommandError::Store)?;
        let dead = db
            .select_dead_letters(config.execution.max_retries)
            .await
            .context("failed to read dead letters")
            .map_err(CommandError::Store)?;

        println!("active batches: {}", active.len());
        for batch in &active {
            println!("  {} (created_at {})", batch.batch_id, batch.created_at);
        }
        println!("in-flight records: {}", inflight.len());
        println!("dead letters (count > {}): {}", config.execution.max_retries, dead.len());
        for (key, count) in &dead {
            println!("  {key} (x{count})");
        }
        Ok(())
    }
}
