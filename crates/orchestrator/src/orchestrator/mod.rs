use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use folio_domain::{BatchId, ErrorKind, FailureLogEntry, TerminalStatus};
use folio_store::db::Db;
use folio_utils::formatting::format_array;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::OrchestratorConfig,
    errors::{GatewayError, OrchestratorError},
    gateway::{BatchGateway, RemoteBatchState},
    ingest::{ResultIngestor, RunContext},
    observer::RecordObserver,
    retry::with_backoff,
    scanner::{next_wave, ScanSnapshot},
    summary::WaveSummary,
    validator::OutputValidator,
    COMPONENT,
};


// RUN REPORT
// ================================================================================================

/// Final account of one `run_to_quiescence` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Number of SERVICE/SUBMIT passes taken.
    pub waves: u32,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when a shutdown request ended the run before quiescence.
    pub interrupted: bool,
}

// SUBMIT OUTCOME
// ================================================================================================

/// What one SUBMIT phase accomplished.
#[derive(Debug, Clone, Copy, Default)]
struct SubmitOutcome {
    /// Batches successfully handed to the gateway.
    submitted: usize,
    /// Whether any scan produced a non-empty wave, even if its submission then failed.
    ///
    /// Quiescence requires the scanner to be empty; a wave that merely failed to submit still
    /// counts as runnable work.
    discovered_work: bool,
}

// ORCHESTRATOR
// ================================================================================================

/// The orchestration state machine: `INIT → SERVICE → SUBMIT → WAIT → (SERVICE | EXIT)`.
///
/// One instance owns all state-store writes. Polling fans out over the active batches; every
/// other transition is sequential, and no store transaction is ever open across a gateway call.
pub struct Orchestrator<G> {
    db: Db,
    gateway: Arc<G>,
    validator: Arc<dyn OutputValidator>,
    observer: Arc<dyn RecordObserver>,
    config: OrchestratorConfig,
    run: RunContext,
    shutdown: Arc<AtomicBool>,
}

impl<G: BatchGateway> Orchestrator<G> {
    pub fn new(
        db: Db,
        gateway: Arc<G>,
        validator: Arc<dyn OutputValidator>,
        observer: Arc<dyn RecordObserver>,
        config: OrchestratorConfig,
    ) -> Self {
        let run = RunContext::from_config(&config);
        Self {
            db,
            gateway,
            validator,
            observer,
            config,
            run,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag which requests a graceful stop: the current phase finishes (transactions are never
    /// interrupted), then the run returns with `interrupted` set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drives the state machine until no active batches remain and the scanner is empty.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn run_to_quiescence(&self) -> Result<RunReport, OrchestratorError> {
        let mut report = RunReport::default();
        let mut poll_attempts: HashMap<BatchId, u32> = HashMap::new();

        loop {
            if self.is_shutdown() {
                report.interrupted = true;
                break;
            }
            report.waves += 1;
            let mut summary = WaveSummary::new(report.waves);

            let serviced = self.service_active_batches(&mut poll_attempts, &mut summary).await?;

            let submit = if self.is_shutdown() {
                report.interrupted = true;
                SubmitOutcome::default()
            } else {
                self.submit_new_batches(&mut summary).await?
            };

            report.succeeded += summary.succeeded;
            report.failed += summary.failed;
            if !summary.is_empty() {
                summary.set_top_failures(&self.db.select_failure_counts().await?);
                info!(target: COMPONENT, %summary, "Wave complete");
                let artifact = summary
                    .write_artifact(&self.config.paths.output_dir)
                    .map_err(OrchestratorError::SummaryWrite)?;
                debug!(target: COMPONENT, artifact = %artifact.display(), "Wave summary written");
            }

            if report.interrupted {
                break;
            }

            let active = self.db.select_active_batches().await?;
            if active.is_empty() && !submit.discovered_work {
                // Quiescence: nothing remote, and the scanner came back empty.
                break;
            }
            if serviced == 0 && submit.submitted == 0 {
                // Covers both still-pending remote batches and waves whose submission
                // failed; the latter are rescanned after the interval.
                debug!(
                    target: COMPONENT,
                    active = active.len(),
                    "No progress this pass; sleeping before the next pass"
                );
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }

        info!(
            target: COMPONENT,
            waves = report.waves,
            succeeded = report.succeeded,
            failed = report.failed,
            interrupted = report.interrupted,
            "Orchestrator run finished"
        );
        Ok(report)
    }

    // SERVICE PHASE
    // --------------------------------------------------------------------------------------------

    /// Polls every active batch and resolves the terminal ones.
    ///
    /// Polls run concurrently (at most `max_concurrent_batches` batches are ever active), but
    /// terminal batches are processed strictly in ascending batch-id order so log timestamps
    /// stay reproducible.
    ///
    /// # Returns
    ///
    /// The number of batches that reached a terminal state this pass.
    async fn service_active_batches(
        &self,
        poll_attempts: &mut HashMap<BatchId, u32>,
        summary: &mut WaveSummary,
    ) -> Result<usize, OrchestratorError> {
        let active = self.db.select_active_batches().await?;
        if active.is_empty() {
            return Ok(0);
        }

        let mut polls: JoinSet<(BatchId, Result<RemoteBatchState, GatewayError>)> =
            JoinSet::new();
        for batch in active {
            let gateway = Arc::clone(&self.gateway);
            let batch_id = batch.batch_id;
            polls.spawn(async move {
                let state = gateway.poll(&batch_id).await;
                (batch_id, state)
            });
        }

        let mut states = BTreeMap::new();
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok((batch_id, state)) => {
                    states.insert(batch_id, state);
                },
                Err(err) => warn!(target: COMPONENT, %err, "Poll task panicked"),
            }
        }

        let mut terminal = 0;
        for (batch_id, state) in states {
            match state {
                Err(err) => {
                    // Transient poll trouble: the batch stays active and is re-polled on the
                    // next pass. Failed polls still consume the poll budget so a run always
                    // reaches quiescence.
                    warn!(target: COMPONENT, %batch_id, %err, "Poll failed; leaving batch active");
                    if self.spend_poll_budget(poll_attempts, &batch_id, summary).await? {
                        terminal += 1;
                    }
                },
                Ok(state) if !state.is_terminal() => {
                    debug!(target: COMPONENT, %batch_id, ?state, "Batch still running");
                    if self.spend_poll_budget(poll_attempts, &batch_id, summary).await? {
                        terminal += 1;
                    }
                },
                Ok(state) if state.has_results() => {
                    info!(target: COMPONENT, %batch_id, ?state, "Batch completed; ingesting results");
                    self.ingest_completed_batch(&batch_id, summary).await?;
                    poll_attempts.remove(&batch_id);
                    terminal += 1;
                },
                Ok(state) => {
                    warn!(target: COMPONENT, %batch_id, ?state, "Batch terminally failed");
                    self.finalize_failed_batch(
                        &batch_id,
                        &format!("remote batch state: {state:?}"),
                        summary,
                    )
                    .await?;
                    poll_attempts.remove(&batch_id);
                    terminal += 1;
                },
            }
        }
        Ok(terminal)
    }

    /// Consumes one poll attempt of a still-pending batch; expires the batch once the budget
    /// is exhausted.
    ///
    /// # Returns
    ///
    /// Whether the batch was expired (and is therefore terminal).
    async fn spend_poll_budget(
        &self,
        poll_attempts: &mut HashMap<BatchId, u32>,
        batch_id: &BatchId,
        summary: &mut WaveSummary,
    ) -> Result<bool, OrchestratorError> {
        let attempts = poll_attempts.entry(batch_id.clone()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.config.batch.max_poll_attempts {
            return Ok(false);
        }

        warn!(
            target: COMPONENT,
            %batch_id,
            attempts = *attempts,
            "Poll budget exhausted; treating batch as expired"
        );
        self.finalize_failed_batch(batch_id, "poll budget exhausted", summary).await?;
        poll_attempts.remove(batch_id);
        Ok(true)
    }

    /// Downloads and ingests a batch that completed with results, then finalizes it.
    ///
    /// Output files are durable before the batch rows are deleted; a crash in between re-polls
    /// the still-active batch and re-ingests idempotently.
    async fn ingest_completed_batch(
        &self,
        batch_id: &BatchId,
        summary: &mut WaveSummary,
    ) -> Result<(), OrchestratorError> {
        let download = with_backoff(
            "download",
            self.config.files.upload_retry_attempts,
            self.config.upload_retry_backoff(),
            || {
                let gateway = Arc::clone(&self.gateway);
                let batch_id = batch_id.clone();
                async move { gateway.download(&batch_id).await }
            },
        )
        .await;

        let outcomes = match download {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(
                    target: COMPONENT,
                    %batch_id,
                    %err,
                    "Result download failed persistently; requeueing members via batch failure"
                );
                self.finalize_failed_batch(
                    batch_id,
                    &format!("results could not be downloaded: {err}"),
                    summary,
                )
                .await?;
                return Ok(());
            },
        };

        let expected = self.db.select_batch_members(batch_id.clone()).await?;
        let ingestor = ResultIngestor::new(
            &self.db,
            &self.config.paths.output_dir,
            self.validator.as_ref(),
            self.observer.as_ref(),
            &self.run,
        );
        let ingest = ingestor
            .ingest(batch_id, &expected, outcomes)
            .await
            .map_err(|source| OrchestratorError::Ingest { batch_id: batch_id.clone(), source })?;

        summary.record_success(ingest.succeeded.len());
        for (_, kind) in &ingest.failed {
            summary.record_failure(*kind);
        }

        self.db.finalize_batch(batch_id.clone(), TerminalStatus::Completed).await?;
        Ok(())
    }

    /// Finalizes a batch that terminated without usable results.
    ///
    /// Members get a `batch_terminal_failure` log row but no counter bump: releasing their
    /// in-flight rows makes them eligible again on the next scan, which is the natural retry
    /// loop for batch-level failures.
    async fn finalize_failed_batch(
        &self,
        batch_id: &BatchId,
        reason: &str,
        summary: &mut WaveSummary,
    ) -> Result<(), OrchestratorError> {
        let members = self.db.select_batch_members(batch_id.clone()).await?;
        let failure_counts = self.db.select_failure_counts().await?;
        // Rows already written by a pass that crashed before `finalize_batch` committed must
        // not be duplicated.
        let already_logged = self.db.select_batch_failure_keys(batch_id.clone()).await?;

        for key in &members {
            if !already_logged.contains(key) {
                let attempt = failure_counts.get(key).copied().unwrap_or(0);
                self.db
                    .insert_failure_log(self.run.stamp(
                        FailureLogEntry::new(
                            key.clone(),
                            Some(batch_id.clone()),
                            attempt,
                            ErrorKind::BatchTerminalFailure,
                        )
                        .with_message(reason),
                    ))
                    .await?;
            }
            summary.record_failure(ErrorKind::BatchTerminalFailure);
        }

        self.db.finalize_batch(batch_id.clone(), TerminalStatus::Failed).await?;
        Ok(())
    }

    // SUBMIT PHASE
    // --------------------------------------------------------------------------------------------

    /// Fills free concurrency slots with freshly scanned waves.
    ///
    /// The scanner re-runs inside the loop: each committed submission marks its keys in flight,
    /// so the next scan cannot hand out the same keys again.
    async fn submit_new_batches(
        &self,
        summary: &mut WaveSummary,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let mut outcome = SubmitOutcome::default();

        loop {
            if self.is_shutdown() {
                break;
            }
            let active = self.db.select_active_batches().await?.len();
            if active >= self.config.execution.max_concurrent_batches {
                break;
            }

            let failure_counts = self.db.select_failure_counts().await?;
            let inflight = self.db.select_inflight_records().await?;
            let snapshot = ScanSnapshot {
                label_root: &self.config.paths.label_source_dir,
                output_root: &self.config.paths.output_dir,
                state_filter: &self.config.filters.target_states,
                year_range: self.config.year_range(),
                max_retries: self.config.execution.max_retries,
                failure_counts: &failure_counts,
                inflight: &inflight,
                batch_size_limit: self.config.execution.batch_size_limit,
            };
            let wave = next_wave(&snapshot)?;
            if wave.is_empty() {
                break;
            }
            outcome.discovered_work = true;
            debug!(target: COMPONENT, keys = %format_array(&wave), "Scanner produced a wave");

            let batch_name = self.next_batch_name();
            let submission = with_backoff(
                "submit",
                self.config.files.upload_retry_attempts,
                self.config.upload_retry_backoff(),
                || {
                    let gateway = Arc::clone(&self.gateway);
                    let batch_name = batch_name.clone();
                    let wave = wave.clone();
                    async move { gateway.submit(&batch_name, &wave).await }
                },
            )
            .await;

            match submission {
                Ok(batch_id) => {
                    // The remote job exists; make it visible to scheduling. Everything after
                    // this commit is recoverable from the store plus the remote service.
                    self.db.insert_batch(batch_id.clone(), wave.clone()).await?;
                    info!(
                        target: COMPONENT,
                        %batch_id,
                        %batch_name,
                        records = wave.len(),
                        "Batch submitted"
                    );
                    outcome.submitted += 1;
                },
                Err(err) => {
                    warn!(target: COMPONENT, %batch_name, %err, "Batch submission failed");
                    // No scheduling state is recorded for a failed bundle; the keys stay
                    // latent and retry on a later pass.
                    for key in &wave {
                        let attempt = failure_counts.get(key).copied().unwrap_or(0);
                        self.db
                            .insert_failure_log(self.run.stamp(
                                FailureLogEntry::new(
                                    key.clone(),
                                    None,
                                    attempt,
                                    ErrorKind::SubmissionFailure,
                                )
                                .with_message(err.to_string()),
                            ))
                            .await?;
                        summary.record_failure(ErrorKind::SubmissionFailure);
                    }
                    break;
                },
            }
        }

        Ok(outcome)
    }

    fn next_batch_name(&self) -> String {
        format!("{}-{:08x}", self.config.batch.display_name_prefix, rand::random::<u32>())
    }
}
