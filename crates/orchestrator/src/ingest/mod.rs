use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use folio_domain::{BatchId, ErrorKind, FailureLogEntry, RecordKey};
use folio_store::db::Db;
use tracing::{info, instrument, warn};

use crate::{
    config::OrchestratorConfig,
    errors::{IngestError, ValidationError, ValidationErrorKind},
    gateway::{RecordOutcome, RecordResult},
    observer::{emit_degrading, RecordContext, RecordObserver},
    validator::OutputValidator,
    COMPONENT,
};

#[cfg(test)]
mod tests;

// RUN CONTEXT
// ================================================================================================

/// Snapshot of the run configuration stamped into every failure-log row, so failed responses
/// can be analyzed offline without the original config file.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub model_name: Option<String>,
    pub prompt_name: Option<String>,
    pub prompt_template: Option<String>,
    pub generation_config: Option<String>,
}

impl RunContext {
    /// Builds the snapshot from the loaded configuration.
    ///
    /// An unreadable prompt template only degrades the failure-log context, it never fails the
    /// run.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let prompt_template = match fs::read_to_string(&config.prompt.template_file) {
            Ok(template) => Some(template),
            Err(err) => {
                warn!(
                    target: COMPONENT,
                    template_file = %config.prompt.template_file.display(),
                    %err,
                    "Prompt template unreadable; failure logs will omit it"
                );
                None
            },
        };

        let generation_config = if config.model.generation_config.is_empty() {
            None
        } else {
            serde_json::to_string(&config.model.generation_config).ok()
        };

        Self {
            model_name: Some(config.model.name.clone()),
            prompt_name: Some(config.prompt.name.clone()),
            prompt_template,
            generation_config,
        }
    }

    /// Fills the configuration-snapshot fields of a failure-log entry.
    pub(crate) fn stamp(&self, mut entry: FailureLogEntry) -> FailureLogEntry {
        entry.model_name.clone_from(&self.model_name);
        entry.prompt_name.clone_from(&self.prompt_name);
        entry.prompt_template.clone_from(&self.prompt_template);
        entry.generation_config.clone_from(&self.generation_config);
        entry
    }
}

// INGEST REPORT
// ================================================================================================

/// What one batch's ingestion produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub succeeded: Vec<RecordKey>,
    pub failed: Vec<(RecordKey, ErrorKind)>,
    /// Downloaded results whose key was unparseable, unexpected, or duplicated.
    pub mismatched: usize,
}

// RESULT INGESTOR
// ================================================================================================

/// Applies a downloaded result set to the output tree and the state store.
///
/// Per-record service errors and validation failures are recorded as data (counter bumps and
/// failure-log rows); only infrastructure failures (database, filesystem) surface as errors.
pub struct ResultIngestor<'a> {
    db: &'a Db,
    output_root: &'a Path,
    validator: &'a dyn OutputValidator,
    observer: &'a dyn RecordObserver,
    run: &'a RunContext,
}

impl<'a> ResultIngestor<'a> {
    pub fn new(
        db: &'a Db,
        output_root: &'a Path,
        validator: &'a dyn OutputValidator,
        observer: &'a dyn RecordObserver,
        run: &'a RunContext,
    ) -> Self {
        Self { db, output_root, validator, observer, run }
    }

    /// Ingests the outcomes of one terminal batch.
    ///
    /// `expected` is the batch's membership as recorded at submission. Expected keys missing
    /// from the outcome set are treated as failures; outcomes with unknown keys are logged as
    /// mismatches and otherwise ignored.
    #[instrument(target = COMPONENT, skip_all, fields(batch_id = %batch_id), err)]
    pub async fn ingest(
        &self,
        batch_id: &BatchId,
        expected: &[RecordKey],
        outcomes: Vec<RecordOutcome>,
    ) -> Result<IngestReport, IngestError> {
        let expected_set: BTreeSet<&RecordKey> = expected.iter().collect();
        let mut matched: BTreeSet<RecordKey> = BTreeSet::new();
        let mut report = IngestReport::default();

        // Keys whose failure was already logged by an ingestion that crashed before the batch
        // was finalized. Re-running must not bump their counters or duplicate their log rows,
        // mirroring the output-file existence check on the success path.
        let already_failed = self.db.select_batch_failure_keys(batch_id.clone()).await?;

        for outcome in outcomes {
            let Ok(key) = outcome.key.parse::<RecordKey>() else {
                warn!(
                    target: COMPONENT,
                    raw_key = %outcome.key,
                    "Downloaded result carries an unparseable record key"
                );
                report.mismatched += 1;
                continue;
            };

            if !expected_set.contains(&key) || matched.contains(&key) {
                if !already_failed.contains(&key) {
                    self.db
                        .insert_failure_log(self.run.stamp(
                            FailureLogEntry::new(
                                key.clone(),
                                Some(batch_id.clone()),
                                0,
                                ErrorKind::ResultKeyMismatch,
                            )
                            .with_message("result key not part of this batch's expected set"),
                        ))
                        .await?;
                }
                report.mismatched += 1;
                continue;
            }
            matched.insert(key.clone());

            match outcome.result {
                RecordResult::Success { raw_response_text, raw_response_blob } => {
                    self.ingest_success(
                        batch_id,
                        &key,
                        raw_response_text,
                        raw_response_blob,
                        &already_failed,
                        &mut report,
                    )
                    .await?;
                },
                RecordResult::ServiceError { message, raw_response_blob } => {
                    self.ingest_service_error(
                        batch_id,
                        &key,
                        message,
                        raw_response_blob,
                        &already_failed,
                        &mut report,
                    )
                    .await?;
                },
            }
        }

        // Expected keys the service never answered for.
        for key in expected {
            if matched.contains(key) {
                continue;
            }
            if already_failed.contains(key) {
                report.failed.push((key.clone(), ErrorKind::MissingInResult));
                continue;
            }
            let attempt = self.db.bump_failure_count(key.clone()).await?;
            self.db
                .insert_failure_log(self.run.stamp(
                    FailureLogEntry::new(
                        key.clone(),
                        Some(batch_id.clone()),
                        attempt,
                        ErrorKind::MissingInResult,
                    )
                    .with_message("record absent from the downloaded result set"),
                ))
                .await?;
            report.failed.push((key.clone(), ErrorKind::MissingInResult));
            emit_degrading(self.observer, &RecordContext {
                record_key: key.clone(),
                batch_id: batch_id.clone(),
                error_kind: Some(ErrorKind::MissingInResult),
                attempt_number: attempt,
            });
        }

        info!(
            target: COMPONENT,
            batch_id = %batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            mismatched = report.mismatched,
            "Batch ingested"
        );

        Ok(report)
    }

    // HELPER METHODS
    // --------------------------------------------------------------------------------------------

    async fn ingest_success(
        &self,
        batch_id: &BatchId,
        key: &RecordKey,
        raw_response_text: String,
        raw_response_blob: Option<String>,
        already_failed: &BTreeSet<RecordKey>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let output_path = self.output_root.join(key.relative_path("json"));

        // Idempotence: a record whose output already exists is Done; re-ingesting the same
        // batch after a crash must not rewrite it or touch its counters.
        if output_path.is_file() {
            report.succeeded.push(key.clone());
            return Ok(());
        }

        match self.validator.validate(&raw_response_text) {
            Ok(artifact) => {
                write_atomic(&output_path, artifact.as_json()).await?;
                report.succeeded.push(key.clone());
                emit_degrading(self.observer, &RecordContext {
                    record_key: key.clone(),
                    batch_id: batch_id.clone(),
                    error_kind: None,
                    attempt_number: 0,
                });
            },
            Err(validation) => {
                let kind = error_kind_of(&validation);
                if already_failed.contains(key) {
                    // This failure was counted by an ingestion that crashed before the batch
                    // was finalized.
                    report.failed.push((key.clone(), kind));
                    return Ok(());
                }
                let attempt = self.db.bump_failure_count(key.clone()).await?;

                let mut entry =
                    FailureLogEntry::new(key.clone(), Some(batch_id.clone()), attempt, kind)
                        .with_message(validation.message.clone());
                entry.raw_response_text = Some(raw_response_text);
                entry.extracted_text = validation.extracted_text;
                entry.raw_response_blob = raw_response_blob;
                self.db.insert_failure_log(self.run.stamp(entry)).await?;

                report.failed.push((key.clone(), kind));
                emit_degrading(self.observer, &RecordContext {
                    record_key: key.clone(),
                    batch_id: batch_id.clone(),
                    error_kind: Some(kind),
                    attempt_number: attempt,
                });
            },
        }

        Ok(())
    }

    async fn ingest_service_error(
        &self,
        batch_id: &BatchId,
        key: &RecordKey,
        message: String,
        raw_response_blob: Option<String>,
        already_failed: &BTreeSet<RecordKey>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        if already_failed.contains(key) {
            // This failure was counted by an ingestion that crashed before the batch was
            // finalized.
            report.failed.push((key.clone(), ErrorKind::ServiceError));
            return Ok(());
        }
        let attempt = self.db.bump_failure_count(key.clone()).await?;

        let mut entry = FailureLogEntry::new(
            key.clone(),
            Some(batch_id.clone()),
            attempt,
            ErrorKind::ServiceError,
        )
        .with_message(message);
        entry.raw_response_blob = raw_response_blob;
        self.db.insert_failure_log(self.run.stamp(entry)).await?;

        report.failed.push((key.clone(), ErrorKind::ServiceError));
        emit_degrading(self.observer, &RecordContext {
            record_key: key.clone(),
            batch_id: batch_id.clone(),
            error_kind: Some(ErrorKind::ServiceError),
            attempt_number: attempt,
        });
        Ok(())
    }
}

fn error_kind_of(validation: &ValidationError) -> ErrorKind {
    match validation.kind {
        ValidationErrorKind::JsonDecode => ErrorKind::JsonDecodeError,
        ValidationErrorKind::SchemaValidation => ErrorKind::SchemaValidationError,
        ValidationErrorKind::MissingResponse => ErrorKind::MissingResponse,
        ValidationErrorKind::Other => ErrorKind::Other,
    }
}

/// Writes an artifact via temp-file-and-rename in the destination directory, so a crash can
/// never leave a partially written success marker.
async fn write_atomic(path: &Path, contents: &str) -> Result<(), IngestError> {
    let map_err = |source| IngestError::ArtifactWrite { path: path.to_path_buf(), source };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
    }

    let tmp: PathBuf = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await.map_err(map_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(map_err)?;
    Ok(())
}
