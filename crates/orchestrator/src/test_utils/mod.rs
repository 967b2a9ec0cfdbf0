use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;
use folio_domain::{BatchId, RecordKey};

use crate::{
    config::{
        BatchConfig, ExecutionConfig, FilesConfig, FiltersConfig, ModelConfig,
        OrchestratorConfig, PathsConfig, PromptConfig,
    },
    errors::GatewayError,
    gateway::{BatchGateway, RecordOutcome, RecordResult, RemoteBatchState},
};

// TEST CONFIG
// ================================================================================================

/// A valid configuration rooted at the given directories, with limits small enough for tests.
pub fn test_config(labels: &Path, images: &Path, output: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        paths: PathsConfig {
            label_source_dir: labels.to_path_buf(),
            image_source_dir: images.to_path_buf(),
            output_dir: output.to_path_buf(),
        },
        filters: FiltersConfig::default(),
        execution: ExecutionConfig {
            max_retries: 3,
            batch_size_limit: 100,
            max_concurrent_batches: 2,
        },
        model: ModelConfig {
            name: "folio-ocr-1".into(),
            generation_config: serde_json::Map::new(),
        },
        batch: BatchConfig {
            poll_interval_seconds: 1,
            max_poll_attempts: 10,
            display_name_prefix: "folio-test".into(),
        },
        files: FilesConfig { upload_retry_attempts: 2, upload_retry_backoff_seconds: 1 },
        prompt: PromptConfig {
            registry_dir: "prompts".into(),
            name: "page-transcribe".into(),
            template_file: "prompts/page-transcribe.txt".into(),
        },
    }
}

// MOCK GATEWAY
// ================================================================================================

#[derive(Default)]
struct MockGatewayState {
    next_id: u32,
    /// `(batch_name, record_keys)` per successful submission, in submission order.
    submissions: Vec<(String, Vec<RecordKey>)>,
    members: BTreeMap<BatchId, Vec<RecordKey>>,
    /// Batches whose poll reports a terminal failure.
    failed_batches: BTreeSet<BatchId>,
    /// Scripted submission errors, consumed before any submission succeeds.
    submit_errors: VecDeque<GatewayError>,
    /// Non-terminal polls every batch reports before turning terminal.
    pending_polls: u32,
    polls_seen: BTreeMap<BatchId, u32>,
    /// Keys answered with a per-record service error.
    service_error_keys: BTreeSet<RecordKey>,
    /// Keys omitted from downloaded results entirely.
    omitted_keys: BTreeSet<RecordKey>,
}

/// Scriptable in-memory stand-in for the remote batch service.
///
/// Submissions are assigned the deterministic ids `batch-0000`, `batch-0001`, ... in order. By
/// default every batch immediately polls as succeeded and downloads one valid JSON response per
/// member; the builder methods inject the failure modes under test.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockGatewayState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a submission error; scripted errors are consumed before submissions succeed.
    pub fn with_submit_error(self, error: GatewayError) -> Self {
        self.state.lock().unwrap().submit_errors.push_back(error);
        self
    }

    /// The given batch id polls as terminally failed.
    pub fn with_failed_batch(self, batch_id: &str) -> Self {
        self.state.lock().unwrap().failed_batches.insert(BatchId::new(batch_id));
        self
    }

    /// Every batch polls as running this many times before turning terminal.
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.state.lock().unwrap().pending_polls = polls;
        self
    }

    /// Downloads answer this key with a per-record service error.
    pub fn with_service_error_for(self, key: &RecordKey) -> Self {
        self.state.lock().unwrap().service_error_keys.insert(key.clone());
        self
    }

    /// Downloads omit this key from the result set.
    pub fn with_omitted_result_for(self, key: &RecordKey) -> Self {
        self.state.lock().unwrap().omitted_keys.insert(key.clone());
        self
    }

    /// Registers a batch as if a previous process had submitted it; used to stage
    /// crash-recovery scenarios.
    pub fn register_batch(&self, batch_id: &BatchId, keys: Vec<RecordKey>) {
        self.state.lock().unwrap().members.insert(batch_id.clone(), keys);
    }

    /// Successful submissions in order.
    pub fn submissions(&self) -> Vec<(String, Vec<RecordKey>)> {
        self.state.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl BatchGateway for MockGateway {
    async fn submit(
        &self,
        batch_name: &str,
        records: &[RecordKey],
    ) -> Result<BatchId, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }

        let batch_id = BatchId::new(format!("batch-{:04}", state.next_id));
        state.next_id += 1;
        state.submissions.push((batch_name.to_owned(), records.to_vec()));
        state.members.insert(batch_id.clone(), records.to_vec());
        Ok(batch_id)
    }

    async fn poll(&self, batch_id: &BatchId) -> Result<RemoteBatchState, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if !state.members.contains_key(batch_id) {
            return Err(GatewayError::Rejected(format!("unknown batch {batch_id}")));
        }

        let pending_polls = state.pending_polls;
        let seen = state.polls_seen.entry(batch_id.clone()).or_insert(0);
        *seen += 1;
        if *seen <= pending_polls {
            return Ok(RemoteBatchState::Running);
        }

        if state.failed_batches.contains(batch_id) {
            return Ok(RemoteBatchState::Failed);
        }

        let partially = state
            .members
            .get(batch_id)
            .is_some_and(|keys| keys.iter().any(|key| state.service_error_keys.contains(key)));
        if partially {
            Ok(RemoteBatchState::PartiallySucceeded)
        } else {
            Ok(RemoteBatchState::Succeeded)
        }
    }

    async fn download(&self, batch_id: &BatchId) -> Result<Vec<RecordOutcome>, GatewayError> {
        let state = self.state.lock().unwrap();
        let Some(members) = state.members.get(batch_id) else {
            return Err(GatewayError::Rejected(format!("unknown batch {batch_id}")));
        };

        Ok(members
            .iter()
            .filter(|key| !state.omitted_keys.contains(key))
            .map(|key| {
                let result = if state.service_error_keys.contains(key) {
                    RecordResult::ServiceError {
                        message: "simulated per-record failure".to_owned(),
                        raw_response_blob: Some(r#"{"error": {"code": 500}}"#.to_owned()),
                    }
                } else {
                    RecordResult::Success {
                        raw_response_text: format!(r#"{{"page": {}}}"#, key.page()),
                        raw_response_blob: None,
                    }
                };
                RecordOutcome { key: key.to_string(), result }
            })
            .collect())
    }
}
