use async_trait::async_trait;
use folio_domain::{BatchId, RecordKey};

use crate::errors::GatewayError;

// REMOTE BATCH STATE
// ================================================================================================

/// Lifecycle state of a batch job as reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBatchState {
    Pending,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
    Expired,
}

impl RemoteBatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RemoteBatchState::Pending | RemoteBatchState::Running)
    }

    /// Terminal states which still carry downloadable per-record results.
    pub fn has_results(self) -> bool {
        matches!(self, RemoteBatchState::Succeeded | RemoteBatchState::PartiallySucceeded)
    }
}

// RECORD OUTCOMES
// ================================================================================================

/// One downloaded per-record outcome.
///
/// The key arrives as the raw string the remote service echoed back; the ingestor parses and
/// matches it against the batch's expected set, so a corrupted key degrades to a
/// `result_key_mismatch` row instead of failing the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub key: String,
    pub result: RecordResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordResult {
    /// The service produced a response for this record. The text between here and the validated
    /// artifact is treated as opaque.
    Success {
        raw_response_text: String,
        raw_response_blob: Option<String>,
    },
    /// The service reported a per-record error.
    ServiceError {
        message: String,
        raw_response_blob: Option<String>,
    },
}

// BATCH GATEWAY
// ================================================================================================

/// Abstraction over the remote asynchronous batch-inference service.
///
/// The orchestrator only ever needs these three operations; everything else (image upload,
/// prompt rendering, credential handling) is the implementation's concern. Implementations live
/// outside this crate, e.g.:
///
/// - a vendor batch-API client
/// - a recorded/mock gateway for tests
#[async_trait]
pub trait BatchGateway: Send + Sync + 'static {
    /// Submits a bundle of records as a new remote batch job.
    ///
    /// Returns the remote-assigned batch id. Implementations must not return an id until the
    /// job was durably created remotely; the orchestrator persists the id before relying on it.
    async fn submit(
        &self,
        batch_name: &str,
        records: &[RecordKey],
    ) -> Result<BatchId, GatewayError>;

    /// Polls the current state of a batch job.
    async fn poll(&self, batch_id: &BatchId) -> Result<RemoteBatchState, GatewayError>;

    /// Downloads the per-record outcomes of a terminal batch.
    async fn download(&self, batch_id: &BatchId) -> Result<Vec<RecordOutcome>, GatewayError>;
}

/// Placeholder gateway for deployments that have not linked a remote-service client.
///
/// Every operation fails with [`GatewayError::Unconfigured`], which the orchestrator records as
/// a submission failure without mutating scheduling state, so the workload stays intact until a
/// real gateway is wired in.
pub struct UnconfiguredGateway;

#[async_trait]
impl BatchGateway for UnconfiguredGateway {
    async fn submit(
        &self,
        _batch_name: &str,
        _records: &[RecordKey],
    ) -> Result<BatchId, GatewayError> {
        Err(GatewayError::Unconfigured)
    }

    async fn poll(&self, _batch_id: &BatchId) -> Result<RemoteBatchState, GatewayError> {
        Err(GatewayError::Unconfigured)
    }

    async fn download(&self, _batch_id: &BatchId) -> Result<Vec<RecordOutcome>, GatewayError> {
        Err(GatewayError::Unconfigured)
    }
}
