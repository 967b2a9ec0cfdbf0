use std::{io, path::PathBuf};

use folio_domain::BatchId;
use folio_store::errors::DatabaseError;
use thiserror::Error;

// CONFIGURATION ERRORS
// =================================================================================================

/// Rejected configuration. Fatal at startup; mapped to exit code 1 by the binary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configured path {name} must not be empty")]
    EmptyPath { name: &'static str },

    #[error("target year range is inverted: start {start} > end {end}")]
    InvertedYearRange { start: u32, end: u32 },

    #[error("execution limit {name} must be greater than zero")]
    ZeroLimit { name: &'static str },
}

// GATEWAY ERRORS
// =================================================================================================

/// Failure reported by a remote batch gateway operation.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network-level trouble: timeouts, connection resets, throttling. Worth retrying with
    /// backoff.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The service rejected the request; retrying the identical call cannot succeed.
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    /// No gateway implementation is linked into this deployment.
    #[error("no remote batch gateway is configured")]
    Unconfigured,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

// VALIDATION ERRORS
// =================================================================================================

/// How a model response failed validation. Mirrors the persisted failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    JsonDecode,
    SchemaValidation,
    MissingResponse,
    Other,
}

/// A rejected model response, preserving what could be extracted for offline analysis.
#[derive(Debug, Error)]
#[error("response validation failed ({kind:?}): {message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    pub extracted_text: Option<String>,
}

// SCANNER ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to enumerate label files under {path:?}")]
    LabelRootUnreadable { path: PathBuf, source: io::Error },

    #[error("failed to probe output file {path:?}")]
    OutputProbeFailed { path: PathBuf, source: io::Error },
}

// INGEST ERRORS
// =================================================================================================

/// Infrastructure failure during result ingestion. Per-record outcomes (service errors,
/// validation failures) are data, not errors, and never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("database error")]
    Database(#[from] DatabaseError),

    #[error("failed to write artifact {path:?}")]
    ArtifactWrite { path: PathBuf, source: io::Error },
}

// ORCHESTRATOR ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("database error")]
    Database(#[from] DatabaseError),

    #[error("scanner failed")]
    Scan(#[from] ScanError),

    #[error("result ingestion failed for batch {batch_id}")]
    Ingest {
        batch_id: BatchId,
        source: IngestError,
    },

    #[error("failed to write wave summary artifact")]
    SummaryWrite(#[source] io::Error),
}

impl OrchestratorError {
    /// Whether the error indicates state-store corruption; mapped to exit code 2 by the binary.
    pub fn is_store_corruption(&self) -> bool {
        match self {
            OrchestratorError::Database(err) => err.is_corruption(),
            OrchestratorError::Ingest { source: IngestError::Database(err), .. } => {
                err.is_corruption()
            },
            _ => false,
        }
    }
}
