use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// BATCH ID
// ================================================================================================

/// Identifier of a remote batch job, assigned by the remote service at submission.
///
/// Treated as an opaque string. Terminal batches are processed in ascending [`BatchId`] order so
/// failure-log timestamps remain reproducible across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// BATCH STATUS
// ================================================================================================

/// Local lifecycle state of a batch as tracked by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    Active,
    Completed,
    Failed,
}

/// The terminal half of [`BatchStatus`]; the only states a batch may be finalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown batch status {0:?}")]
pub struct UnknownBatchStatus(String);

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl From<TerminalStatus> for BatchStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => BatchStatus::Completed,
            TerminalStatus::Failed => BatchStatus::Failed,
        }
    }
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = UnknownBatchStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BatchStatus::Active),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(UnknownBatchStatus(other.to_owned())),
        }
    }
}
