use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BatchId, RecordKey};

// ERROR TAXONOMY
// ================================================================================================

/// Classification of every non-success outcome a submitted record can produce.
///
/// Persisted as the `error_kind` column of the failure log, so the encoding is part of the
/// database schema and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote batch as a whole terminated as failed, cancelled, or expired.
    BatchTerminalFailure,
    /// Bundle upload or remote job creation failed; no state was recorded for the bundle.
    SubmissionFailure,
    /// The remote service reported a per-record error.
    ServiceError,
    /// The model response was not decodable as JSON.
    JsonDecodeError,
    /// The decoded response did not satisfy the output schema.
    SchemaValidationError,
    /// The response carried no usable model output.
    MissingResponse,
    /// An expected record was absent from the downloaded result set.
    MissingInResult,
    /// A downloaded result carried a key that was not part of the batch.
    ResultKeyMismatch,
    /// Anything the validator could not classify more precisely.
    Other,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error kind {0:?}")]
pub struct UnknownErrorKind(String);

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BatchTerminalFailure => "batch_terminal_failure",
            ErrorKind::SubmissionFailure => "submission_failure",
            ErrorKind::ServiceError => "service_error",
            ErrorKind::JsonDecodeError => "json_decode_error",
            ErrorKind::SchemaValidationError => "schema_validation_error",
            ErrorKind::MissingResponse => "missing_response",
            ErrorKind::MissingInResult => "missing_in_result",
            ErrorKind::ResultKeyMismatch => "result_key_mismatch",
            ErrorKind::Other => "other",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch_terminal_failure" => Ok(ErrorKind::BatchTerminalFailure),
            "submission_failure" => Ok(ErrorKind::SubmissionFailure),
            "service_error" => Ok(ErrorKind::ServiceError),
            "json_decode_error" => Ok(ErrorKind::JsonDecodeError),
            "schema_validation_error" => Ok(ErrorKind::SchemaValidationError),
            "missing_response" => Ok(ErrorKind::MissingResponse),
            "missing_in_result" => Ok(ErrorKind::MissingInResult),
            "result_key_mismatch" => Ok(ErrorKind::ResultKeyMismatch),
            "other" => Ok(ErrorKind::Other),
            other => Err(UnknownErrorKind(other.to_owned())),
        }
    }
}

// FAILURE LOG
// ================================================================================================

/// One append-only failure-log row.
///
/// `created_at` is stamped by the state store at insertion time and is therefore not part of the
/// entry. The model/prompt fields snapshot the run configuration so failed responses can be
/// analyzed offline without the original config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLogEntry {
    pub record_key: RecordKey,
    pub batch_id: Option<BatchId>,
    pub attempt_number: u32,
    pub error_kind: ErrorKind,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub raw_response_text: Option<String>,
    pub extracted_text: Option<String>,
    pub raw_response_blob: Option<String>,
    pub model_name: Option<String>,
    pub prompt_name: Option<String>,
    pub prompt_template: Option<String>,
    pub generation_config: Option<String>,
}

impl FailureLogEntry {
    /// A minimal entry; the optional diagnostic fields start empty.
    pub fn new(
        record_key: RecordKey,
        batch_id: Option<BatchId>,
        attempt_number: u32,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            record_key,
            batch_id,
            attempt_number,
            error_kind,
            error_message: None,
            error_trace: None,
            raw_response_text: None,
            extracted_text: None,
            raw_response_blob: None,
            model_name: None,
            prompt_name: None,
            prompt_template: None,
            generation_config: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_text_codec_round_trips() {
        for kind in [
            ErrorKind::BatchTerminalFailure,
            ErrorKind::SubmissionFailure,
            ErrorKind::ServiceError,
            ErrorKind::JsonDecodeError,
            ErrorKind::SchemaValidationError,
            ErrorKind::MissingResponse,
            ErrorKind::MissingInResult,
            ErrorKind::ResultKeyMismatch,
            ErrorKind::Other,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("timeout".parse::<ErrorKind>().is_err());
    }
}
