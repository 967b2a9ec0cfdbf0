use crate::errors::{ValidationError, ValidationErrorKind};

// VALIDATED ARTIFACT
// ================================================================================================

/// A model response that passed validation; exactly what gets written to the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedArtifact {
    json: String,
}

impl ValidatedArtifact {
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }

    pub fn as_json(&self) -> &str {
        &self.json
    }
}

// OUTPUT VALIDATOR
// ================================================================================================

/// Validates raw model output into a structured artifact.
///
/// Domain-schema validation is a collaborator concern; the orchestrator only depends on the
/// accept/reject decision and on the preserved diagnostics of a rejection.
pub trait OutputValidator: Send + Sync + 'static {
    fn validate(&self, raw_response_text: &str) -> Result<ValidatedArtifact, ValidationError>;
}

/// Baseline validator: requires the response to be a non-empty JSON object.
///
/// Deployments with a domain schema substitute their own implementation; this one is enough to
/// keep malformed and empty responses out of the output tree.
pub struct JsonObjectValidator;

impl OutputValidator for JsonObjectValidator {
    fn validate(&self, raw_response_text: &str) -> Result<ValidatedArtifact, ValidationError> {
        let trimmed = raw_response_text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError {
                kind: ValidationErrorKind::MissingResponse,
                message: "response carried no model output".to_owned(),
                extracted_text: None,
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(trimmed).map_err(|err| ValidationError {
                kind: ValidationErrorKind::JsonDecode,
                message: err.to_string(),
                extracted_text: Some(trimmed.to_owned()),
            })?;

        if !value.is_object() {
            return Err(ValidationError {
                kind: ValidationErrorKind::SchemaValidation,
                message: format!("expected a JSON object, got {value}"),
                extracted_text: Some(trimmed.to_owned()),
            });
        }

        Ok(ValidatedArtifact::new(trimmed))
    }
}
