use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// Main config
// ================================================================================================

/// Orchestrator configuration, loaded from TOML via `folio_utils::config::load_config`.
///
/// Secrets (remote-service credentials) are deliberately absent: gateway implementations read
/// them from the environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    pub execution: ExecutionConfig,
    pub model: ModelConfig,
    pub batch: BatchConfig,
    pub files: FilesConfig,
    pub prompt: PromptConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root of the label files whose existence defines the workload. Read-only.
    pub label_source_dir: PathBuf,
    /// Root of the page image assets. Read-only; consumed by the gateway.
    pub image_source_dir: PathBuf,
    /// Root the validated artifacts are written under. The only tree the orchestrator mutates.
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FiltersConfig {
    /// Allow-list of state names; empty means all states.
    #[serde(default)]
    pub target_states: Vec<String>,
    /// Inclusive year range; absent means all years.
    #[serde(default)]
    pub target_years: Option<YearRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YearRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// A record whose failure counter strictly exceeds this is dead-lettered.
    pub max_retries: u32,
    /// Maximum number of records per submitted batch.
    pub batch_size_limit: usize,
    /// Maximum number of concurrently active remote batches.
    pub max_concurrent_batches: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    /// Opaque generation parameters, forwarded to the gateway and snapshotted into failure
    /// logs. Never interpreted by the orchestrator.
    #[serde(default)]
    pub generation_config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Sleep between passes while batches are pending remotely.
    pub poll_interval_seconds: u64,
    /// Polls per batch within one run before the batch is treated as expired.
    pub max_poll_attempts: u32,
    /// Human-readable prefix of remote batch display names.
    pub display_name_prefix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesConfig {
    /// Bounded attempts for submissions and result downloads.
    pub upload_retry_attempts: u32,
    /// Base of the exponential backoff between attempts.
    pub upload_retry_backoff_seconds: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptConfig {
    pub registry_dir: PathBuf,
    pub name: String,
    pub template_file: PathBuf,
}

impl OrchestratorConfig {
    /// Rejects configurations the orchestrator cannot run with. Fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("paths.label_source_dir", &self.paths.label_source_dir),
            ("paths.image_source_dir", &self.paths.image_source_dir),
            ("paths.output_dir", &self.paths.output_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath { name });
            }
        }

        if let Some(range) = self.filters.target_years {
            if range.start > range.end {
                return Err(ConfigError::InvertedYearRange {
                    start: range.start,
                    end: range.end,
                });
            }
        }

        for (name, value) in [
            ("execution.batch_size_limit", self.execution.batch_size_limit),
            ("execution.max_concurrent_batches", self.execution.max_concurrent_batches),
            ("batch.poll_interval_seconds", self.batch.poll_interval_seconds as usize),
            ("batch.max_poll_attempts", self.batch.max_poll_attempts as usize),
            ("files.upload_retry_attempts", self.files.upload_retry_attempts as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { name });
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.batch.poll_interval_seconds)
    }

    pub fn upload_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.files.upload_retry_backoff_seconds)
    }

    /// The inclusive year range the scanner filters by, if any.
    pub fn year_range(&self) -> Option<(u32, u32)> {
        self.filters.target_years.map(|range| (range.start, range.end))
    }

    /// Path of the state database, colocated with the output tree.
    pub fn database_filepath(&self) -> PathBuf {
        self.paths.output_dir.join("folio-state.sqlite3")
    }
}

impl Display for OrchestratorConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{{ labels: {:?}, output: {:?}, states: {:?}, years: {:?}, max_retries: {}, batch_size_limit: {}, max_concurrent_batches: {}, model: \"{}\" }}",
            self.paths.label_source_dir,
            self.paths.output_dir,
            self.filters.target_states,
            self.filters.target_years,
            self.execution.max_retries,
            self.execution.batch_size_limit,
            self.execution.max_concurrent_batches,
            self.model.name,
        ))
    }
}
