use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use folio_domain::{ErrorKind, RecordKey};
use itertools::Itertools;
use serde::Serialize;

/// Directory under the output root receiving wave-summary artifacts. Lives inside the output
/// root because that is the only tree the orchestrator may mutate.
const WAVES_DIR: &str = "_waves";

/// How many failing record keys a summary names explicitly.
const TOP_FAILURES: usize = 5;

// WAVE SUMMARY
// ================================================================================================

/// Human- and machine-readable account of one orchestration pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WaveSummary {
    pub wave: u32,
    pub created_at: u64,
    pub total_records: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures_by_kind: BTreeMap<ErrorKind, usize>,
    pub top_failures: Vec<TopFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopFailure {
    pub record_key: RecordKey,
    pub failure_count: u32,
}

impl WaveSummary {
    pub fn new(wave: u32) -> Self {
        Self {
            wave,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, count: usize) {
        self.total_records += count;
        self.succeeded += count;
    }

    pub fn record_failure(&mut self, kind: ErrorKind) {
        self.total_records += 1;
        self.failed += 1;
        *self.failures_by_kind.entry(kind).or_default() += 1;
    }

    /// Whether the pass did anything worth reporting.
    pub fn is_empty(&self) -> bool {
        self.total_records == 0
    }

    /// Fills `top_failures` from a failure-count snapshot, worst offenders first.
    pub fn set_top_failures(&mut self, failure_counts: &BTreeMap<RecordKey, u32>) {
        self.top_failures = failure_counts
            .iter()
            .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
            .take(TOP_FAILURES)
            .map(|(record_key, failure_count)| TopFailure {
                record_key: record_key.clone(),
                failure_count: *failure_count,
            })
            .collect();
    }

    /// Writes the summary as a JSON artifact under `output_root/_waves/`, returning its path.
    pub fn write_artifact(&self, output_root: &Path) -> io::Result<PathBuf> {
        let dir = output_root.join(WAVES_DIR);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("wave-{}-{:03}.json", self.created_at, self.wave));
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl Display for WaveSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wave {}: {} records, {} succeeded, {} failed",
            self.wave, self.total_records, self.succeeded, self.failed
        )?;

        if !self.failures_by_kind.is_empty() {
            let kinds = self
                .failures_by_kind
                .iter()
                .map(|(kind, count)| format!("{kind}: {count}"))
                .join(", ");
            write!(f, " ({kinds})")?;
        }

        if !self.top_failures.is_empty() {
            let top = self
                .top_failures
                .iter()
                .map(|failure| format!("{} (x{})", failure.record_key, failure.failure_count))
                .join(", ");
            write!(f, "; top failing: {top}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> RecordKey {
        raw.parse().unwrap()
    }

    #[test]
    fn renders_counts_and_top_failures() {
        let mut summary = WaveSummary::new(3);
        summary.record_success(2);
        summary.record_failure(ErrorKind::ServiceError);
        summary.record_failure(ErrorKind::ServiceError);
        summary.record_failure(ErrorKind::JsonDecodeError);

        let mut counts = BTreeMap::new();
        counts.insert(key("CA:Lincoln:2023:4"), 4);
        counts.insert(key("AL:Howard:1849:1"), 1);
        summary.set_top_failures(&counts);

        let rendered = summary.to_string();
        assert!(rendered.starts_with("wave 3: 5 records, 2 succeeded, 3 failed"));
        assert!(rendered.contains("service_error: 2"));
        assert!(rendered.contains("json_decode_error: 1"));
        assert!(rendered.contains("CA:Lincoln:2023:4 (x4)"));
    }

    #[test]
    fn artifact_lands_under_the_waves_dir() {
        let output = tempfile::TempDir::new().unwrap();
        let mut summary = WaveSummary::new(1);
        summary.record_success(1);

        let path = summary.write_artifact(output.path()).unwrap();
        assert!(path.starts_with(output.path().join("_waves")));

        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(parsed["succeeded"], 1);
    }

    #[test]
    fn top_failures_are_worst_first_and_capped() {
        let mut summary = WaveSummary::new(1);
        let counts: BTreeMap<_, _> =
            (1..=8).map(|page| (key(&format!("AL:Howard:1849:{page}")), page)).collect();
        summary.set_top_failures(&counts);

        assert_eq!(summary.top_failures.len(), 5);
        assert_eq!(summary.top_failures[0].failure_count, 8);
        assert_eq!(summary.top_failures[4].failure_count, 4);
    }
}
