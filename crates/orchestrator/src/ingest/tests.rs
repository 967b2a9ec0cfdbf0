use std::fs;

use folio_domain::{BatchId, ErrorKind, RecordKey};
use folio_store::db::Db;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::{IngestReport, ResultIngestor, RunContext};
use crate::{
    gateway::{RecordOutcome, RecordResult},
    observer::NoopObserver,
    validator::JsonObjectValidator,
};

// FIXTURES
// ================================================================================================

fn key(raw: &str) -> RecordKey {
    raw.parse().unwrap()
}

fn success(raw_key: &str, text: &str) -> RecordOutcome {
    RecordOutcome {
        key: raw_key.to_owned(),
        result: RecordResult::Success {
            raw_response_text: text.to_owned(),
            raw_response_blob: Some(format!("{{\"response\": {text:?}}}")),
        },
    }
}

fn service_error(raw_key: &str, message: &str) -> RecordOutcome {
    RecordOutcome {
        key: raw_key.to_owned(),
        result: RecordResult::ServiceError {
            message: message.to_owned(),
            raw_response_blob: Some(r#"{"error": {"code": 500}}"#.to_owned()),
        },
    }
}

struct Fixture {
    _state_dir: TempDir,
    output: TempDir,
    db: Db,
    run: RunContext,
}

impl Fixture {
    async fn new() -> Self {
        let state_dir = TempDir::new().unwrap();
        let db = Db::setup(state_dir.path().join("state.sqlite3")).await.unwrap();
        Self {
            _state_dir: state_dir,
            output: TempDir::new().unwrap(),
            db,
            run: RunContext {
                model_name: Some("folio-ocr-1".into()),
                prompt_name: Some("page-transcribe".into()),
                ..RunContext::default()
            },
        }
    }

    async fn ingest(&self, expected: &[&str], outcomes: Vec<RecordOutcome>) -> IngestReport {
        self.ingest_as("b1", expected, outcomes).await
    }

    async fn ingest_as(
        &self,
        batch_id: &str,
        expected: &[&str],
        outcomes: Vec<RecordOutcome>,
    ) -> IngestReport {
        let expected: Vec<_> = expected.iter().map(|raw| key(raw)).collect();
        let ingestor = ResultIngestor::new(
            &self.db,
            self.output.path(),
            &JsonObjectValidator,
            &NoopObserver,
            &self.run,
        );
        ingestor.ingest(&BatchId::new(batch_id), &expected, outcomes).await.unwrap()
    }

    fn output_contents(&self, raw_key: &str) -> Option<String> {
        fs::read_to_string(self.output.path().join(key(raw_key).relative_path("json"))).ok()
    }
}

// SUCCESS PATH TESTS
// ================================================================================================

#[tokio::test]
async fn validated_success_writes_artifact_without_counter_bump() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![success("AL:Howard:1849:1", r#"{"page": 1}"#)])
        .await;

    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
    assert!(report.failed.is_empty());
    assert_eq!(fixture.output_contents("AL:Howard:1849:1").as_deref(), Some(r#"{"page": 1}"#));
    assert!(fixture.db.select_failure_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn existing_output_is_never_rewritten() {
    let fixture = Fixture::new().await;

    let path = fixture.output.path().join(key("AL:Howard:1849:1").relative_path("json"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, r#"{"page": "original"}"#).unwrap();

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![success("AL:Howard:1849:1", r#"{"page": "new"}"#)])
        .await;

    // Re-ingestion after a crash between write and finalize counts as a success without
    // touching the file or the counters.
    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
    assert_eq!(
        fixture.output_contents("AL:Howard:1849:1").as_deref(),
        Some(r#"{"page": "original"}"#)
    );
    assert!(fixture.db.select_failure_counts().await.unwrap().is_empty());
}

// FAILURE PATH TESTS
// ================================================================================================

#[tokio::test]
async fn service_error_bumps_counter_and_preserves_blob() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![service_error("AL:Howard:1849:1", "internal error")])
        .await;

    assert_eq!(report.failed, vec![(key("AL:Howard:1849:1"), ErrorKind::ServiceError)]);
    assert_eq!(fixture.output_contents("AL:Howard:1849:1"), None);

    let counts = fixture.db.select_failure_counts().await.unwrap();
    assert_eq!(counts.get(&key("AL:Howard:1849:1")), Some(&1));

    let log = fixture.db.select_failure_log(key("AL:Howard:1849:1")).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].entry.error_kind, ErrorKind::ServiceError);
    assert_eq!(log[0].entry.attempt_number, 1);
    assert_eq!(log[0].entry.error_message.as_deref(), Some("internal error"));
    assert_eq!(log[0].entry.raw_response_blob.as_deref(), Some(r#"{"error": {"code": 500}}"#));
    assert_eq!(log[0].entry.model_name.as_deref(), Some("folio-ocr-1"));
}

#[tokio::test]
async fn invalid_json_is_logged_with_raw_text_preserved() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![success("AL:Howard:1849:1", "not json at all")])
        .await;

    assert_eq!(report.failed, vec![(key("AL:Howard:1849:1"), ErrorKind::JsonDecodeError)]);
    assert_eq!(fixture.output_contents("AL:Howard:1849:1"), None);

    let log = fixture.db.select_failure_log(key("AL:Howard:1849:1")).await.unwrap();
    assert_eq!(log[0].entry.error_kind, ErrorKind::JsonDecodeError);
    assert_eq!(log[0].entry.raw_response_text.as_deref(), Some("not json at all"));
    assert_eq!(log[0].entry.extracted_text.as_deref(), Some("not json at all"));
}

#[tokio::test]
async fn empty_response_maps_to_missing_response() {
    let fixture = Fixture::new().await;

    let report =
        fixture.ingest(&["AL:Howard:1849:1"], vec![success("AL:Howard:1849:1", "  ")]).await;

    assert_eq!(report.failed, vec![(key("AL:Howard:1849:1"), ErrorKind::MissingResponse)]);
}

#[tokio::test]
async fn expected_records_missing_from_results_are_failures() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(
            &["AL:Howard:1849:1", "AL:Howard:1849:2"],
            vec![success("AL:Howard:1849:1", r#"{"page": 1}"#)],
        )
        .await;

    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
    assert_eq!(report.failed, vec![(key("AL:Howard:1849:2"), ErrorKind::MissingInResult)]);

    let counts = fixture.db.select_failure_counts().await.unwrap();
    assert_eq!(counts.get(&key("AL:Howard:1849:2")), Some(&1));
    assert_eq!(counts.get(&key("AL:Howard:1849:1")), None);
}

// MISMATCH TESTS
// ================================================================================================

#[tokio::test]
async fn unexpected_keys_are_mismatches_without_counter_bumps() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(
            &["AL:Howard:1849:1"],
            vec![
                success("AL:Howard:1849:1", r#"{"page": 1}"#),
                success("CA:Lincoln:2023:4", r#"{"page": 4}"#),
            ],
        )
        .await;

    assert_eq!(report.mismatched, 1);
    assert_eq!(fixture.output_contents("CA:Lincoln:2023:4"), None);
    assert!(fixture.db.select_failure_counts().await.unwrap().is_empty());

    let log = fixture.db.select_failure_log(key("CA:Lincoln:2023:4")).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].entry.error_kind, ErrorKind::ResultKeyMismatch);
}

#[tokio::test]
async fn unparseable_result_keys_are_counted_but_not_fatal() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![
            success("garbage-key", r#"{"page": 0}"#),
            success("AL:Howard:1849:1", r#"{"page": 1}"#),
        ])
        .await;

    assert_eq!(report.mismatched, 1);
    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
}

#[tokio::test]
async fn duplicated_result_keys_are_extra_results() {
    let fixture = Fixture::new().await;

    let report = fixture
        .ingest(&["AL:Howard:1849:1"], vec![
            success("AL:Howard:1849:1", r#"{"page": 1}"#),
            success("AL:Howard:1849:1", r#"{"page": 1}"#),
        ])
        .await;

    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
    assert_eq!(report.mismatched, 1);
}

// ATTEMPT NUMBER TESTS
// ================================================================================================

#[tokio::test]
async fn attempt_numbers_follow_the_failure_counter() {
    let fixture = Fixture::new().await;

    // The record fails in two successive batches.
    fixture
        .ingest_as("b1", &["AL:Howard:1849:1"], vec![service_error("AL:Howard:1849:1", "first")])
        .await;
    fixture
        .ingest_as("b2", &["AL:Howard:1849:1"], vec![
            service_error("AL:Howard:1849:1", "second"),
        ])
        .await;

    let log = fixture.db.select_failure_log(key("AL:Howard:1849:1")).await.unwrap();
    assert_eq!(log.len(), 2);
    // Newest first.
    assert_eq!(log[0].entry.attempt_number, 2);
    assert_eq!(log[0].entry.batch_id, Some(BatchId::new("b2")));
    assert_eq!(log[1].entry.attempt_number, 1);
    assert_eq!(log[1].entry.batch_id, Some(BatchId::new("b1")));
}

// CRASH RE-INGESTION TESTS
// ================================================================================================

#[tokio::test]
async fn reingesting_a_crashed_mixed_batch_does_not_double_count() {
    let fixture = Fixture::new().await;

    let outcomes = || {
        vec![
            success("AL:Howard:1849:1", r#"{"page": 1}"#),
            service_error("CA:Lincoln:2023:1", "internal error"),
        ]
    };
    let expected = ["AL:Howard:1849:1", "CA:Lincoln:2023:1"];

    // The first ingestion ran fully, but the process died before the batch was finalized; the
    // restart re-polls the still-active batch and ingests the same outcomes again.
    fixture.ingest(&expected, outcomes()).await;
    let report = fixture.ingest(&expected, outcomes()).await;

    // The re-run still reports the batch's outcome...
    assert_eq!(report.succeeded, vec![key("AL:Howard:1849:1")]);
    assert_eq!(report.failed, vec![(key("CA:Lincoln:2023:1"), ErrorKind::ServiceError)]);

    // ...but the persistent state matches a single, crash-free ingestion.
    let counts = fixture.db.select_failure_counts().await.unwrap();
    assert_eq!(counts.get(&key("CA:Lincoln:2023:1")), Some(&1));
    let log = fixture.db.select_failure_log(key("CA:Lincoln:2023:1")).await.unwrap();
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn reingesting_missing_results_does_not_double_count() {
    let fixture = Fixture::new().await;

    let expected = ["AL:Howard:1849:1", "CA:Lincoln:2023:1"];
    let outcomes = || vec![success("AL:Howard:1849:1", r#"{"page": 1}"#)];

    fixture.ingest(&expected, outcomes()).await;
    let report = fixture.ingest(&expected, outcomes()).await;

    assert_eq!(report.failed, vec![(key("CA:Lincoln:2023:1"), ErrorKind::MissingInResult)]);
    let counts = fixture.db.select_failure_counts().await.unwrap();
    assert_eq!(counts.get(&key("CA:Lincoln:2023:1")), Some(&1));
    assert_eq!(
        fixture.db.select_failure_log(key("CA:Lincoln:2023:1")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn reingesting_mismatched_keys_does_not_duplicate_log_rows() {
    let fixture = Fixture::new().await;

    let outcomes = || {
        vec![
            success("AL:Howard:1849:1", r#"{"page": 1}"#),
            success("CA:Lincoln:2023:4", r#"{"page": 4}"#),
        ]
    };

    fixture.ingest(&["AL:Howard:1849:1"], outcomes()).await;
    let report = fixture.ingest(&["AL:Howard:1849:1"], outcomes()).await;

    assert_eq!(report.mismatched, 1);
    assert_eq!(
        fixture.db.select_failure_log(key("CA:Lincoln:2023:4")).await.unwrap().len(),
        1
    );
}
