use std::{collections::BTreeMap, fs, path::Path};

use folio_domain::{BatchId, RecordKey};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::{next_wave, ScanSnapshot};

// FIXTURES
// ================================================================================================

struct Fixture {
    labels: TempDir,
    output: TempDir,
    failure_counts: BTreeMap<RecordKey, u32>,
    inflight: BTreeMap<RecordKey, BatchId>,
    state_filter: Vec<String>,
    year_range: Option<(u32, u32)>,
    max_retries: u32,
    batch_size_limit: usize,
}

impl Fixture {
    fn new() -> Self {
        Self {
            labels: TempDir::new().unwrap(),
            output: TempDir::new().unwrap(),
            failure_counts: BTreeMap::new(),
            inflight: BTreeMap::new(),
            state_filter: Vec::new(),
            year_range: None,
            max_retries: 3,
            batch_size_limit: 100,
        }
    }

    fn label(&self, raw: &str) -> &Self {
        touch(self.labels.path(), &key(raw).relative_path("json"));
        self
    }

    fn done(&self, raw: &str) -> &Self {
        touch(self.output.path(), &key(raw).relative_path("json"));
        self
    }

    fn scan(&self) -> Vec<String> {
        let snapshot = ScanSnapshot {
            label_root: self.labels.path(),
            output_root: self.output.path(),
            state_filter: &self.state_filter,
            year_range: self.year_range,
            max_retries: self.max_retries,
            failure_counts: &self.failure_counts,
            inflight: &self.inflight,
            batch_size_limit: self.batch_size_limit,
        };
        next_wave(&snapshot).unwrap().iter().map(ToString::to_string).collect()
    }
}

fn key(raw: &str) -> RecordKey {
    raw.parse().unwrap()
}

fn touch(root: &Path, relative: &Path) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"{}").unwrap();
}

// DEPENDENCY CHAIN TESTS
// ================================================================================================

#[test]
fn first_wave_of_a_fresh_book_is_its_first_page() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2").label("AL:Howard:1849:3");

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:1"]);
}

#[test]
fn completed_predecessor_unblocks_the_next_page() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2").label("AL:Howard:1849:3");
    fixture.done("AL:Howard:1849:1");

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:2"]);
}

#[test]
fn gaps_in_the_label_sequence_chain_to_the_previous_labelled_page() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:3").label("AL:Howard:1849:4").label("AL:Howard:1849:12");

    // The book starts where the label set starts.
    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:3"]);

    fixture.done("AL:Howard:1849:3");
    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:4"]);

    // Page 12 depends on labelled page 4, not on the missing page 11.
    fixture.done("AL:Howard:1849:4");
    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:12"]);
}

#[test]
fn done_pages_are_skipped_without_stopping_the_walk() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2").label("AL:Howard:1849:3");
    fixture.done("AL:Howard:1849:1").done("AL:Howard:1849:2");

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:3"]);
}

#[test]
fn a_blocked_page_ends_the_book_walk() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2").label("AL:Howard:1849:3");

    // Page 1 becomes eligible, pages 2 and 3 stay blocked behind it in the same wave.
    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:1"]);
}

// DEAD LETTER TESTS
// ================================================================================================

#[test]
fn dead_letter_excludes_the_record_until_reset() {
    let mut fixture = Fixture::new();
    fixture.label("CA:Lincoln:2023:4");
    fixture.failure_counts.insert(key("CA:Lincoln:2023:4"), 4);
    fixture.max_retries = 3;

    assert_eq!(fixture.scan(), Vec::<String>::new());

    // Resetting the counter (the operator's `reset-failures`) makes it eligible again.
    fixture.failure_counts.clear();
    assert_eq!(fixture.scan(), vec!["CA:Lincoln:2023:4"]);
}

#[test]
fn failure_count_at_the_limit_is_still_eligible() {
    let mut fixture = Fixture::new();
    fixture.label("CA:Lincoln:2023:4");
    fixture.failure_counts.insert(key("CA:Lincoln:2023:4"), 3);
    fixture.max_retries = 3;

    assert_eq!(fixture.scan(), vec!["CA:Lincoln:2023:4"]);
}

#[test]
fn successors_of_a_dead_page_are_blocked() {
    let mut fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2");
    fixture.failure_counts.insert(key("AL:Howard:1849:1"), 9);

    assert_eq!(fixture.scan(), Vec::<String>::new());
}

#[test]
fn pages_after_a_dead_but_done_stretch_stay_reachable() {
    let mut fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2").label("AL:Howard:1849:3");
    fixture.failure_counts.insert(key("AL:Howard:1849:1"), 9);
    fixture.done("AL:Howard:1849:2");

    // Page 1 is dead, page 2 is Done, so page 3's direct predecessor is Done.
    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:3"]);
}

// IN-FLIGHT TESTS
// ================================================================================================

#[test]
fn inflight_records_are_never_rescheduled() {
    let mut fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("AL:Howard:1849:2");
    fixture.inflight.insert(key("AL:Howard:1849:1"), BatchId::new("b1"));

    // Page 1 is in flight and page 2 is blocked behind it.
    assert_eq!(fixture.scan(), Vec::<String>::new());
}

// ORDERING, FILTERS, AND LIMIT TESTS
// ================================================================================================

#[test]
fn waves_interleave_books_in_stable_key_order() {
    let fixture = Fixture::new();
    fixture
        .label("CA:Lincoln:2023:1")
        .label("AL:Howard:1849:1")
        .label("AL:Howard:1849:2")
        .label("AL:Central:1850:7");

    assert_eq!(
        fixture.scan(),
        vec!["AL:Central:1850:7", "AL:Howard:1849:1", "CA:Lincoln:2023:1"]
    );
}

#[test]
fn batch_size_limit_truncates_the_wave() {
    let mut fixture = Fixture::new();
    fixture.label("A:School:2000:1").label("A:School:2000:2");
    fixture.label("B:School:2000:1").label("B:School:2000:2");
    fixture.batch_size_limit = 1;

    // Both books have an eligible first page; the limit keeps only the first in key order.
    assert_eq!(fixture.scan(), vec!["A:School:2000:1"]);
}

#[test]
fn state_filter_is_an_allow_list() {
    let mut fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1").label("CA:Lincoln:2023:1");
    fixture.state_filter = vec!["CA".to_owned()];

    assert_eq!(fixture.scan(), vec!["CA:Lincoln:2023:1"]);
}

#[test]
fn year_range_is_inclusive() {
    let mut fixture = Fixture::new();
    fixture
        .label("AL:Howard:1848:1")
        .label("AL:Howard:1849:1")
        .label("AL:Howard:1850:1")
        .label("AL:Howard:1851:1");
    fixture.year_range = Some((1849, 1850));

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:1", "AL:Howard:1850:1"]);
}

#[test]
fn repeated_scans_of_identical_snapshots_are_identical() {
    let fixture = Fixture::new();
    fixture
        .label("AL:Howard:1849:1")
        .label("AL:Howard:1849:2")
        .label("CA:Lincoln:2023:1")
        .done("AL:Howard:1849:1");

    let first = fixture.scan();
    let second = fixture.scan();
    assert_eq!(first, second);
    assert_eq!(first, vec!["AL:Howard:1849:2", "CA:Lincoln:2023:1"]);
}

// MALFORMED INPUT TESTS
// ================================================================================================

#[test]
fn unparseable_labels_are_skipped_not_fatal() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1");

    // A non-numeric page file, a non-numeric year directory, and a stray non-JSON file.
    touch(fixture.labels.path(), Path::new("AL/Howard/1849/cover.json"));
    touch(fixture.labels.path(), Path::new("AL/Howard/first-edition/1.json"));
    touch(fixture.labels.path(), Path::new("AL/Howard/1849/notes.txt"));

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:1"]);
}

#[test]
fn zero_numbered_pages_are_skipped() {
    let fixture = Fixture::new();
    fixture.label("AL:Howard:1849:1");
    touch(fixture.labels.path(), Path::new("AL/Howard/1849/0.json"));

    assert_eq!(fixture.scan(), vec!["AL:Howard:1849:1"]);
}

#[test]
fn missing_label_root_is_an_error() {
    let fixture = Fixture::new();
    let missing = fixture.labels.path().join("does-not-exist");
    let failure_counts = BTreeMap::new();
    let inflight = BTreeMap::new();

    let snapshot = ScanSnapshot {
        label_root: &missing,
        output_root: fixture.output.path(),
        state_filter: &[],
        year_range: None,
        max_retries: 3,
        failure_counts: &failure_counts,
        inflight: &inflight,
        batch_size_limit: 100,
    };
    assert!(next_wave(&snapshot).is_err());
}
