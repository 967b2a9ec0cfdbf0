use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use folio_domain::{BatchId, Book, RecordKey};
use tracing::{debug, instrument, warn};

use crate::{errors::ScanError, COMPONENT};

#[cfg(test)]
mod tests;

// SCAN SNAPSHOT
// ================================================================================================

/// Everything a wave derivation depends on.
///
/// The scanner is a pure function of this snapshot: identical snapshots produce identical,
/// stably-ordered waves. The failure-count and in-flight maps are the store's consistent
/// snapshots taken by the caller.
pub struct ScanSnapshot<'a> {
    pub label_root: &'a Path,
    pub output_root: &'a Path,
    /// Allow-list of state names; empty means all states.
    pub state_filter: &'a [String],
    /// Inclusive year range; `None` means all years.
    pub year_range: Option<(u32, u32)>,
    pub max_retries: u32,
    pub failure_counts: &'a BTreeMap<RecordKey, u32>,
    pub inflight: &'a BTreeMap<RecordKey, BatchId>,
    pub batch_size_limit: usize,
}

// WAVE DERIVATION
// ================================================================================================

/// Derives the next runnable wave of record keys.
///
/// Every returned key has a label file, no output file, is not in flight, is below the
/// dead-letter threshold, and is either the first labelled page of its book or directly
/// preceded by a Done labelled page. Keys are ordered by `(state, school, year, page)` and
/// truncated at `batch_size_limit`.
#[instrument(target = COMPONENT, skip_all, err)]
pub fn next_wave(snapshot: &ScanSnapshot<'_>) -> Result<Vec<RecordKey>, ScanError> {
    let books = enumerate_labels(snapshot)?;

    let mut eligible = Vec::new();
    'book: for (book, pages) in &books {
        // The first labelled page of a book is dependency-free: the book starts where the
        // label set starts.
        let mut predecessor_done = true;

        for key in pages {
            if output_exists(snapshot.output_root, key)? {
                predecessor_done = true;
                continue;
            }
            if snapshot.failure_counts.get(key).copied().unwrap_or(0) > snapshot.max_retries {
                // Dead-lettered pages are skipped, not blocking by themselves; their
                // successors block on the missing output instead.
                predecessor_done = false;
                continue;
            }
            if snapshot.inflight.contains_key(key) {
                predecessor_done = false;
                continue;
            }

            if predecessor_done {
                eligible.push(key.clone());
                predecessor_done = false;
            } else {
                // Blocked: nothing later in this book can run in this wave.
                debug!(target: COMPONENT, %book, page = key.page(), "Book walk blocked");
                continue 'book;
            }
        }
    }

    eligible.truncate(snapshot.batch_size_limit);
    Ok(eligible)
}

// LABEL ENUMERATION
// ================================================================================================

/// Enumerates `label_root/state/school/year/page.json` into books with page-sorted keys,
/// applying the state and year filters.
///
/// Entries whose path components fail to parse are skipped with a warning; they never fail the
/// scan.
fn enumerate_labels(
    snapshot: &ScanSnapshot<'_>,
) -> Result<BTreeMap<Book, Vec<RecordKey>>, ScanError> {
    let mut books: BTreeMap<Book, Vec<RecordKey>> = BTreeMap::new();

    for (state, state_path) in subdirectories(snapshot.label_root)? {
        if !snapshot.state_filter.is_empty() && !snapshot.state_filter.contains(&state) {
            continue;
        }

        for (school, school_path) in subdirectories(&state_path)? {
            for (year_name, year_path) in subdirectories(&school_path)? {
                let Ok(year) = year_name.parse::<u32>() else {
                    warn!(
                        target: COMPONENT,
                        path = %year_path.display(),
                        "Skipping label directory with unparseable year"
                    );
                    continue;
                };
                if let Some((lo, hi)) = snapshot.year_range {
                    if year < lo || year > hi {
                        continue;
                    }
                }

                for entry in sorted_entries(&year_path)? {
                    let path = entry.path();
                    if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                        continue;
                    }

                    let page = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<u32>().ok());
                    let Some(page) = page else {
                        warn!(
                            target: COMPONENT,
                            path = %path.display(),
                            "Skipping label file with unparseable page number"
                        );
                        continue;
                    };

                    match RecordKey::new(state.clone(), school.clone(), year, page) {
                        Ok(key) => books.entry(key.book()).or_default().push(key),
                        Err(err) => {
                            warn!(
                                target: COMPONENT,
                                path = %path.display(),
                                %err,
                                "Skipping label file with invalid key components"
                            );
                        },
                    }
                }
            }
        }
    }

    for pages in books.values_mut() {
        // Same book throughout, so key order is page order.
        pages.sort();
    }

    Ok(books)
}

/// Sorted `(name, path)` pairs of the subdirectories of `path`. A missing directory yields an
/// error; anything that is not valid UTF-8 is skipped with a warning.
fn subdirectories(path: &Path) -> Result<Vec<(String, PathBuf)>, ScanError> {
    let mut dirs = Vec::new();
    for entry in sorted_entries(path)? {
        let entry_path = entry.path();
        if !entry_path.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => dirs.push((name, entry_path)),
            Err(name) => {
                warn!(
                    target: COMPONENT,
                    ?name,
                    parent = %path.display(),
                    "Skipping non-UTF-8 directory name"
                );
            },
        }
    }
    Ok(dirs)
}

/// Directory entries sorted by file name, so scans never depend on readdir order.
fn sorted_entries(path: &Path) -> Result<Vec<fs::DirEntry>, ScanError> {
    let read_dir = fs::read_dir(path).map_err(|source| ScanError::LabelRootUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = read_dir
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| ScanError::LabelRootUnreadable { path: path.to_path_buf(), source })?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

/// Whether the success marker of a record exists.
fn output_exists(output_root: &Path, key: &RecordKey) -> Result<bool, ScanError> {
    let path = output_root.join(key.relative_path("json"));
    match fs::metadata(&path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ScanError::OutputProbeFailed { path, source }),
    }
}
