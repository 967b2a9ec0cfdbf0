use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// RECORD KEY
// ================================================================================================

/// The globally unique identity of a single page in the workload.
///
/// Canonical string form is `state:school:year:page`, which is also the encoding used by the
/// state store and by the remote service's per-record keys. Ordering is lexicographic over the
/// `(state, school, year, page)` tuple, which defines the scanner's stable output order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    state: String,
    school: String,
    year: u32,
    page: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordKeyError {
    #[error("state and school components must be non-empty")]
    EmptyComponent,
    #[error("component {0:?} contains a ':' which is reserved as the key separator")]
    ReservedSeparator(String),
    #[error("year and page must be positive integers, got {0}")]
    NonPositiveNumber(String),
    #[error("malformed record key {0:?}, expected state:school:year:page")]
    Malformed(String),
}

impl RecordKey {
    pub fn new(
        state: impl Into<String>,
        school: impl Into<String>,
        year: u32,
        page: u32,
    ) -> Result<Self, RecordKeyError> {
        let state = state.into();
        let school = school.into();

        if state.is_empty() || school.is_empty() {
            return Err(RecordKeyError::EmptyComponent);
        }
        for component in [&state, &school] {
            if component.contains(':') {
                return Err(RecordKeyError::ReservedSeparator(component.clone()));
            }
        }
        if year == 0 || page == 0 {
            return Err(RecordKeyError::NonPositiveNumber(format!("{year}:{page}")));
        }

        Ok(Self { state, school, year, page })
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn school(&self) -> &str {
        &self.school
    }

    pub fn year(&self) -> u32 {
        self.year
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    /// The book this page belongs to.
    pub fn book(&self) -> Book {
        Book {
            state: self.state.clone(),
            school: self.school.clone(),
            year: self.year,
        }
    }

    /// Path of this record relative to a label, image, or output root:
    /// `state/school/year/page.<extension>`.
    pub fn relative_path(&self, extension: &str) -> PathBuf {
        let year = self.year.to_string();
        let page = format!("{}.{extension}", self.page);
        [self.state.as_str(), self.school.as_str(), year.as_str(), page.as_str()]
            .iter()
            .collect()
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.state, self.school, self.year, self.page)
    }
}

impl FromStr for RecordKey {
    type Err = RecordKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(state), Some(school), Some(year), Some(page), None) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RecordKeyError::Malformed(s.to_owned()));
        };

        let year = year
            .parse::<u32>()
            .map_err(|_| RecordKeyError::NonPositiveNumber(year.to_owned()))?;
        let page = page
            .parse::<u32>()
            .map_err(|_| RecordKeyError::NonPositiveNumber(page.to_owned()))?;

        Self::new(state, school, year, page)
    }
}

impl Serialize for RecordKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// BOOK
// ================================================================================================

/// The `(state, school, year)` grouping which defines a page dependency chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Book {
    pub state: String,
    pub school: String,
    pub year: u32,
}

impl Display for Book {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.state, self.school, self.year)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn canonical_form_round_trips() {
        let key = RecordKey::new("AL", "Howard", 1849, 3).unwrap();
        assert_eq!(key.to_string(), "AL:Howard:1849:3");
        assert_eq!("AL:Howard:1849:3".parse::<RecordKey>().unwrap(), key);
    }

    #[test]
    fn rejects_invalid_components() {
        assert_matches!(RecordKey::new("", "Howard", 1849, 1), Err(RecordKeyError::EmptyComponent));
        assert_matches!(
            RecordKey::new("AL", "How:ard", 1849, 1),
            Err(RecordKeyError::ReservedSeparator(_))
        );
        assert_matches!(
            RecordKey::new("AL", "Howard", 0, 1),
            Err(RecordKeyError::NonPositiveNumber(_))
        );
        assert_matches!(
            RecordKey::new("AL", "Howard", 1849, 0),
            Err(RecordKeyError::NonPositiveNumber(_))
        );
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_matches!("AL:Howard:1849".parse::<RecordKey>(), Err(RecordKeyError::Malformed(_)));
        assert_matches!(
            "AL:Howard:1849:3:9".parse::<RecordKey>(),
            Err(RecordKeyError::Malformed(_))
        );
        assert_matches!(
            "AL:Howard:once:3".parse::<RecordKey>(),
            Err(RecordKeyError::NonPositiveNumber(_))
        );
    }

    #[test]
    fn orders_by_book_then_page() {
        let mut keys = vec![
            RecordKey::new("CA", "Lincoln", 2023, 1).unwrap(),
            RecordKey::new("AL", "Howard", 1849, 12).unwrap(),
            RecordKey::new("AL", "Howard", 1849, 2).unwrap(),
            RecordKey::new("AL", "Central", 1849, 5).unwrap(),
        ];
        keys.sort();

        let rendered: Vec<_> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "AL:Central:1849:5",
                "AL:Howard:1849:2",
                "AL:Howard:1849:12",
                "CA:Lincoln:2023:1",
            ]
        );
    }

    #[test]
    fn relative_path_matches_layout() {
        let key = RecordKey::new("AL", "Howard", 1849, 3).unwrap();
        assert_eq!(key.relative_path("json"), PathBuf::from("AL/Howard/1849/3.json"));
        assert_eq!(key.relative_path("jpg"), PathBuf::from("AL/Howard/1849/3.jpg"));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let key = RecordKey::new("AL", "Howard", 1849, 3).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"AL:Howard:1849:3\"");
        assert_eq!(serde_json::from_str::<RecordKey>(&json).unwrap(), key);
    }
}
