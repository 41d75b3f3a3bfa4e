use serde::{Deserialize, Serialize};

/// Logical timestamp used for ordering records (milliseconds since the Unix epoch
/// for wall clocks, a bare counter for test clocks).
pub type Timestamp = u64;

/// Row identifiers are plain strings supplied by the application.
pub type RowId = String;

/// Unique identifier for a writer (one editor/replica). Ordered lexicographically;
/// the order is the deterministic tie-break for records with equal timestamps.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WriterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
