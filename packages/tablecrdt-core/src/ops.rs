use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::ids::{RowId, Timestamp, WriterId};

/// One immutable entry in the replicated log. `value: None` is a tombstone
/// (logical delete); the record itself is superseded, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<V> {
    pub key: String,
    pub value: Option<V>,
    pub timestamp: Timestamp,
    pub writer: WriterId,
}

impl<V> Record<V> {
    pub fn set(key: impl Into<String>, value: V, timestamp: Timestamp, writer: WriterId) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            timestamp,
            writer,
        }
    }

    pub fn tombstone(key: impl Into<String>, timestamp: Timestamp, writer: WriterId) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp,
            writer,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Canonical ordering for record keys: timestamp first, writer id as the
/// deterministic tie-break. Every replica applies this same comparison, which
/// is what makes the winner map converge regardless of delivery order.
pub fn cmp_record_key(
    a_timestamp: Timestamp,
    a_writer: &WriterId,
    b_timestamp: Timestamp,
    b_writer: &WriterId,
) -> Ordering {
    (a_timestamp, a_writer).cmp(&(b_timestamp, b_writer))
}

/// Whether record `a` beats record `b` under last-write-wins.
pub fn is_newer(
    a_timestamp: Timestamp,
    a_writer: &WriterId,
    b_timestamp: Timestamp,
    b_writer: &WriterId,
) -> bool {
    cmp_record_key(a_timestamp, a_writer, b_timestamp, b_writer) == Ordering::Greater
}

/// Replication envelope for table-level changes. Cell writes and coarse row
/// removals travel in the same stream so one `apply_remote` batch covers both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableOp<V> {
    Cell {
        row_id: RowId,
        record: Record<V>,
    },
    RemoveRow {
        row_id: RowId,
        timestamp: Timestamp,
        writer: WriterId,
    },
}
