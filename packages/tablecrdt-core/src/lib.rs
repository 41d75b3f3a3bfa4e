#![forbid(unsafe_code)]
//! Core data engine for a local-first collaborative table store: a replicated
//! last-write-wins map, a cell-level row store built from it, a validated
//! table access layer with batched change observation, and a debounced
//! full-rebuild engine that keeps a derived queryable index in sync.
//! Replication transport and log persistence are left to the embedding host;
//! this crate only exchanges [`TableOp`] batches.

pub mod error;
pub mod ids;
pub mod map;
pub mod materialize;
pub mod ops;
pub mod schema;
pub mod table;
pub mod traits;

pub use error::{Error, Result};
pub use ids::{RowId, Timestamp, WriterId};
pub use map::{ChangeAction, ChangeEvent, LwwMap, Subscription};
pub use materialize::{
    shared_table, DerivedStore, Materializer, MaterializerOptions, MemoryIndex, SharedTable,
};
pub use ops::{cmp_record_key, is_newer, Record, TableOp};
pub use schema::{FieldSpec, FieldType, RowData, Schema, TableSchema, ValidationError};
pub use table::{
    DeleteOutcome, RowChange, RowResult, TableChanges, TableStore, TableSubscription, TxnOrigin,
};
pub use traits::{shared_clock, Clock, LogicalClock, SharedClock, WallClock};
