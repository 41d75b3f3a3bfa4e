#![forbid(unsafe_code)]
//! SQLite adapter for the tablecrdt materialization engine: mirrors each
//! logical table into a real SQL table with typed columns, so the derived
//! state is queryable with plain SQL while the CRDT store stays the source of
//! truth.

mod store;

pub use store::SqliteIndex;
