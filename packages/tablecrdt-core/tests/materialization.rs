use std::time::Duration;

use serde_json::{json, Value};
use tablecrdt_core::{
    shared_clock, shared_table, FieldType, LogicalClock, Materializer, MaterializerOptions,
    MemoryIndex, RowData, SharedTable, TableSchema, TableStore, WriterId,
};

fn schema() -> TableSchema {
    TableSchema::new()
        .required("title", FieldType::Text)
        .field("views", FieldType::Integer)
}

fn notes_table() -> SharedTable {
    shared_table(TableStore::new(
        schema(),
        WriterId::new("local"),
        shared_clock(LogicalClock::default()),
    ))
}

fn row(pairs: &[(&str, Value)]) -> RowData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn settle() {
    // Debounce window is 100ms; with the paused clock this just lets the
    // driver task run to completion.
    tokio::time::sleep(Duration::from_millis(250)).await;
}

#[tokio::test(start_paused = true)]
async fn rebuild_matches_get_all_valid_after_arbitrary_edits() {
    let table = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![("notes".to_string(), table.clone())],
        index.clone(),
        MaterializerOptions::default(),
    );

    {
        let mut t = table.lock().unwrap();
        t.upsert(row(&[("id", json!("r1")), ("title", json!("one"))]))
            .unwrap();
        t.upsert(row(&[("id", json!("r2")), ("title", json!("two"))]))
            .unwrap();
        t.update(row(&[("id", json!("r1")), ("views", json!(5))]))
            .unwrap();
        t.upsert(row(&[("id", json!("r3")), ("views", json!(1))]))
            .unwrap(); // invalid: missing title
        t.delete("r2");
    }
    settle().await;

    let expected = table.lock().unwrap().get_all_valid();
    assert_eq!(expected.len(), 1);
    assert_eq!(index.rows("notes"), expected);
    // The invalid row is visible in diagnostics but never mirrored.
    assert_eq!(table.lock().unwrap().get_all_invalid().len(), 1);

    engine.destroy();
}

#[tokio::test(start_paused = true)]
async fn changes_within_the_window_coalesce_into_one_rebuild() {
    let table = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![("notes".to_string(), table.clone())],
        index.clone(),
        MaterializerOptions::debounce_ms(100),
    );

    for i in 0..20 {
        table
            .lock()
            .unwrap()
            .upsert(row(&[("id", json!("r1")), ("title", json!(format!("v{i}")))]))
            .unwrap();
        // Stay inside the window: no rebuild should fire yet.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(index.tables().is_empty());

    settle().await;
    let rows = index.rows("notes");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&json!("v19")));

    engine.destroy();
}

#[tokio::test(start_paused = true)]
async fn destroy_cancels_a_pending_rebuild() {
    let table = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![("notes".to_string(), table.clone())],
        index.clone(),
        MaterializerOptions::default(),
    );

    table
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("r1")), ("title", json!("t"))]))
        .unwrap();
    engine.destroy();

    settle().await;
    assert!(index.tables().is_empty());

    // And changes after teardown stay unobserved.
    table
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("r2")), ("title", json!("u"))]))
        .unwrap();
    settle().await;
    assert!(index.tables().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_rebuild_self_heals_on_the_next_change() {
    let table = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![("notes".to_string(), table.clone())],
        index.clone(),
        MaterializerOptions::default(),
    );

    index.fail_next_batch();
    table
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("r1")), ("title", json!("t"))]))
        .unwrap();
    settle().await;
    // Cycle abandoned; nothing committed.
    assert!(index.tables().is_empty());

    // The next observed change rebuilds everything, including the row the
    // failed cycle missed.
    table
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("r2")), ("title", json!("u"))]))
        .unwrap();
    settle().await;
    assert_eq!(index.rows("notes").len(), 2);

    engine.destroy();
}

#[tokio::test(start_paused = true)]
async fn multiple_tables_rebuild_atomically() {
    let notes = notes_table();
    let tasks = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![
            ("notes".to_string(), notes.clone()),
            ("tasks".to_string(), tasks.clone()),
        ],
        index.clone(),
        MaterializerOptions::default(),
    );

    notes
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("n1")), ("title", json!("note"))]))
        .unwrap();
    tasks
        .lock()
        .unwrap()
        .upsert(row(&[("id", json!("t1")), ("title", json!("task"))]))
        .unwrap();
    settle().await;

    assert_eq!(index.rows("notes").len(), 1);
    assert_eq!(index.rows("tasks").len(), 1);

    notes.lock().unwrap().delete("n1");
    settle().await;
    assert!(index.rows("notes").is_empty());
    assert_eq!(index.rows("tasks").len(), 1);

    engine.destroy();
}

#[tokio::test(start_paused = true)]
async fn rebuild_cycle_compacts_row_logs() {
    let table = notes_table();
    let index = MemoryIndex::new();
    let engine = Materializer::spawn(
        vec![("notes".to_string(), table.clone())],
        index.clone(),
        MaterializerOptions::default(),
    );

    for i in 0..10 {
        table
            .lock()
            .unwrap()
            .upsert(row(&[("id", json!("r1")), ("title", json!(format!("v{i}")))]))
            .unwrap();
    }
    settle().await;

    // After the rebuild the dominated records are gone: only the winning
    // record per cell remains, and reads are unchanged.
    assert_eq!(table.lock().unwrap().compact(), 0);
    assert_eq!(index.rows("notes").len(), 1);

    engine.destroy();
}
