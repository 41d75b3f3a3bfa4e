use serde_json::{json, Value};
use tablecrdt_core::{shared_clock, LogicalClock, LwwMap, Record, TableOp, TableStore, WriterId};
use tablecrdt_core::{FieldType, TableSchema};

fn map() -> LwwMap<Value> {
    LwwMap::new(shared_clock(LogicalClock::default()), WriterId::new("p"))
}

fn live_state(m: &LwwMap<Value>) -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = m
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

// Generate all permutations using Heap's algorithm.
fn heap_permute<T: Clone>(k: usize, items: &mut [T], res: &mut Vec<Vec<T>>) {
    if k == 1 {
        res.push(items.to_vec());
        return;
    }
    heap_permute(k - 1, items, res);
    for i in 0..(k - 1) {
        if k % 2 == 0 {
            items.swap(i, k - 1);
        } else {
            items.swap(0, k - 1);
        }
        heap_permute(k - 1, items, res);
    }
}

fn permute<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    let mut res = Vec::new();
    heap_permute(items.len(), &mut items.to_vec(), &mut res);
    res
}

#[test]
fn map_permutations_converge() {
    let records = vec![
        Record::set("title", json!("first"), 1, WriterId::new("a")),
        Record::set("title", json!("second"), 2, WriterId::new("b")),
        Record::tombstone("title", 3, WriterId::new("a")),
        Record::set("views", json!(10), 2, WriterId::new("a")),
        Record::set("views", json!(20), 2, WriterId::new("b")),
    ];

    let mut baseline: Option<Vec<(String, Value)>> = None;
    for perm in permute(&records) {
        let mut m = map();
        for record in perm {
            m.apply_remote(record);
        }
        let state = live_state(&m);
        if let Some(base) = &baseline {
            assert_eq!(state, *base);
        } else {
            baseline = Some(state);
        }
    }

    // And the winner itself is what the total order dictates: the tombstone
    // at ts 3 kills "title", writer "b" wins "views" at the tied ts 2.
    assert_eq!(
        baseline.unwrap(),
        vec![("views".to_string(), json!(20))]
    );
}

#[test]
fn compaction_never_affects_convergence() {
    let records = vec![
        Record::set("k", json!("v1"), 1, WriterId::new("a")),
        Record::set("k", json!("v2"), 2, WriterId::new("a")),
        Record::tombstone("k", 3, WriterId::new("b")),
        Record::set("k", json!("v3"), 4, WriterId::new("a")),
    ];

    for perm in permute(&records) {
        let mut compacted = map();
        let mut plain = map();
        for record in perm {
            compacted.apply_remote(record.clone());
            compacted.compact();
            plain.apply_remote(record);
        }
        assert_eq!(live_state(&compacted), live_state(&plain));
        assert_eq!(compacted.get("k"), Some(&json!("v3")));
    }
}

fn schema() -> TableSchema {
    TableSchema::new()
        .required("title", FieldType::Text)
        .field("views", FieldType::Integer)
}

fn fresh_table(writer: &str) -> TableStore {
    TableStore::new(
        schema(),
        WriterId::new(writer),
        shared_clock(LogicalClock::default()),
    )
}

fn table_snapshot(t: &TableStore) -> Vec<(String, Vec<(String, Value)>)> {
    let mut rows: Vec<(String, Vec<(String, Value)>)> = t
        .get_all()
        .into_iter()
        .map(|result| {
            let id = result.id().to_string();
            let fields = match &result {
                tablecrdt_core::RowResult::Valid { row, .. } => {
                    row.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                }
                _ => Vec::new(),
            };
            (id, fields)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

#[test]
fn table_op_permutations_converge() {
    let ops: Vec<TableOp<Value>> = vec![
        TableOp::Cell {
            row_id: "r1".into(),
            record: Record::set("id", json!("r1"), 1, WriterId::new("a")),
        },
        TableOp::Cell {
            row_id: "r1".into(),
            record: Record::set("title", json!("one"), 2, WriterId::new("a")),
        },
        TableOp::Cell {
            row_id: "r1".into(),
            record: Record::set("title", json!("two"), 3, WriterId::new("b")),
        },
        TableOp::RemoveRow {
            row_id: "r2".into(),
            timestamp: 4,
            writer: WriterId::new("a"),
        },
        TableOp::Cell {
            row_id: "r2".into(),
            record: Record::set("id", json!("r2"), 2, WriterId::new("b")),
        },
    ];

    let mut baseline: Option<Vec<(String, Vec<(String, Value)>)>> = None;
    for perm in permute(&ops) {
        let mut t = fresh_table("p");
        // Deliver each op in its own batch so arrival order is fully exercised.
        for op in perm {
            t.apply_remote(vec![op]);
        }
        let snapshot = table_snapshot(&t);
        if let Some(base) = &baseline {
            assert_eq!(snapshot, *base);
        } else {
            baseline = Some(snapshot);
        }
    }

    // r2's only cell (ts 2) is dominated by its removal (ts 4) in every order.
    let base = baseline.unwrap();
    assert_eq!(base.len(), 1);
    assert_eq!(base[0].0, "r1");
}

#[test]
fn two_replicas_exchanging_full_logs_converge() {
    let mut a = fresh_table("a");
    let mut b = fresh_table("b");

    a.upsert(
        [("id".to_string(), json!("r1")), ("title".to_string(), json!("from-a"))]
            .into_iter()
            .collect(),
    )
    .unwrap();
    b.upsert(
        [("id".to_string(), json!("r2")), ("title".to_string(), json!("from-b"))]
            .into_iter()
            .collect(),
    )
    .unwrap();
    b.delete("r2");

    let ops_a = a.export_ops();
    let ops_b = b.export_ops();
    a.apply_remote(ops_b);
    b.apply_remote(ops_a);

    assert_eq!(table_snapshot(&a), table_snapshot(&b));
    // Idempotence: replaying either log changes nothing.
    let again = a.export_ops();
    b.apply_remote(again);
    assert_eq!(table_snapshot(&a), table_snapshot(&b));
}
