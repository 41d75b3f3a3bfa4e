use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::{RowId, Timestamp, WriterId};
use crate::map::LwwMap;
use crate::ops::{is_newer, Record, TableOp};
use crate::schema::{RowData, Schema, ValidationError};
use crate::traits::SharedClock;

/// Net effect of one transaction on one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowChange {
    Add,
    Update,
    Delete,
}

/// Where a transaction originated. Observers use this for echo suppression
/// (e.g. the replication layer skipping batches it produced itself).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnOrigin {
    Local,
    Remote,
}

/// One coalesced observer callback per logical transaction: row ids and change
/// kinds only. Content is deliberately excluded: consumers that need values
/// call [`TableStore::get`] themselves, so reconstruction and validation are
/// never paid for on behalf of callers that don't want them.
#[derive(Clone, Debug)]
pub struct TableChanges {
    pub rows: BTreeMap<RowId, RowChange>,
    pub origin: TxnOrigin,
}

/// Typed outcome of a row read. `Invalid` and `NotFound` are normal, expected
/// results that callers branch on routinely, never errors.
#[derive(Clone, Debug, PartialEq)]
pub enum RowResult {
    Valid { id: RowId, row: RowData },
    Invalid { id: RowId, error: ValidationError },
    NotFound { id: RowId },
}

impl RowResult {
    pub fn id(&self) -> &str {
        match self {
            RowResult::Valid { id, .. }
            | RowResult::Invalid { id, .. }
            | RowResult::NotFound { id } => id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Disposer handle returned by [`TableStore::observe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSubscription(u64);

type TableObserver = Box<dyn FnMut(&TableChanges) + Send>;

/// Cell-level row store: one [`LwwMap`] per row under a `row id -> row`
/// container, with validated CRUD and transaction-batched change observation.
///
/// Concurrent editors of different fields on the same row both survive merge
/// because [`update`](TableStore::update) only appends records for the fields
/// it explicitly names.
pub struct TableStore {
    clock: SharedClock,
    writer: WriterId,
    schema: Box<dyn Schema>,
    rows: BTreeMap<RowId, LwwMap<Value>>,
    /// Container-level LWW tombstones: latest coarse delete per row id. Kept
    /// after re-creation so cell records older than the removal stay dead.
    removed: HashMap<RowId, (Timestamp, WriterId)>,
    observers: Vec<(u64, TableObserver)>,
    next_subscription: u64,
}

impl TableStore {
    pub fn new(schema: impl Schema + 'static, writer: WriterId, clock: SharedClock) -> Self {
        Self {
            clock,
            writer,
            schema: Box::new(schema),
            rows: BTreeMap::new(),
            removed: HashMap::new(),
            observers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    /// Write every field of `row` (including `id`) as one logical transaction.
    /// Creates the row if absent. Observers see one coalesced change.
    pub fn upsert(&mut self, row: RowData) -> Result<()> {
        self.write_fields(row)
    }

    /// Like [`upsert`](TableStore::upsert), but callers supply only the fields
    /// they mean to change; unmentioned fields are untouched.
    pub fn update(&mut self, partial_row: RowData) -> Result<()> {
        self.write_fields(partial_row)
    }

    /// Clear one field with a cell-level tombstone. The row stays present;
    /// the schema decides at read time whether it is still valid.
    pub fn clear_field(&mut self, id: &str, field: &str) -> Result<DeleteOutcome> {
        let Some(map) = self.rows.get_mut(id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if map.remove(field)?.is_some() {
            self.notify(
                [(id.to_string(), RowChange::Update)].into_iter().collect(),
                TxnOrigin::Local,
            );
        }
        Ok(DeleteOutcome::Deleted)
    }

    /// Reconstruct a row from live winners and validate it against the schema.
    pub fn get(&self, id: &str) -> RowResult {
        let Some(map) = self.rows.get(id) else {
            return RowResult::NotFound { id: id.to_string() };
        };
        self.materialize_row(id, map)
    }

    /// Every present row, valid or invalid (tagged). Never contains `NotFound`.
    pub fn get_all(&self) -> Vec<RowResult> {
        self.rows
            .iter()
            .map(|(id, map)| self.materialize_row(id, map))
            .collect()
    }

    pub fn get_all_valid(&self) -> Vec<RowData> {
        self.get_all()
            .into_iter()
            .filter_map(|result| match result {
                RowResult::Valid { row, .. } => Some(row),
                _ => None,
            })
            .collect()
    }

    pub fn get_all_invalid(&self) -> Vec<(RowId, ValidationError)> {
        self.get_all()
            .into_iter()
            .filter_map(|result| match result {
                RowResult::Invalid { id, error } => Some((id, error)),
                _ => None,
            })
            .collect()
    }

    /// Coarse delete: removes the container entry outright. Clearing a single
    /// field is a different mechanism ([`clear_field`](TableStore::clear_field),
    /// a cell-level tombstone).
    pub fn delete(&mut self, id: &str) -> DeleteOutcome {
        if self.rows.remove(id).is_none() {
            return DeleteOutcome::NotFound;
        }
        let timestamp = self.clock.lock().expect("clock lock poisoned").next();
        self.note_removal(id, timestamp, self.writer.clone());
        self.notify(
            [(id.to_string(), RowChange::Delete)].into_iter().collect(),
            TxnOrigin::Local,
        );
        DeleteOutcome::Deleted
    }

    /// Subscribe to transaction-batched changes. Returns a disposer handle.
    pub fn observe(
        &mut self,
        callback: impl FnMut(&TableChanges) + Send + 'static,
    ) -> TableSubscription {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, Box::new(callback)));
        TableSubscription(id)
    }

    pub fn unobserve(&mut self, subscription: TableSubscription) {
        self.observers.retain(|(id, _)| *id != subscription.0);
    }

    /// Full replication export: every row's record log plus coarse-delete
    /// tombstones. Feeding this to another replica's
    /// [`apply_remote`](TableStore::apply_remote) converges both, in any order.
    pub fn export_ops(&self) -> Vec<TableOp<Value>> {
        let mut ops: Vec<TableOp<Value>> = Vec::new();
        for (row_id, (timestamp, writer)) in &self.removed {
            ops.push(TableOp::RemoveRow {
                row_id: row_id.clone(),
                timestamp: *timestamp,
                writer: writer.clone(),
            });
        }
        for (row_id, map) in &self.rows {
            for record in map.records() {
                ops.push(TableOp::Cell {
                    row_id: row_id.clone(),
                    record: record.clone(),
                });
            }
        }
        ops
    }

    /// Merge a batch of remote ops as one logical transaction. Remote data is
    /// always merged, never rejected; losing records are silent no-ops.
    pub fn apply_remote(&mut self, ops: Vec<TableOp<Value>>) {
        let mut changes: BTreeMap<RowId, RowChange> = BTreeMap::new();
        for op in ops {
            match op {
                TableOp::Cell { row_id, record } => {
                    self.apply_remote_cell(row_id, record, &mut changes);
                }
                TableOp::RemoveRow {
                    row_id,
                    timestamp,
                    writer,
                } => {
                    self.apply_remote_removal(row_id, timestamp, writer, &mut changes);
                }
            }
        }
        self.notify(changes, TxnOrigin::Remote);
    }

    /// Trim every row's record log. Cleanup only; live state is unaffected.
    pub fn compact(&mut self) -> usize {
        self.rows.values_mut().map(LwwMap::compact).sum()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn write_fields(&mut self, row: RowData) -> Result<()> {
        let id = match row.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(Error::InvalidRecord("row `id` must be a non-empty string".into()))
            }
            None => return Err(Error::InvalidRecord("row is missing its `id` field".into())),
        };

        let existed = self.rows.contains_key(&id);
        let clock = self.clock.clone();
        let writer = self.writer.clone();
        let map = self
            .rows
            .entry(id.clone())
            .or_insert_with(|| LwwMap::new(clock, writer));

        let mut changed = false;
        for (field, value) in row {
            changed |= map.set(field, value)?.is_some();
        }

        if changed {
            let kind = if existed { RowChange::Update } else { RowChange::Add };
            self.notify(
                [(id, kind)].into_iter().collect(),
                TxnOrigin::Local,
            );
        }
        Ok(())
    }

    fn materialize_row(&self, id: &str, map: &LwwMap<Value>) -> RowResult {
        let row: RowData = map
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();
        let row = self.schema.with_defaults(row);
        match self.schema.validate(&row) {
            Ok(()) => RowResult::Valid {
                id: id.to_string(),
                row,
            },
            Err(error) => RowResult::Invalid {
                id: id.to_string(),
                error,
            },
        }
    }

    fn apply_remote_cell(
        &mut self,
        row_id: RowId,
        record: Record<Value>,
        changes: &mut BTreeMap<RowId, RowChange>,
    ) {
        if let Some((removal_ts, removal_writer)) = self.removed.get(&row_id) {
            if !is_newer(record.timestamp, &record.writer, *removal_ts, removal_writer) {
                // Dominated by a coarse delete; the timestamp still advances
                // our clock so local writes keep sorting after it.
                self.clock
                    .lock()
                    .expect("clock lock poisoned")
                    .observe(record.timestamp);
                return;
            }
        }

        let existed = self.rows.contains_key(&row_id);
        let clock = self.clock.clone();
        let writer = self.writer.clone();
        let map = self
            .rows
            .entry(row_id.clone())
            .or_insert_with(|| LwwMap::new(clock, writer));
        let event = map.apply_remote(record);
        if event.is_some() {
            let kind = if existed { RowChange::Update } else { RowChange::Add };
            merge_change(changes, row_id, kind);
        } else if !existed {
            // A lone tombstone still creates the container (it must be kept
            // for convergence against cells that have not arrived yet), and
            // the row becoming present is observable even with no live cell.
            merge_change(changes, row_id, RowChange::Add);
        }
    }

    fn apply_remote_removal(
        &mut self,
        row_id: RowId,
        timestamp: Timestamp,
        writer: WriterId,
        changes: &mut BTreeMap<RowId, RowChange>,
    ) {
        self.clock
            .lock()
            .expect("clock lock poisoned")
            .observe(timestamp);
        if !self.note_removal(&row_id, timestamp, writer.clone()) {
            return;
        }

        let Some(map) = self.rows.remove(&row_id) else {
            return;
        };

        // Records newer than the removal re-create the row fresh; everything
        // older dies with the container entry.
        let survivors: Vec<Record<Value>> = map
            .records()
            .iter()
            .filter(|r| is_newer(r.timestamp, &r.writer, timestamp, &writer))
            .cloned()
            .collect();

        if survivors.is_empty() {
            merge_change(changes, row_id, RowChange::Delete);
            return;
        }

        let mut fresh = LwwMap::new(self.clock.clone(), self.writer.clone());
        for record in survivors {
            fresh.apply_remote(record);
        }
        self.rows.insert(row_id.clone(), fresh);
        merge_change(changes, row_id, RowChange::Update);
    }

    /// Record a coarse delete if it is newer than any already known for the
    /// row. Returns whether it took effect.
    fn note_removal(&mut self, row_id: &str, timestamp: Timestamp, writer: WriterId) -> bool {
        match self.removed.get(row_id) {
            Some((known_ts, known_writer))
                if !is_newer(timestamp, &writer, *known_ts, known_writer) =>
            {
                false
            }
            _ => {
                self.removed.insert(row_id.to_string(), (timestamp, writer));
                true
            }
        }
    }

    fn notify(&mut self, rows: BTreeMap<RowId, RowChange>, origin: TxnOrigin) {
        if rows.is_empty() {
            return;
        }
        let batch = TableChanges { rows, origin };
        for (_, observer) in &mut self.observers {
            observer(&batch);
        }
    }
}

/// Coalesce per-record effects into one net change per row for the
/// transaction. `Add` then `Delete` cancels out entirely.
fn merge_change(changes: &mut BTreeMap<RowId, RowChange>, row_id: RowId, next: RowChange) {
    let net = match (changes.get(&row_id), next) {
        (None, next) => Some(next),
        (Some(RowChange::Add), RowChange::Update) => Some(RowChange::Add),
        (Some(RowChange::Add), RowChange::Delete) => None,
        (Some(RowChange::Update), RowChange::Delete) => Some(RowChange::Delete),
        (Some(RowChange::Delete), RowChange::Add | RowChange::Update) => Some(RowChange::Update),
        (Some(current), _) => Some(*current),
    };
    match net {
        Some(net) => {
            changes.insert(row_id, net);
        }
        None => {
            changes.remove(&row_id);
        }
    }
}
