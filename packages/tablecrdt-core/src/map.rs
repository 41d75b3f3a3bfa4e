use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ids::{Timestamp, WriterId};
use crate::ops::{is_newer, Record};
use crate::traits::SharedClock;

/// How a winning record changed the live view of its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// Emitted once per record that changes a winner. Records that lose the
/// `(timestamp, writer)` comparison emit nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent<V> {
    pub key: String,
    pub action: ChangeAction,
    pub old_value: Option<V>,
    pub new_value: Option<V>,
}

/// Disposer handle returned by [`LwwMap::on_change`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription(u64);

type Observer<V> = Box<dyn FnMut(&ChangeEvent<V>) + Send>;

/// Replicated last-write-wins map over one key-value namespace.
///
/// Keeps an append-only log of [`Record`]s plus a derived winner map giving
/// O(1) live lookups. Applying the same deterministic comparison to the same
/// eventual record set converges every replica to an identical live view,
/// regardless of arrival order. The log exists for replication export and is
/// trimmed by [`compact`](LwwMap::compact); correctness never depends on it.
pub struct LwwMap<V> {
    clock: SharedClock,
    writer: WriterId,
    log: Vec<Record<V>>,
    winners: HashMap<String, Record<V>>,
    observers: Vec<(u64, Observer<V>)>,
    next_subscription: u64,
    compacting: bool,
}

impl<V: Clone> LwwMap<V> {
    pub fn new(clock: SharedClock, writer: WriterId) -> Self {
        Self {
            clock,
            writer,
            log: Vec::new(),
            winners: HashMap::new(),
            observers: Vec::new(),
            next_subscription: 0,
            compacting: false,
        }
    }

    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    /// Append a value-bearing record for `key` at the next local timestamp.
    ///
    /// An empty key is a programmer error and fails fast; it never makes it
    /// into the log.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> Result<Option<ChangeEvent<V>>> {
        let key = key.into();
        Self::check_key(&key)?;
        let timestamp = self.tick();
        let record = Record::set(key, value, timestamp, self.writer.clone());
        Ok(self.apply(record))
    }

    /// Append a tombstone for `key` at the next local timestamp.
    pub fn remove(&mut self, key: impl Into<String>) -> Result<Option<ChangeEvent<V>>> {
        let key = key.into();
        Self::check_key(&key)?;
        let timestamp = self.tick();
        let record = Record::tombstone(key, timestamp, self.writer.clone());
        Ok(self.apply(record))
    }

    /// Merge a record received from another replica.
    ///
    /// Remote data is always merged, never rejected: rejecting would break
    /// convergence. Losing and duplicate records are silent no-ops.
    pub fn apply_remote(&mut self, record: Record<V>) -> Option<ChangeEvent<V>> {
        self.apply(record)
    }

    /// Live value for `key`; `None` if absent or tombstoned.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.winners.get(key).and_then(|r| r.value.as_ref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate live entries only; tombstoned keys are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.winners
            .values()
            .filter_map(|r| r.value.as_ref().map(|v| (r.key.as_str(), v)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.winners.values().filter(|r| !r.is_tombstone()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Winning record for `key`, tombstones included. Used by composite layers
    /// that need ordering metadata, not just the live value.
    pub fn winner(&self, key: &str) -> Option<&Record<V>> {
        self.winners.get(key)
    }

    /// Full log in arrival order, for replication export.
    pub fn records(&self) -> &[Record<V>] {
        &self.log
    }

    /// Subscribe to winner changes. Returns a disposer handle for
    /// [`unsubscribe`](LwwMap::unsubscribe).
    pub fn on_change(&mut self, handler: impl FnMut(&ChangeEvent<V>) + Send + 'static) -> Subscription {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, Box::new(handler)));
        Subscription(id)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) {
        self.observers.retain(|(id, _)| *id != subscription.0);
    }

    /// Drop log entries dominated by their key's current winner.
    ///
    /// Cleanup only: the winner map is untouched, so `get`/`has`/`iter` are
    /// identical before and after, and running it any number of times changes
    /// nothing but log size. Guarded against re-entrant invocation from an
    /// observer callback.
    pub fn compact(&mut self) -> usize {
        if self.compacting {
            return 0;
        }
        self.compacting = true;
        let before = self.log.len();
        let winners = &self.winners;
        self.log.retain(|record| {
            winners
                .get(&record.key)
                .map(|w| w.timestamp == record.timestamp && w.writer == record.writer)
                .unwrap_or(false)
        });
        let removed = before - self.log.len();
        self.compacting = false;
        removed
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidRecord("record key must not be empty".into()));
        }
        Ok(())
    }

    fn tick(&self) -> Timestamp {
        self.clock.lock().expect("clock lock poisoned").next()
    }

    /// Winner algorithm, applied per record in arrival order (local or remote).
    fn apply(&mut self, record: Record<V>) -> Option<ChangeEvent<V>> {
        self.clock
            .lock()
            .expect("clock lock poisoned")
            .observe(record.timestamp);

        if let Some(current) = self.winners.get(&record.key) {
            if !is_newer(
                record.timestamp,
                &record.writer,
                current.timestamp,
                &current.writer,
            ) {
                // Loses (or duplicates) the current winner: no state change, no event.
                return None;
            }
        }

        let old_value = self
            .winners
            .get(&record.key)
            .and_then(|r| r.value.clone());
        let new_value = record.value.clone();

        let action = match (&old_value, &new_value) {
            (None, Some(_)) => Some(ChangeAction::Add),
            (Some(_), Some(_)) => Some(ChangeAction::Update),
            (Some(_), None) => Some(ChangeAction::Delete),
            // Tombstone over absent/tombstoned: the winner still advances so
            // older writes keep losing, but nothing observable changed.
            (None, None) => None,
        };

        self.winners.insert(record.key.clone(), record.clone());
        self.log.push(record.clone());

        let event = action.map(|action| ChangeEvent {
            key: record.key,
            action,
            old_value,
            new_value,
        });
        if let Some(event) = &event {
            for (_, observer) in &mut self.observers {
                observer(event);
            }
        }
        event
    }
}
