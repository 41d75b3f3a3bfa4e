use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::schema::RowData;
use crate::table::{TableStore, TableSubscription};

/// Derived-store adapter the engine rebuilds into. `clear_all` and
/// `insert_many` are always invoked inside one engine-managed atomic batch
/// (`begin` .. `commit`, `rollback` on failure), so the external store is
/// either consistent with a recent snapshot or in the process of becoming
/// one, never partially updated mid-write.
pub trait DerivedStore: Send + 'static {
    fn begin(&mut self) -> Result<()>;
    fn clear_all(&mut self) -> Result<()>;
    fn insert_many(&mut self, table: &str, rows: &[RowData]) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

/// Table handle shared between callers and the rebuild task.
pub type SharedTable = Arc<Mutex<TableStore>>;

pub fn shared_table(table: TableStore) -> SharedTable {
    Arc::new(Mutex::new(table))
}

#[derive(Clone, Copy, Debug)]
pub struct MaterializerOptions {
    pub debounce: Duration,
}

impl MaterializerOptions {
    pub fn debounce_ms(ms: u64) -> Self {
        Self {
            debounce: Duration::from_millis(ms),
        }
    }
}

impl Default for MaterializerOptions {
    fn default() -> Self {
        Self::debounce_ms(100)
    }
}

/// Debounced full-rebuild sync of tables into a [`DerivedStore`].
///
/// Any table change (re)arms a debounce window; once the tables go quiet the
/// driver task clears the mirrored store and re-inserts every currently-valid
/// row fresh from `get_all_valid()`. Full rebuild trades write amplification
/// for immunity to the lost-update and update-before-insert races an
/// incremental mirror suffers under interleaved async writes. Viable to tens
/// of thousands of rows; shard the workspace beyond that rather than
/// reintroducing incremental diffing.
///
/// Must be spawned inside a tokio runtime. A failed rebuild is rolled back
/// and logged; the engine self-heals on the next observed change.
pub struct Materializer {
    driver: JoinHandle<()>,
    subscriptions: Vec<(SharedTable, TableSubscription)>,
}

impl Materializer {
    pub fn spawn<S: DerivedStore>(
        tables: Vec<(String, SharedTable)>,
        store: S,
        options: MaterializerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        let mut subscriptions = Vec::with_capacity(tables.len());
        for (_, table) in &tables {
            let tx = tx.clone();
            let subscription = table
                .lock()
                .expect("table lock poisoned")
                .observe(move |_| {
                    // Receiver gone means the engine was destroyed; nothing to do.
                    let _ = tx.send(());
                });
            subscriptions.push((table.clone(), subscription));
        }

        let driver = tokio::spawn(drive(tables, store, rx, options.debounce));
        Self {
            driver,
            subscriptions,
        }
    }

    /// Cancel the driver task and detach from every table. No rebuild fires
    /// after this returns. Dropping the engine does the same.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.driver.abort();
        for (table, subscription) in self.subscriptions.drain(..) {
            if let Ok(mut table) = table.lock() {
                table.unobserve(subscription);
            }
        }
    }
}

impl Drop for Materializer {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn drive<S: DerivedStore>(
    tables: Vec<(String, SharedTable)>,
    mut store: S,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        // Each further change within the window re-arms it; rebuild only once
        // the tables have been quiet for the full debounce interval.
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_elapsed) => break,
            }
        }
        rebuild(&tables, &mut store);
    }
}

fn rebuild<S: DerivedStore>(tables: &[(String, SharedTable)], store: &mut S) {
    let snapshot: Vec<(String, Vec<RowData>)> = tables
        .iter()
        .map(|(name, table)| {
            let table = table.lock().expect("table lock poisoned");
            (name.clone(), table.get_all_valid())
        })
        .collect();

    match write_snapshot(store, &snapshot) {
        Ok(()) => {
            tracing::debug!(tables = snapshot.len(), "materialization rebuild committed");
            // Log cleanup rides the same debounce cycle; never affects
            // correctness.
            for (_, table) in tables {
                table.lock().expect("table lock poisoned").compact();
            }
        }
        Err(error) => {
            if let Err(rollback_error) = store.rollback() {
                tracing::error!(%rollback_error, "materialization rollback failed");
            }
            // The in-memory table remains the source of truth; the next
            // observed change triggers a fresh cycle.
            tracing::warn!(%error, "materialization rebuild failed, cycle abandoned");
        }
    }
}

fn write_snapshot<S: DerivedStore>(
    store: &mut S,
    snapshot: &[(String, Vec<RowData>)],
) -> Result<()> {
    store.begin()?;
    store.clear_all()?;
    for (name, rows) in snapshot {
        store.insert_many(name, rows)?;
    }
    store.commit()
}

#[derive(Debug, Default)]
struct MemoryIndexState {
    committed: BTreeMap<String, Vec<RowData>>,
    staged: Option<BTreeMap<String, Vec<RowData>>>,
    fail_next_batch: bool,
}

/// In-memory [`DerivedStore`] for tests and prototyping. Handles are cheap
/// clones over shared state, so a test can keep one while the engine owns
/// another.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    state: Arc<Mutex<MemoryIndexState>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed contents, for assertions.
    pub fn tables(&self) -> BTreeMap<String, Vec<RowData>> {
        self.state.lock().expect("index lock poisoned").committed.clone()
    }

    pub fn rows(&self, table: &str) -> Vec<RowData> {
        self.tables().remove(table).unwrap_or_default()
    }

    /// Make the next batch fail at `clear_all`, to exercise the abandoned
    /// cycle path.
    pub fn fail_next_batch(&self) {
        self.state.lock().expect("index lock poisoned").fail_next_batch = true;
    }
}

impl DerivedStore for MemoryIndex {
    fn begin(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");
        if state.staged.is_some() {
            return Err(Error::Store("batch already open".into()));
        }
        state.staged = Some(state.committed.clone());
        Ok(())
    }

    fn clear_all(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");
        if state.fail_next_batch {
            state.fail_next_batch = false;
            return Err(Error::Store("injected failure".into()));
        }
        state
            .staged
            .as_mut()
            .ok_or_else(|| Error::Store("no open batch".into()))?
            .clear();
        Ok(())
    }

    fn insert_many(&mut self, table: &str, rows: &[RowData]) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");
        state
            .staged
            .as_mut()
            .ok_or_else(|| Error::Store("no open batch".into()))?
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");
        let staged = state
            .staged
            .take()
            .ok_or_else(|| Error::Store("no open batch".into()))?;
        state.committed = staged;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("index lock poisoned");
        state.staged = None;
        Ok(())
    }
}
