use std::sync::{Arc, Mutex};

use crate::ids::Timestamp;

/// Pluggable clock so tests can inject deterministic time sources.
///
/// `next` must return a value strictly greater than anything previously issued
/// or observed on this replica.
pub trait Clock {
    fn next(&mut self) -> Timestamp;
    fn observe(&mut self, remote: Timestamp);
    fn now(&self) -> Timestamp;
}

/// Clock handle shared by every per-row map of a table. Passed explicitly into
/// constructors rather than living in a module-level singleton.
pub type SharedClock = Arc<Mutex<dyn Clock + Send>>;

pub fn shared_clock(clock: impl Clock + Send + 'static) -> SharedClock {
    Arc::new(Mutex::new(clock))
}

/// Wall-clock-anchored monotonic clock: `next` returns
/// `max(now_ms, last + 1)`, so it tracks real time but never repeats or
/// regresses, even under clock skew or sub-millisecond call bursts.
#[derive(Clone, Debug, Default)]
pub struct WallClock {
    last: Timestamp,
}

impl Clock for WallClock {
    fn next(&mut self) -> Timestamp {
        let now = chrono::Utc::now().timestamp_millis().max(0) as Timestamp;
        // saturating: a corrupt remote timestamp near u64::MAX must not panic.
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }

    fn observe(&mut self, remote: Timestamp) {
        self.last = self.last.max(remote);
    }

    fn now(&self) -> Timestamp {
        self.last
    }
}

/// Pure counter clock for tests and default flows.
#[derive(Clone, Debug, Default)]
pub struct LogicalClock {
    counter: Timestamp,
}

impl Clock for LogicalClock {
    fn next(&mut self) -> Timestamp {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }

    fn observe(&mut self, remote: Timestamp) {
        self.counter = self.counter.max(remote);
    }

    fn now(&self) -> Timestamp {
        self.counter
    }
}
