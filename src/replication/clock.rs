use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide "most recent known transaction time" in epoch millis.
///
/// The value only ever moves forward: every update goes through
/// `fetch_max`, whatever order local transactions and peer messages arrive in.
#[derive(Debug, Default)]
pub struct ReplicationClock {
    last_known: AtomicI64,
}

impl ReplicationClock {
    pub fn new(initial: i64) -> Self {
        Self { last_known: AtomicI64::new(initial) }
    }

    pub fn now(&self) -> i64 {
        self.last_known.load(Ordering::SeqCst)
    }

    /// Fold in a time observed elsewhere (peer tag, persisted value).
    /// Returns the clock value after the update.
    pub fn observe(&self, ts: i64) -> i64 {
        self.last_known.fetch_max(ts, Ordering::SeqCst).max(ts)
    }

    /// Stamp a local transaction happening at `now_ms`. The returned tag is
    /// never older than anything this process has already seen.
    pub fn tick(&self, now_ms: i64) -> i64 {
        self.observe(now_ms)
    }
}
