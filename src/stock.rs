//! In-memory stock state with batched persistence.
//!
//! Mutations only touch the map and a dirty set; durable writes happen in
//! bulk from [`StockStore::flush`], which the node runs on a timer and once
//! more at shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::commodity::CommodityKey;
use crate::logging::{log, log_flush, log_stock_change, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::pricing::StockView;
use crate::replication::clock::ReplicationClock;
use crate::storage::StockBackend;

const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Signed; negative means a backlog of unfilled demand.
    pub stock: f64,
    pub purchases: f64,
    /// Epoch millis of the last zero crossing.
    pub last_update: i64,
    /// Hours spent at or below zero, not counting the current shortage span.
    pub shortage_hours: f64,
    /// Clock tag of the last change, local or absorbed.
    pub version: i64,
}

impl StockRecord {
    pub fn zero(now_ms: i64) -> Self {
        Self { stock: 0.0, purchases: 0.0, last_update: now_ms, shortage_hours: 0.0, version: 0 }
    }

    pub fn in_shortage(&self) -> bool {
        self.stock <= 0.0
    }

    /// Accumulated shortage hours plus the span still running, if any.
    pub fn shortage_hours_at(&self, now_ms: i64) -> f64 {
        if self.in_shortage() {
            self.shortage_hours + (now_ms - self.last_update).max(0) as f64 / MS_PER_HOUR
        } else {
            self.shortage_hours
        }
    }

    pub fn view(&self, now_ms: i64) -> StockView {
        StockView { stock: self.stock, shortage_hours: self.shortage_hours_at(now_ms) }
    }

    /// Set stock, refreshing `last_update` whenever the value crosses zero.
    fn set_stock(&mut self, new_stock: f64, now_ms: i64) {
        let was_short = self.in_shortage();
        let now_short = new_stock <= 0.0;
        if was_short && !now_short {
            self.shortage_hours = self.shortage_hours_at(now_ms);
        }
        if was_short != now_short {
            self.last_update = now_ms;
        }
        self.stock = new_stock;
    }
}

/// Receives every local mutation so it can be broadcast to peers.
pub trait StockPublisher: Send + Sync {
    fn publish(&self, key: &CommodityKey, record: &StockRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorb {
    /// The held record wins: newer tag, or the tie-break on an equal one.
    Stale,
    /// Same values and tag as already held.
    Unchanged,
    Applied,
}

pub struct StockStore {
    records: RwLock<HashMap<CommodityKey, StockRecord>>,
    dirty: Mutex<HashSet<CommodityKey>>,
    backend: Mutex<Box<dyn StockBackend>>,
    clock: Arc<ReplicationClock>,
    publisher: RwLock<Option<Arc<dyn StockPublisher>>>,
}

impl StockStore {
    pub fn new(backend: Box<dyn StockBackend>, clock: Arc<ReplicationClock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            backend: Mutex::new(backend),
            clock,
            publisher: RwLock::new(None),
        }
    }

    pub fn clock(&self) -> &Arc<ReplicationClock> {
        &self.clock
    }

    pub fn attach_publisher(&self, publisher: Arc<dyn StockPublisher>) {
        *write(&self.publisher) = Some(publisher);
    }

    pub fn detach_publisher(&self) {
        *write(&self.publisher) = None;
    }

    /// Current record, or a zero record for commodities never seen.
    pub fn get(&self, key: &CommodityKey) -> StockRecord {
        read(&self.records)
            .get(key)
            .copied()
            .unwrap_or_else(|| StockRecord::zero(ts_epoch_ms()))
    }

    pub fn contains(&self, key: &CommodityKey) -> bool {
        read(&self.records).contains_key(key)
    }

    pub fn keys(&self) -> Vec<CommodityKey> {
        let mut keys: Vec<_> = read(&self.records).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> Vec<(CommodityKey, StockRecord)> {
        let mut all: Vec<_> = read(&self.records).iter().map(|(k, r)| (k.clone(), *r)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn dirty_count(&self) -> usize {
        lock(&self.dirty).len()
    }

    pub fn apply_delta(&self, key: &CommodityKey, delta: f64) -> StockRecord {
        self.apply_delta_at(key, delta, ts_epoch_ms())
    }

    /// Local mutation path: adjust stock by `delta`, stamp a fresh clock tag,
    /// mark dirty and hand the result to the publisher. Negative deltas are
    /// purchases and count toward `purchases`.
    pub fn apply_delta_at(&self, key: &CommodityKey, delta: f64, now_ms: i64) -> StockRecord {
        let (old_stock, record) = {
            let mut records = write(&self.records);
            let entry = records.entry(key.clone()).or_insert_with(|| StockRecord::zero(now_ms));
            let old_stock = entry.stock;
            entry.set_stock(old_stock + delta, now_ms);
            if delta < 0.0 {
                entry.purchases += -delta;
            }
            entry.version = self.clock.tick(now_ms);
            (old_stock, *entry)
        };
        self.mark_dirty(key);
        log_stock_change(key.as_str(), "local", old_stock, record.stock, record.version);

        let publisher = read(&self.publisher).clone();
        if let Some(publisher) = publisher {
            publisher.publish(key, &record);
        }
        record
    }

    pub fn apply_remote(&self, key: &CommodityKey, stock: f64, purchases: f64, tag: i64) -> Absorb {
        self.apply_remote_at(key, stock, purchases, tag, ts_epoch_ms())
    }

    /// Replication path: overwrite with absolute values from a peer. Never
    /// publishes. Updates tagged older than the record's own version are
    /// rejected under the same lock that applies them. On an equal tag the
    /// larger `(stock, purchases)` pair wins, so concurrent writers settle on
    /// the same value whatever order their messages arrive in.
    pub fn apply_remote_at(
        &self,
        key: &CommodityKey,
        stock: f64,
        purchases: f64,
        tag: i64,
        now_ms: i64,
    ) -> Absorb {
        let (old_stock, record, outcome) = {
            let mut records = write(&self.records);
            let entry = records.entry(key.clone()).or_insert_with(|| StockRecord::zero(now_ms));
            if tag < entry.version || (tag == entry.version && loses_tie(entry, stock, purchases)) {
                return Absorb::Stale;
            }
            let before = *entry;
            entry.set_stock(stock, now_ms);
            entry.purchases = purchases;
            entry.version = tag;
            let outcome = if *entry == before { Absorb::Unchanged } else { Absorb::Applied };
            (before.stock, *entry, outcome)
        };
        if outcome == Absorb::Applied {
            self.mark_dirty(key);
            log_stock_change(key.as_str(), "remote", old_stock, record.stock, record.version);
        }
        outcome
    }

    /// Ensure a record exists for `key` without touching its values.
    pub fn touch(&self, key: &CommodityKey) {
        let created = {
            let mut records = write(&self.records);
            if records.contains_key(key) {
                false
            } else {
                records.insert(key.clone(), StockRecord::zero(ts_epoch_ms()));
                true
            }
        };
        if created {
            self.mark_dirty(key);
        }
    }

    /// Write every dirty record (and the clock) in one batch.
    ///
    /// Keys are only cleared if the record still equals what was written, so a
    /// mutation racing the save stays dirty. On failure nothing is cleared and
    /// the next flush retries.
    pub fn flush(&self) -> Result<usize> {
        let started = Instant::now();
        let pending: Vec<CommodityKey> = lock(&self.dirty).iter().cloned().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let batch: Vec<(CommodityKey, StockRecord)> = {
            let records = read(&self.records);
            pending
                .iter()
                .filter_map(|k| records.get(k).map(|r| (k.clone(), *r)))
                .collect()
        };

        let saved = lock(&self.backend).save(&batch, self.clock.now());
        if let Err(err) = saved {
            log(
                Level::Error,
                Domain::Storage,
                "flush_failed",
                obj(&[("error", v_str(&format!("{:#}", err))), ("pending", json!(pending.len()))]),
            );
            return Err(err);
        }

        let remaining = {
            let records = read(&self.records);
            let mut dirty = lock(&self.dirty);
            for (key, written) in &batch {
                if records.get(key) == Some(written) {
                    dirty.remove(key);
                }
            }
            dirty.len()
        };
        log_flush(batch.len(), remaining, started.elapsed().as_secs_f64() * 1000.0);
        Ok(batch.len())
    }

    /// Restore persisted state. Every key in `known` gets at least a zero
    /// record; the clock resumes from the newest persisted tag.
    pub fn load<'a>(&self, known: impl IntoIterator<Item = &'a CommodityKey>) -> Result<usize> {
        let now_ms = ts_epoch_ms();
        let stored = lock(&self.backend).load(now_ms)?;

        let mut newest = stored.clock;
        let mut defaulted = Vec::new();
        let total = {
            let mut records = write(&self.records);
            records.clear();
            for (key, record) in stored.records {
                newest = newest.max(record.version);
                records.insert(key, record);
            }
            for key in known {
                if !records.contains_key(key) {
                    records.insert(key.clone(), StockRecord::zero(now_ms));
                    defaulted.push(key.clone());
                }
            }
            records.len()
        };
        self.clock.observe(newest);
        {
            let mut dirty = lock(&self.dirty);
            // migrated or defaulted records are written back on the next flush
            dirty.extend(defaulted.iter().cloned());
        }

        log(
            Level::Info,
            Domain::Storage,
            "loaded",
            obj(&[
                ("records", json!(total)),
                ("defaulted", json!(defaulted.len())),
                ("migrated", json!(stored.migrated)),
                ("clock", json!(self.clock.now())),
            ]),
        );
        Ok(total)
    }

    fn mark_dirty(&self, key: &CommodityKey) {
        lock(&self.dirty).insert(key.clone());
    }
}

fn loses_tie(held: &StockRecord, stock: f64, purchases: f64) -> bool {
    stock
        .total_cmp(&held.stock)
        .then(purchases.total_cmp(&held.purchases))
        .is_lt()
}

// Lock helpers: a panic while holding a lock must not take the store down with it.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::atomic::Ordering;

    const HOUR: i64 = 3_600_000;

    fn key(name: &str) -> CommodityKey {
        CommodityKey::new(name).unwrap()
    }

    fn store() -> StockStore {
        StockStore::new(Box::new(MemoryBackend::new()), Arc::new(ReplicationClock::default()))
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(CommodityKey, StockRecord)>>,
    }

    impl StockPublisher for Recorder {
        fn publish(&self, key: &CommodityKey, record: &StockRecord) {
            self.seen.lock().unwrap().push((key.clone(), *record));
        }
    }

    #[test]
    fn test_delta_marks_dirty_and_counts_purchases() {
        let s = store();
        s.apply_delta_at(&key("DIRT"), 10.0, 1_000);
        let r = s.apply_delta_at(&key("DIRT"), -4.0, 2_000);
        assert_eq!(r.stock, 6.0);
        assert_eq!(r.purchases, 4.0);
        assert_eq!(r.version, 2_000);
        assert_eq!(s.dirty_count(), 1);
    }

    #[test]
    fn test_zero_crossing_refreshes_last_update() {
        let s = store();
        let k = key("DIAMOND");
        s.apply_delta_at(&k, 5.0, 1_000);
        assert_eq!(s.get(&k).last_update, 1_000);
        // staying positive does not touch the timestamp
        s.apply_delta_at(&k, -2.0, 2_000);
        assert_eq!(s.get(&k).last_update, 1_000);
        // dropping to zero enters shortage
        s.apply_delta_at(&k, -3.0, 3_000);
        assert_eq!(s.get(&k).last_update, 3_000);
        // deeper shortage does not restart the span
        s.apply_delta_at(&k, -1.0, 4_000);
        assert_eq!(s.get(&k).last_update, 3_000);
    }

    #[test]
    fn test_shortage_hours_accumulate_across_spans() {
        let s = store();
        let k = key("WHEAT");
        s.apply_delta_at(&k, -1.0, 0);
        s.apply_delta_at(&k, 2.0, 2 * HOUR);
        let r = s.get(&k);
        assert!((r.shortage_hours - 2.0).abs() < 1e-9);
        assert!((r.shortage_hours_at(10 * HOUR) - 2.0).abs() < 1e-9);

        s.apply_delta_at(&k, -5.0, 3 * HOUR);
        let r = s.get(&k);
        assert!((r.shortage_hours_at(4 * HOUR) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_remote_crossing_follows_same_rule() {
        let s = store();
        let k = key("COAL");
        s.apply_delta_at(&k, 3.0, 1_000);
        assert_eq!(s.apply_remote_at(&k, -2.0, 9.0, 5_000, 6_000), Absorb::Applied);
        let r = s.get(&k);
        assert_eq!(r.last_update, 6_000);
        assert_eq!(r.purchases, 9.0);
        assert_eq!(r.version, 5_000);
    }

    #[test]
    fn test_remote_is_idempotent_and_rejects_stale() {
        let s = store();
        let k = key("COAL");
        assert_eq!(s.apply_remote_at(&k, 4.0, 1.0, 100, 10), Absorb::Applied);
        s.flush().unwrap();
        let before = s.get(&k);
        assert_eq!(s.apply_remote_at(&k, 4.0, 1.0, 100, 20), Absorb::Unchanged);
        assert_eq!(s.get(&k), before);
        assert_eq!(s.dirty_count(), 0);
        assert_eq!(s.apply_remote_at(&k, 1.0, 1.0, 99, 30), Absorb::Stale);
        assert_eq!(s.get(&k).stock, 4.0);
    }

    #[test]
    fn test_equal_tags_settle_on_the_same_value() {
        let a = store();
        let b = store();
        let k = key("GLASS");
        let from_a = a.apply_delta_at(&k, 5.0, 100);
        let from_b = b.apply_delta_at(&k, -2.0, 100);
        assert_eq!(from_a.version, from_b.version);

        assert_eq!(a.apply_remote_at(&k, from_b.stock, from_b.purchases, from_b.version, 110), Absorb::Stale);
        assert_eq!(b.apply_remote_at(&k, from_a.stock, from_a.purchases, from_a.version, 110), Absorb::Applied);
        assert_eq!(a.get(&k).stock, 5.0);
        assert_eq!(b.get(&k).stock, 5.0);
        assert_eq!(a.get(&k).purchases, b.get(&k).purchases);
    }

    #[test]
    fn test_local_changes_publish_remote_changes_do_not() {
        let s = store();
        let recorder = Arc::new(Recorder::default());
        s.attach_publisher(recorder.clone());
        s.apply_delta_at(&key("SAND"), 2.0, 1);
        s.apply_remote_at(&key("GLASS"), 2.0, 0.0, 5, 2);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, key("SAND"));
    }

    #[test]
    fn test_failed_flush_keeps_items_dirty() {
        let backend = MemoryBackend::new();
        let switch = backend.fault_switch();
        let persisted = backend.contents();
        let s = StockStore::new(Box::new(backend), Arc::new(ReplicationClock::default()));

        s.apply_delta_at(&key("IRON"), 1.0, 1);
        s.apply_delta_at(&key("GOLD"), 1.0, 2);
        switch.store(true, Ordering::SeqCst);
        assert!(s.flush().is_err());
        assert_eq!(s.dirty_count(), 2);
        assert!(persisted.lock().unwrap().is_empty());

        switch.store(false, Ordering::SeqCst);
        assert_eq!(s.flush().unwrap(), 2);
        assert_eq!(s.dirty_count(), 0);
        assert_eq!(persisted.lock().unwrap().len(), 2);
        assert_eq!(s.flush().unwrap(), 0);
    }

    #[test]
    fn test_load_defaults_known_keys_and_restores_clock() {
        let backend = MemoryBackend::new();
        let persisted = backend.contents();
        persisted.lock().unwrap().insert(
            key("EMERALD"),
            StockRecord { stock: 7.0, purchases: 1.0, last_update: 5, shortage_hours: 0.0, version: 1_234 },
        );
        let s = StockStore::new(Box::new(backend), Arc::new(ReplicationClock::default()));

        let known = [key("EMERALD"), key("STICK")];
        assert_eq!(s.load(known.iter()).unwrap(), 2);
        assert_eq!(s.get(&key("EMERALD")).stock, 7.0);
        assert_eq!(s.get(&key("STICK")).stock, 0.0);
        assert_eq!(s.clock().now(), 1_234);
        assert_eq!(s.dirty_count(), 1, "only the defaulted key needs writing");
    }
}
