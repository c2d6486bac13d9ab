//! Message handling, independent of any socket.
//!
//! Everything here runs on the node's primary loop: it is the only place
//! inbound replication traffic touches the store.

use crate::commodity::CommodityKey;
use crate::logging::{log, log_dropped_frame, obj, v_str, Domain, Level};
use crate::replication::wire::{StockUpdate, WireMessage};
use crate::stock::{Absorb, StockRecord, StockStore};
use serde_json::json;

/// What handling one message produced.
#[derive(Debug, Default, PartialEq)]
pub struct Handled {
    /// Frames to broadcast in response, in order.
    pub replies: Vec<WireMessage>,
    /// Commodities whose state changed and need a redraw.
    pub changed: Vec<CommodityKey>,
}

pub fn stock_message(key: &CommodityKey, record: &StockRecord, tag: i64) -> WireMessage {
    WireMessage::Stock(StockUpdate {
        material: key.as_str().to_string(),
        stock: record.stock,
        purchases: record.purchases,
        last_tx: tag,
    })
}

pub fn on_message(store: &StockStore, msg: WireMessage) -> Handled {
    let mut handled = Handled::default();
    match msg {
        WireMessage::Stock(update) => {
            let Ok(key) = CommodityKey::new(&update.material) else {
                log_dropped_frame("invalid commodity", &update.material);
                return handled;
            };
            // only commodities this node was configured with are tracked
            if !store.contains(&key) {
                log_dropped_frame("unknown commodity", &update.material);
                return handled;
            }
            match store.apply_remote(&key, update.stock, update.purchases, update.last_tx) {
                Absorb::Stale => log(
                    Level::Trace,
                    Domain::Replication,
                    "stale_update",
                    obj(&[("commodity", v_str(key.as_str())), ("tag", json!(update.last_tx))]),
                ),
                Absorb::Unchanged => {
                    store.clock().observe(update.last_tx);
                }
                Absorb::Applied => {
                    store.clock().observe(update.last_tx);
                    handled.changed.push(key);
                }
            }
        }
        WireMessage::SyncRequest(theirs) => {
            // a failed flush is already logged; the dump is served from memory
            let _ = store.flush();
            let ours = store.clock().now();
            if ours > theirs {
                handled.replies.push(WireMessage::SyncResponse(ours));
                handled
                    .replies
                    .extend(store.snapshot().iter().map(|(key, record)| stock_message(key, record, ours)));
                log(
                    Level::Info,
                    Domain::Replication,
                    "sync_served",
                    obj(&[("theirs", json!(theirs)), ("ours", json!(ours)), ("records", json!(handled.replies.len() - 1))]),
                );
            }
        }
        WireMessage::SyncResponse(theirs) => {
            let now = store.clock().observe(theirs);
            log(Level::Debug, Domain::Replication, "sync_response", obj(&[("clock", json!(now))]));
        }
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::clock::ReplicationClock;
    use crate::stock::StockPublisher;
    use crate::storage::MemoryBackend;
    use std::sync::{Arc, Mutex};

    fn key(name: &str) -> CommodityKey {
        CommodityKey::new(name).unwrap()
    }

    const KNOWN: [&str; 6] = ["COAL", "DIAMOND", "DIRT", "GOLD", "IRON", "SAND"];

    fn store_at(clock: i64) -> StockStore {
        let store = StockStore::new(Box::new(MemoryBackend::new()), Arc::new(ReplicationClock::new(clock)));
        let known: Vec<_> = KNOWN.iter().map(|n| key(n)).collect();
        store.load(known.iter()).unwrap();
        store
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<WireMessage>>);

    impl StockPublisher for Outbox {
        fn publish(&self, key: &CommodityKey, record: &StockRecord) {
            self.0.lock().unwrap().push(stock_message(key, record, record.version));
        }
    }

    impl Outbox {
        fn drain(&self) -> Vec<WireMessage> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn values(store: &StockStore) -> Vec<(CommodityKey, f64, f64)> {
        store.snapshot().into_iter().map(|(k, r)| (k, r.stock, r.purchases)).collect()
    }

    #[test]
    fn test_same_stock_message_twice_is_idempotent() {
        let s = store_at(0);
        let msg = WireMessage::parse(r#"STOCK {"material":"diamond","stock":4,"purchases":2,"lastTx":100}"#).unwrap();
        let first = on_message(&s, msg.clone());
        assert_eq!(first.changed, vec![key("DIAMOND")]);
        let after_first = s.get(&key("DIAMOND"));

        let second = on_message(&s, msg);
        assert!(second.changed.is_empty());
        assert_eq!(s.get(&key("DIAMOND")), after_first);
        assert_eq!(s.clock().now(), 100);
    }

    #[test]
    fn test_stale_update_is_discarded_per_commodity() {
        let s = store_at(0);
        s.apply_delta_at(&key("DIRT"), 9.0, 2_000);
        on_message(&s, stock_message(&key("DIRT"), &StockRecord::zero(0), 1_000));
        assert_eq!(s.get(&key("DIRT")).stock, 9.0);

        // an older tag is still fine for a commodity this node has not touched
        let handled = on_message(
            &s,
            stock_message(&key("SAND"), &StockRecord { stock: 3.0, ..StockRecord::zero(0) }, 1_000),
        );
        assert_eq!(handled.changed, vec![key("SAND")]);
        assert_eq!(s.clock().now(), 2_000);
    }

    #[test]
    fn test_two_stores_converge() {
        let a = store_at(0);
        let b = store_at(0);
        let (out_a, out_b) = (Arc::new(Outbox::default()), Arc::new(Outbox::default()));
        a.attach_publisher(out_a.clone());
        b.attach_publisher(out_b.clone());

        a.apply_delta_at(&key("DIAMOND"), 10.0, 10);
        b.apply_delta_at(&key("DIAMOND"), -3.0, 20);
        a.apply_delta_at(&key("DIRT"), 64.0, 30);
        b.apply_delta_at(&key("COAL"), 5.0, 40);
        a.apply_delta_at(&key("COAL"), -1.0, 50);

        for msg in out_a.drain() {
            on_message(&b, msg);
        }
        for msg in out_b.drain() {
            on_message(&a, msg);
        }
        assert_eq!(values(&a), values(&b));
        assert_eq!(a.get(&key("DIAMOND")).stock, -3.0);
        assert_eq!(a.get(&key("COAL")).stock, -1.0, "last writer wins");
    }

    #[test]
    fn test_clock_is_monotonic_under_any_order() {
        let s = store_at(0);
        let mut last = 0;
        for (i, tag) in [500, 20, 900, 900, 10, 1_500, 3].into_iter().enumerate() {
            let material = if i % 2 == 0 { "IRON" } else { "GOLD" };
            let frame = format!(r#"STOCK {{"material":"{}","stock":{},"purchases":0,"lastTx":{}}}"#, material, i, tag);
            on_message(&s, WireMessage::parse(&frame).unwrap());
            on_message(&s, WireMessage::SyncResponse(tag / 2));
            assert!(s.clock().now() >= last);
            last = s.clock().now();
        }
        assert_eq!(last, 1_500);
    }

    #[test]
    fn test_startup_handshake() {
        let a = store_at(0);
        a.apply_delta_at(&key("DIAMOND"), 5.0, 900);
        a.apply_delta_at(&key("DIRT"), -2.0, 1_000);
        let b = store_at(500);
        b.apply_delta_at(&key("DIAMOND"), 1.0, 400);

        let handled = on_message(&a, WireMessage::SyncRequest(b.clock().now()));
        assert_eq!(handled.replies[0], WireMessage::SyncResponse(1_000));
        assert_eq!(handled.replies.len(), 1 + KNOWN.len());
        assert_eq!(a.dirty_count(), 0, "sync request flushes first");

        for reply in handled.replies {
            on_message(&b, reply);
        }
        assert_eq!(b.clock().now(), 1_000);
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_sync_request_from_newer_peer_gets_no_reply() {
        let a = store_at(1_000);
        assert!(on_message(&a, WireMessage::SyncRequest(1_000)).replies.is_empty());
        assert!(on_message(&a, WireMessage::SyncRequest(5_000)).replies.is_empty());
    }

    #[test]
    fn test_invalid_commodity_is_dropped() {
        let s = store_at(0);
        let msg = WireMessage::parse(r#"STOCK {"material":"  ","stock":1,"purchases":0,"lastTx":1}"#).unwrap();
        assert_eq!(on_message(&s, msg), Handled::default());
        assert_eq!(s.keys().len(), KNOWN.len());
    }

    #[test]
    fn test_unknown_commodity_is_not_absorbed() {
        let s = store_at(0);
        s.flush().unwrap();
        let before = s.keys();
        let msg = WireMessage::parse(r#"STOCK {"material":"NOT_A_REAL_ITEM","stock":5,"purchases":1,"lastTx":900}"#).unwrap();
        assert_eq!(on_message(&s, msg), Handled::default());
        assert_eq!(s.keys(), before);
        assert_eq!(s.dirty_count(), 0);
        assert_eq!(s.clock().now(), 0, "dropped frames do not move the clock");
    }
}
