//! Restart behaviour against a real SQLite file.

use std::collections::HashMap;

use rusqlite::Connection;

use marketsync::commodity::CommodityKey;
use marketsync::config::{Config, PricingConfig};
use marketsync::node::Node;
use marketsync::pricing::PriceParameters;
use marketsync::storage::SqliteBackend;

fn key(name: &str) -> CommodityKey {
    CommodityKey::new(name).unwrap()
}

fn params() -> PriceParameters {
    let mut prices = HashMap::new();
    prices.insert(key("DIAMOND"), 100.0);
    prices.insert(key("EMERALD"), 40.0);
    PriceParameters::new(PricingConfig::default(), prices)
}

#[tokio::test]
async fn restart_keeps_stock_and_clock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shopdata.sqlite");
    let path = path.to_str().unwrap();

    let clock_before = {
        let node = Node::start(Config::default(), params(), Box::new(SqliteBackend::open(path).unwrap()))
            .await
            .unwrap();
        node.market().apply_sale(&key("DIAMOND"), 9.0);
        node.market().apply_purchase(&key("EMERALD"), 2.0);
        let clock = node.store().clock().now();
        node.shutdown().unwrap();
        clock
    };

    let node = Node::start(Config::default(), params(), Box::new(SqliteBackend::open(path).unwrap()))
        .await
        .unwrap();
    assert_eq!(node.market().current_stock(&key("DIAMOND")), 9.0);
    let emerald = node.store().get(&key("EMERALD"));
    assert_eq!(emerald.stock, -2.0);
    assert_eq!(emerald.purchases, 2.0);
    assert_eq!(node.store().clock().now(), clock_before);
    node.shutdown().unwrap();
}

#[tokio::test]
async fn legacy_layout_is_migrated_on_first_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.sqlite");
    let path = path.to_str().unwrap();
    {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE shopdata (path TEXT PRIMARY KEY, value REAL NOT NULL);
             INSERT INTO shopdata VALUES ('stock.emerald', 33.0);
             INSERT INTO shopdata VALUES ('purchases.emerald', 8.0);",
        )
        .unwrap();
    }

    let node = Node::start(Config::default(), params(), Box::new(SqliteBackend::open(path).unwrap()))
        .await
        .unwrap();
    assert_eq!(node.market().current_stock(&key("EMERALD")), 33.0);
    assert_eq!(node.market().current_stock(&key("DIAMOND")), 0.0);
    node.shutdown().unwrap();

    let conn = Connection::open(path).unwrap();
    let legacy: i64 = conn
        .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'shopdata'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(legacy, 0);
    let items: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0)).unwrap();
    assert_eq!(items, 2, "defaulted commodities are written back too");
}
