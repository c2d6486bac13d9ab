use anyhow::Result;
use serde_json::json;

use marketsync::config::Config;
use marketsync::logging::{log, obj, v_str, Domain, Level};
use marketsync::node::Node;
use marketsync::storage::SqliteBackend;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let params = cfg.price_parameters()?;
    let backend = SqliteBackend::open(&cfg.sqlite_path)?;

    log(
        Level::Info,
        Domain::System,
        "config",
        obj(&[
            ("prices_path", v_str(&cfg.prices_path)),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("dynamic_pricing", json!(cfg.pricing.dynamic_pricing)),
            ("replication", json!(cfg.replication.enabled)),
            ("port", json!(cfg.replication.port)),
            ("flush_interval_secs", json!(cfg.replication.flush_interval_secs)),
        ]),
    );

    let node = Node::start(cfg, params, Box::new(backend)).await?;
    node.run().await
}
