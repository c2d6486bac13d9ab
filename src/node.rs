//! A running market node: owns the store, the market facade and the
//! replication sockets, and is the single place inbound traffic is applied.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};

use crate::config::Config;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::market::Market;
use crate::pricing::PriceParameters;
use crate::replication::clock::ReplicationClock;
use crate::replication::protocol;
use crate::replication::wire::WireMessage;
use crate::replication::{Command, ReplicationManager};
use crate::stock::StockStore;
use crate::storage::StockBackend;

pub struct Node {
    config: Config,
    store: Arc<StockStore>,
    market: Arc<Market>,
    replication: Option<Arc<ReplicationManager>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Node {
    /// Load persisted stock and, when enabled, join the replication mesh. A
    /// replication endpoint that cannot bind leaves the node standalone.
    pub async fn start(config: Config, params: PriceParameters, backend: Box<dyn StockBackend>) -> Result<Self> {
        let clock = Arc::new(ReplicationClock::default());
        let store = Arc::new(StockStore::new(backend, clock));
        store.load(params.commodities())?;
        let market = Arc::new(Market::new(params, store.clone()));

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let replication = if config.replication.enabled {
            match ReplicationManager::start(&config.replication, commands_tx.clone()).await {
                Ok(manager) => {
                    let manager = Arc::new(manager);
                    store.attach_publisher(manager.clone());
                    Some(manager)
                }
                Err(e) => {
                    log(
                        Level::Error,
                        Domain::Replication,
                        "disabled",
                        obj(&[("error", v_str(&format!("{:#}", e))), ("port", json!(config.replication.port))]),
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::assemble(config, store, market, replication, commands_tx, commands))
    }

    /// Build a node around an already running replication manager.
    pub fn with_replication(
        config: Config,
        market: Arc<Market>,
        replication: Arc<ReplicationManager>,
        commands_tx: mpsc::UnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let store = market.store().clone();
        store.attach_publisher(replication.clone());
        Self::assemble(config, store, market, Some(replication), commands_tx, commands)
    }

    fn assemble(
        config: Config,
        store: Arc<StockStore>,
        market: Arc<Market>,
        replication: Option<Arc<ReplicationManager>>,
        commands_tx: mpsc::UnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        log(
            Level::Info,
            Domain::System,
            "node_started",
            obj(&[
                ("commodities", json!(store.keys().len())),
                ("clock", json!(store.clock().now())),
                ("replicating", json!(replication.is_some())),
            ]),
        );
        Self { config, store, market, replication, commands_tx, commands }
    }

    pub fn market(&self) -> &Arc<Market> {
        &self.market
    }

    pub fn store(&self) -> &Arc<StockStore> {
        &self.store
    }

    pub fn replication(&self) -> Option<&Arc<ReplicationManager>> {
        self.replication.as_ref()
    }

    /// Sender for injecting work into the primary loop.
    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands_tx.clone()
    }

    /// Apply one command. Only ever called from the primary loop.
    pub fn handle(&self, command: Command) {
        match command {
            Command::Wire(msg) => {
                let handled = protocol::on_message(&self.store, msg);
                for key in &handled.changed {
                    self.market.notify(key);
                }
                for reply in &handled.replies {
                    self.broadcast(reply);
                }
            }
            Command::RequestSync => {
                let _ = self.store.flush();
                let ours = self.store.clock().now();
                log(Level::Info, Domain::Replication, "sync_requested", obj(&[("clock", json!(ours))]));
                self.broadcast(&WireMessage::SyncRequest(ours));
            }
        }
    }

    fn broadcast(&self, msg: &WireMessage) {
        if let Some(replication) = &self.replication {
            replication.send(msg);
        }
    }

    /// Run until ctrl-c, then shut down.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log(Level::Warn, Domain::System, "signal_failed", obj(&[("error", v_str(&e.to_string()))]));
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Primary loop: periodic flush and inbound commands until `stop`
    /// resolves. Always ends with a full shutdown flush.
    pub async fn run_until(mut self, stop: impl Future<Output = ()>) -> Result<()> {
        let period = Duration::from_secs(self.config.replication.flush_interval_secs.max(1));
        let mut flush_timer = interval_at(Instant::now() + period, period);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    let _ = self.store.flush();
                }
                Some(command) = self.commands.recv() => {
                    self.handle(command);
                }
                _ = &mut stop => break,
            }
        }
        self.shutdown()
    }

    /// Stop replication first so nothing else lands in the store, then write
    /// out everything still dirty.
    pub fn shutdown(self) -> Result<()> {
        if let Some(replication) = &self.replication {
            self.store.detach_publisher();
            replication.shutdown();
        }
        let saved = self.store.flush()?;
        log(Level::Info, Domain::System, "node_stopped", obj(&[("saved", json!(saved)), ("clock", json!(self.store.clock().now()))]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commodity::CommodityKey;
    use crate::config::PricingConfig;
    use crate::storage::MemoryBackend;
    use std::collections::HashMap;

    fn params() -> PriceParameters {
        let mut prices = HashMap::new();
        prices.insert(CommodityKey::new("DIAMOND").unwrap(), 100.0);
        PriceParameters::new(PricingConfig::default(), prices)
    }

    #[tokio::test]
    async fn test_standalone_node_flushes_on_shutdown() {
        let backend = MemoryBackend::new();
        let persisted = backend.contents();
        let node = Node::start(Config::default(), params(), Box::new(backend)).await.unwrap();
        assert!(node.replication().is_none());

        let diamond = CommodityKey::new("diamond").unwrap();
        node.market().apply_sale(&diamond, 4.0);
        node.run_until(async {}).await.unwrap();

        assert_eq!(persisted.lock().unwrap()[&CommodityKey::new("DIAMOND").unwrap()].stock, 4.0);
    }

    #[tokio::test]
    async fn test_unknown_commodity_from_peer_is_not_persisted() {
        let backend = MemoryBackend::new();
        let persisted = backend.contents();
        let node = Node::start(Config::default(), params(), Box::new(backend)).await.unwrap();

        let frame = r#"STOCK {"material":"NOT_A_REAL_ITEM","stock":3,"purchases":0,"lastTx":99}"#;
        node.handle(Command::Wire(WireMessage::parse(frame).unwrap()));
        assert_eq!(node.store().keys(), vec![CommodityKey::new("DIAMOND").unwrap()]);

        node.shutdown().unwrap();
        let saved: Vec<_> = persisted.lock().unwrap().keys().cloned().collect();
        assert_eq!(saved, vec![CommodityKey::new("DIAMOND").unwrap()]);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_node_standalone() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let mut config = Config::default();
        config.replication.enabled = true;
        config.replication.port = port;

        let backend = MemoryBackend::new();
        let persisted = backend.contents();
        let node = Node::start(config, params(), Box::new(backend)).await.unwrap();
        assert!(node.replication().is_none());

        let diamond = CommodityKey::new("DIAMOND").unwrap();
        node.market().apply_sale(&diamond, 2.0);
        node.shutdown().unwrap();
        assert_eq!(persisted.lock().unwrap()[&diamond].stock, 2.0);
        drop(occupied);
    }

    #[tokio::test]
    async fn test_inbound_commands_reach_the_store() {
        let node = Node::start(Config::default(), params(), Box::new(MemoryBackend::new())).await.unwrap();
        let tx = node.commands();
        let store = node.store().clone();
        let frame = r#"STOCK {"material":"DIAMOND","stock":-7,"purchases":7,"lastTx":4242}"#;
        tx.send(Command::Wire(WireMessage::parse(frame).unwrap())).unwrap();

        let stop = async {
            while store.clock().now() < 4242 {
                tokio::task::yield_now().await;
            }
        };
        let store_view = node.store().clone();
        node.run_until(stop).await.unwrap();
        assert_eq!(store_view.get(&CommodityKey::new("DIAMOND").unwrap()).stock, -7.0);
    }
}
