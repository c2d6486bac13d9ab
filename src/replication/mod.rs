//! Best-effort stock replication between market nodes.
//!
//! Local changes are broadcast as absolute values tagged with the
//! replication clock. Peers absorb anything that is not older than what they
//! already hold for that commodity, breaking equal tags on the values. A node that starts late catches up by
//! asking for everything newer than its own clock.

pub mod clock;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod wire;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::commodity::CommodityKey;
use crate::config::ReplicationConfig;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::retry::RetryConfig;
use crate::stock::{StockPublisher, StockRecord};

use self::peer::{resolve_peers, PeerAddr};
use self::wire::WireMessage;

/// Work handed to the node's primary loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Wire(WireMessage),
    /// Startup catch-up: flush, then ask peers for newer state.
    RequestSync,
}

pub struct ReplicationManager {
    local_addr: SocketAddr,
    peers: Vec<PeerAddr>,
    outbound: broadcast::Sender<String>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// Bind `0.0.0.0:<port>`, subscribe to every configured peer and schedule
    /// the startup sync.
    pub async fn start(cfg: &ReplicationConfig, commands: mpsc::UnboundedSender<Command>) -> Result<Self> {
        let peers = resolve_peers(&cfg.peers, cfg.port);
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
        Self::start_on(bind, peers, Duration::from_millis(cfg.sync_delay_ms), RetryConfig::default(), commands).await
    }

    pub async fn start_on(
        bind: SocketAddr,
        peers: Vec<PeerAddr>,
        sync_delay: Duration,
        retry: RetryConfig,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Result<Self> {
        let publisher = transport::bind_publisher(bind).await?;
        let mut tasks = vec![publisher.accept_task];
        for peer in &peers {
            tasks.push(transport::spawn_subscriber(peer.clone(), commands.clone(), retry.clone()));
        }
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(sync_delay).await;
            let _ = commands.send(Command::RequestSync);
        }));

        log(
            Level::Info,
            Domain::Replication,
            "started",
            obj(&[
                ("bind", v_str(&publisher.local_addr.to_string())),
                ("peers", json!(peers.iter().map(|p| p.to_string()).collect::<Vec<_>>())),
                ("sync_delay_ms", json!(sync_delay.as_millis() as u64)),
            ]),
        );

        Ok(Self {
            local_addr: publisher.local_addr,
            peers,
            outbound: publisher.outbound,
            running: AtomicBool::new(true),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &[PeerAddr] {
        &self.peers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire-and-forget broadcast to whoever is subscribed right now.
    pub fn send(&self, msg: &WireMessage) {
        if !self.is_running() {
            return;
        }
        match msg.encode() {
            Ok(frame) => {
                // no subscribers is not an error
                let _ = self.outbound.send(frame);
            }
            Err(e) => log(
                Level::Warn,
                Domain::Replication,
                "encode_failed",
                obj(&[("topic", v_str(msg.topic())), ("error", v_str(&format!("{:#}", e)))]),
            ),
        }
    }

    /// Stop broadcasting and tear down every socket task, including the
    /// connections accepted by the publisher.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in &tasks {
            task.abort();
        }
        log(Level::Info, Domain::Replication, "stopped", obj(&[("tasks", json!(tasks.len()))]));
    }
}

impl StockPublisher for ReplicationManager {
    fn publish(&self, key: &CommodityKey, record: &StockRecord) {
        self.send(&protocol::stock_message(key, record, record.version));
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
