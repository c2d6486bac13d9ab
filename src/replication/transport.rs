//! WebSocket pub/sub plumbing.
//!
//! The publisher side accepts connections on the bind address and pushes
//! every outbound frame to all of them. Each configured peer gets a
//! subscriber task that keeps a client connection open to that peer's
//! publisher and forwards what it hears into the node's command channel.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use crate::logging::{log, log_dropped_frame, obj, v_str, Domain, Level};
use crate::replication::peer::PeerAddr;
use crate::replication::wire::WireMessage;
use crate::replication::Command;
use crate::retry::{Backoff, RetryConfig};

const OUTBOUND_BUFFER: usize = 1024;

pub struct Publisher {
    pub local_addr: SocketAddr,
    pub outbound: broadcast::Sender<String>,
    pub accept_task: JoinHandle<()>,
}

pub async fn bind_publisher(addr: SocketAddr) -> Result<Publisher> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    let local_addr = listener.local_addr()?;
    let (outbound, _) = broadcast::channel(OUTBOUND_BUFFER);

    let fanout = outbound.clone();
    let accept_task = tokio::spawn(async move {
        // dropping the set (when this task is aborted) aborts every connection
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        connections.spawn(serve_subscriber(stream, remote, fanout.subscribe()));
                    }
                    Err(e) => {
                        log(Level::Warn, Domain::Replication, "accept_failed", obj(&[("error", v_str(&e.to_string()))]));
                    }
                },
                Some(_) = connections.join_next() => {}
            }
        }
    });

    Ok(Publisher { local_addr, outbound, accept_task })
}

async fn serve_subscriber(stream: TcpStream, remote: SocketAddr, mut frames: broadcast::Receiver<String>) {
    let peer = remote.to_string();
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log(
                Level::Debug,
                Domain::Replication,
                "handshake_failed",
                obj(&[("peer", v_str(&peer)), ("error", v_str(&e.to_string()))]),
            );
            return;
        }
    };
    log(Level::Info, Domain::Replication, "subscriber_connected", obj(&[("peer", v_str(&peer))]));
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log(
                        Level::Warn,
                        Domain::Replication,
                        "subscriber_lagged",
                        obj(&[("peer", v_str(&peer)), ("skipped", json!(n))]),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // subscribers have nothing to say
                Some(Ok(_)) => {}
            },
        }
    }
    log(Level::Info, Domain::Replication, "subscriber_disconnected", obj(&[("peer", v_str(&peer))]));
}

/// Keep a subscription to `peer` alive until the task is aborted.
pub fn spawn_subscriber(peer: PeerAddr, commands: mpsc::UnboundedSender<Command>, retry: RetryConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = peer.to_string();
        let url = match peer.url() {
            Ok(url) => url,
            Err(e) => {
                log(Level::Warn, Domain::Replication, "peer_invalid", obj(&[("peer", v_str(&name)), ("error", v_str(&e.to_string()))]));
                return;
            }
        };
        let mut backoff = Backoff::new(retry);

        loop {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    backoff.reset();
                    log(Level::Info, Domain::Replication, "peer_connected", obj(&[("peer", v_str(&name))]));
                    let (_write, mut read) = ws.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(Message::Text(text)) => match WireMessage::parse(&text) {
                                Ok(wire) => {
                                    if commands.send(Command::Wire(wire)).is_err() {
                                        // node is gone
                                        return;
                                    }
                                }
                                Err(e) => log_dropped_frame(&format!("{:#}", e), &text),
                            },
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                log(
                                    Level::Warn,
                                    Domain::Replication,
                                    "peer_error",
                                    obj(&[("peer", v_str(&name)), ("error", v_str(&e.to_string()))]),
                                );
                                break;
                            }
                        }
                    }
                    log(Level::Info, Domain::Replication, "peer_disconnected", obj(&[("peer", v_str(&name))]));
                }
                Err(e) => {
                    log(
                        Level::Debug,
                        Domain::Replication,
                        "peer_connect_failed",
                        obj(&[
                            ("peer", v_str(&name)),
                            ("error", v_str(&e.to_string())),
                            ("attempt", json!(backoff.attempt())),
                        ]),
                    );
                }
            }
            if commands.is_closed() {
                return;
            }
            sleep(backoff.next_delay()).await;
        }
    })
}
