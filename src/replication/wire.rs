//! Text frames exchanged between peers: `"<TOPIC> <body>"`.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const TOPIC_STOCK: &str = "STOCK";
pub const TOPIC_SYNC_REQUEST: &str = "SYNC_REQUEST";
pub const TOPIC_SYNC_RESPONSE: &str = "SYNC_RESPONSE";

/// Absolute stock state of one commodity as broadcast by its last writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockUpdate {
    pub material: String,
    pub stock: f64,
    pub purchases: f64,
    #[serde(rename = "lastTx")]
    pub last_tx: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Stock(StockUpdate),
    SyncRequest(i64),
    SyncResponse(i64),
}

impl WireMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            WireMessage::Stock(_) => TOPIC_STOCK,
            WireMessage::SyncRequest(_) => TOPIC_SYNC_REQUEST,
            WireMessage::SyncResponse(_) => TOPIC_SYNC_RESPONSE,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let body = match self {
            WireMessage::Stock(update) => serde_json::to_string(update)?,
            WireMessage::SyncRequest(ts) | WireMessage::SyncResponse(ts) => ts.to_string(),
        };
        Ok(format!("{} {}", self.topic(), body))
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let (topic, body) = frame
            .split_once(' ')
            .ok_or_else(|| anyhow!("frame has no topic separator"))?;
        let body = body.trim();
        match topic {
            TOPIC_STOCK => {
                let update: StockUpdate = serde_json::from_str(body).context("stock body")?;
                Ok(WireMessage::Stock(update))
            }
            TOPIC_SYNC_REQUEST => Ok(WireMessage::SyncRequest(parse_ts(body)?)),
            TOPIC_SYNC_RESPONSE => Ok(WireMessage::SyncResponse(parse_ts(body)?)),
            other => bail!("unknown topic {:?}", other),
        }
    }
}

fn parse_ts(body: &str) -> Result<i64> {
    body.parse().with_context(|| format!("bad clock value {:?}", body))
}
