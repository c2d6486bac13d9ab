use std::fmt;

use anyhow::{Context, Result};
use url::Url;

use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&format!("ws://{}/", self)).with_context(|| format!("peer url for {}", self))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a free-form `host[:port]` entry.
///
/// Accepts quoted entries, `[v6]:port`, bare `[v6]`, and unbracketed IPv6
/// literals (which always use `default_port`). Returns `None` for anything
/// without a usable host or with an unparseable port.
pub fn resolve_peer(raw: &str, default_port: u16) -> Option<PeerAddr> {
    let entry = raw.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
    if entry.is_empty() {
        return None;
    }

    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail {
            "" => default_port,
            _ => tail.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else if entry.matches(':').count() > 1 {
        (entry, default_port)
    } else {
        match entry.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (entry, default_port),
        }
    };

    if host.is_empty() || port == 0 {
        return None;
    }
    Some(PeerAddr { host: host.to_string(), port })
}

/// Resolve a configured peer list, skipping malformed entries with a warning.
pub fn resolve_peers(entries: &[String], default_port: u16) -> Vec<PeerAddr> {
    entries
        .iter()
        .filter_map(|raw| {
            let resolved = resolve_peer(raw, default_port).filter(|p| p.url().is_ok());
            if resolved.is_none() {
                log(Level::Warn, Domain::Replication, "peer_invalid", obj(&[("peer", v_str(raw))]));
            }
            resolved
        })
        .collect()
}
