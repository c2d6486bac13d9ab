use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::commodity::CommodityKey;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::pricing::PriceParameters;

pub const DEFAULT_REPLICATION_PORT: u16 = 5556;

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub dynamic_pricing: bool,
    pub curve_strength: f64,
    pub max_stock: f64,
    pub min_price_multiplier: f64,
    pub max_price_multiplier: f64,
    pub negative_stock_percent: f64,
    pub time_inflation: bool,
    pub hourly_increase_percent: f64,
    pub sell_tax_percent: f64,
    pub restrict_buy_at_zero: bool,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            dynamic_pricing: true,
            curve_strength: 0.7,
            max_stock: 500.0,
            min_price_multiplier: 0.5,
            max_price_multiplier: 20.0,
            negative_stock_percent: 5.0,
            time_inflation: true,
            hourly_increase_percent: 2.0,
            sell_tax_percent: 30.0,
            restrict_buy_at_zero: false,
        }
    }
}

impl PricingConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dynamic_pricing: env_flag("DYNAMIC_PRICING").unwrap_or(d.dynamic_pricing),
            curve_strength: std::env::var("CURVE_STRENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(d.curve_strength),
            max_stock: std::env::var("MAX_STOCK").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_stock),
            min_price_multiplier: std::env::var("MIN_PRICE_MULT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.min_price_multiplier),
            max_price_multiplier: std::env::var("MAX_PRICE_MULT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_price_multiplier),
            negative_stock_percent: std::env::var("NEG_STOCK_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.negative_stock_percent),
            time_inflation: env_flag("TIME_INFLATION").unwrap_or(d.time_inflation),
            hourly_increase_percent: std::env::var("HOURLY_INCREASE_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.hourly_increase_percent),
            sell_tax_percent: std::env::var("SELL_TAX_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.sell_tax_percent),
            restrict_buy_at_zero: env_flag("RESTRICT_BUY_AT_ZERO").unwrap_or(d.restrict_buy_at_zero),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub port: u16,
    pub peers: Vec<String>,
    pub flush_interval_secs: u64,
    pub sync_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_REPLICATION_PORT,
            peers: Vec::new(),
            flush_interval_secs: 600,
            sync_delay_ms: 3000,
        }
    }
}

impl ReplicationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let port = std::env::var("REPL_PORT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map(sanitize_port)
            .unwrap_or(d.port);
        Self {
            enabled: env_flag("REPL_ENABLED").unwrap_or(d.enabled),
            port,
            peers: std::env::var("REPL_PEERS").map(|v| split_peer_list(&v)).unwrap_or_default(),
            flush_interval_secs: std::env::var("REPL_FLUSH_SECS").ok().and_then(|v| v.parse().ok()).filter(|v| *v > 0).unwrap_or(d.flush_interval_secs),
            sync_delay_ms: std::env::var("REPL_SYNC_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.sync_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pricing: PricingConfig,
    pub replication: ReplicationConfig,
    pub prices_path: String,
    pub sqlite_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pricing: PricingConfig::default(),
            replication: ReplicationConfig::default(),
            prices_path: "./prices.json".to_string(),
            sqlite_path: "./shopdata.sqlite".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            pricing: PricingConfig::from_env(),
            replication: ReplicationConfig::from_env(),
            prices_path: std::env::var("PRICES_PATH").unwrap_or(d.prices_path),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
        }
    }

    /// Combine the scalar pricing settings with the base price table on disk.
    pub fn price_parameters(&self) -> Result<PriceParameters> {
        let base_prices = load_base_prices(Path::new(&self.prices_path))?;
        Ok(PriceParameters::new(self.pricing.clone(), base_prices))
    }
}

/// Read `{"DIAMOND": 100.0, "dirt": 0.5, ...}` into a normalized price table.
///
/// A missing file yields an empty table. Keys that do not normalize are
/// skipped with a warning.
pub fn load_base_prices(path: &Path) -> Result<HashMap<CommodityKey, f64>> {
    if !path.exists() {
        log(
            Level::Warn,
            Domain::Pricing,
            "price_file_missing",
            obj(&[("path", v_str(&path.to_string_lossy()))]),
        );
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading price file {}", path.display()))?;
    parse_base_prices(&raw).with_context(|| format!("parsing price file {}", path.display()))
}

pub fn parse_base_prices(raw: &str) -> Result<HashMap<CommodityKey, f64>> {
    let table: HashMap<String, f64> = serde_json::from_str(raw)?;
    let mut prices = HashMap::with_capacity(table.len());
    for (name, base) in table {
        match CommodityKey::new(&name) {
            Ok(key) => {
                prices.insert(key, base);
            }
            Err(err) => log(
                Level::Warn,
                Domain::Pricing,
                "invalid_commodity",
                obj(&[("name", v_str(&name)), ("error", v_str(&err.to_string()))]),
            ),
        }
    }
    Ok(prices)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn sanitize_port(port: u32) -> u16 {
    if (1024..=65535).contains(&port) {
        port as u16
    } else {
        DEFAULT_REPLICATION_PORT
    }
}

fn split_peer_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_port_falls_back() {
        assert_eq!(sanitize_port(80), DEFAULT_REPLICATION_PORT);
        assert_eq!(sanitize_port(70_000), DEFAULT_REPLICATION_PORT);
        assert_eq!(sanitize_port(6000), 6000);
    }

    #[test]
    fn test_split_peer_list() {
        let peers = split_peer_list(" a.example:5556, ,[::1]:7000,b ");
        assert_eq!(peers, vec!["a.example:5556", "[::1]:7000", "b"]);
    }

    #[test]
    fn test_parse_base_prices_normalizes_keys() {
        let prices = parse_base_prices(r#"{"diamond": 100.0, "bedrock": -1, "bad key": 3}"#).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&CommodityKey::new("DIAMOND").unwrap()], 100.0);
        assert_eq!(prices[&CommodityKey::new("bedrock").unwrap()], -1.0);
    }

    #[test]
    fn test_missing_price_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let prices = load_base_prices(&dir.path().join("nope.json")).unwrap();
        assert!(prices.is_empty());
    }
}
