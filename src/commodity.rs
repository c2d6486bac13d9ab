use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Identifier of a tradeable item type.
///
/// Keys are trimmed and upper-cased on construction so `diamond`, ` Diamond `
/// and `DIAMOND` all name the same commodity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommodityKey(String);

impl CommodityKey {
    pub fn new(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            bail!("empty commodity key");
        }
        if normalized.chars().any(|c| c.is_whitespace() || c.is_control()) {
            bail!("commodity key contains whitespace: {:?}", raw);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommodityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommodityKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for CommodityKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<CommodityKey> for String {
    fn from(key: CommodityKey) -> Self {
        key.0
    }
}
