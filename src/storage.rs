use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::commodity::CommodityKey;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::stock::StockRecord;

const CLOCK_KEY: &str = "last_tx";
const LEGACY_TABLE: &str = "shopdata";

/// Everything persisted for a node: per-commodity records and the last known
/// replication clock.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub records: Vec<(CommodityKey, StockRecord)>,
    pub clock: i64,
    /// Commodities rewritten from the legacy flat layout during this load.
    pub migrated: usize,
}

/// Durable key-value storage behind the stock store.
pub trait StockBackend: Send {
    fn load(&mut self, now_ms: i64) -> Result<StoredState>;
    fn save(&mut self, batch: &[(CommodityKey, StockRecord)], clock: i64) -> Result<()>;
}

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
        let mut backend = Self { conn };
        backend.init()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut backend = Self { conn: Connection::open_in_memory()? };
        backend.init()?;
        Ok(backend)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS items (
                key TEXT PRIMARY KEY,
                stock REAL NOT NULL,
                purchases REAL NOT NULL,
                last_update INTEGER NOT NULL,
                shortage_hours REAL NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn has_legacy_table(&self) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![LEGACY_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fold the flat `shopdata(path, value)` layout (`stock.DIAMOND = 12`, ...)
    /// into `items` and drop it. Items already present in the nested layout
    /// win over their legacy values. Runs in one transaction, so a crash leaves
    /// either the old or the new layout.
    fn migrate_legacy(&mut self, now_ms: i64) -> Result<usize> {
        if !self.has_legacy_table()? {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut legacy: BTreeMap<CommodityKey, StockRecord> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(&format!("SELECT path, value FROM {}", LEGACY_TABLE))?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
            for row in rows {
                let (path, value) = row?;
                let Some((field, name)) = path.split_once('.') else {
                    log(Level::Warn, Domain::Storage, "legacy_path_invalid", obj(&[("path", v_str(&path))]));
                    continue;
                };
                let Ok(key) = CommodityKey::new(name) else {
                    log(Level::Warn, Domain::Storage, "legacy_key_invalid", obj(&[("path", v_str(&path))]));
                    continue;
                };
                let record = legacy.entry(key).or_insert_with(|| StockRecord::zero(now_ms));
                match field {
                    "stock" => record.stock = value,
                    "purchases" => record.purchases = value,
                    "last_update" => record.last_update = value as i64,
                    "shortage_hours" => record.shortage_hours = value,
                    _ => log(Level::Warn, Domain::Storage, "legacy_field_unknown", obj(&[("path", v_str(&path))])),
                }
            }
        }

        let mut migrated = 0;
        for (key, r) in &legacy {
            migrated += tx.execute(
                "INSERT OR IGNORE INTO items (key, stock, purchases, last_update, shortage_hours, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![key.as_str(), r.stock, r.purchases, r.last_update, r.shortage_hours, r.version],
            )?;
        }
        tx.execute_batch(&format!("DROP TABLE {};", LEGACY_TABLE))?;
        tx.commit()?;

        log(
            Level::Info,
            Domain::Storage,
            "legacy_migrated",
            obj(&[("migrated", serde_json::json!(migrated)), ("seen", serde_json::json!(legacy.len()))]),
        );
        Ok(migrated)
    }
}

impl StockBackend for SqliteBackend {
    fn load(&mut self, now_ms: i64) -> Result<StoredState> {
        let migrated = self.migrate_legacy(now_ms)?;

        let mut records = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT key, stock, purchases, last_update, shortage_hours, version FROM items ORDER BY key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StockRecord {
                        stock: row.get(1)?,
                        purchases: row.get(2)?,
                        last_update: row.get(3)?,
                        shortage_hours: row.get(4)?,
                        version: row.get(5)?,
                    },
                ))
            })?;
            for row in rows {
                let (name, record) = row?;
                match CommodityKey::new(&name) {
                    Ok(key) => records.push((key, record)),
                    Err(_) => log(Level::Warn, Domain::Storage, "stored_key_invalid", obj(&[("key", v_str(&name))])),
                }
            }
        }

        let clock: Option<i64> = self
            .conn
            .query_row("SELECT value FROM meta WHERE name = ?1", params![CLOCK_KEY], |row| row.get(0))
            .optional()?;

        Ok(StoredState { records, clock: clock.unwrap_or(0), migrated })
    }

    fn save(&mut self, batch: &[(CommodityKey, StockRecord)], clock: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (key, r) in batch {
            tx.execute(
                "INSERT INTO items (key, stock, purchases, last_update, shortage_hours, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    stock = excluded.stock,
                    purchases = excluded.purchases,
                    last_update = excluded.last_update,
                    shortage_hours = excluded.shortage_hours,
                    version = excluded.version",
                params![key.as_str(), r.stock, r.purchases, r.last_update, r.shortage_hours, r.version],
            )?;
        }
        tx.execute(
            "INSERT INTO meta (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![CLOCK_KEY, clock],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Volatile backend for standalone nodes and tests. Saves can be made to fail
/// through the handle returned by [`MemoryBackend::fault_switch`].
#[derive(Default)]
pub struct MemoryBackend {
    items: Arc<Mutex<HashMap<CommodityKey, StockRecord>>>,
    clock: i64,
    fail_saves: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fault_switch(&self) -> Arc<AtomicBool> {
        self.fail_saves.clone()
    }

    /// Shared view of what has been persisted so far.
    pub fn contents(&self) -> Arc<Mutex<HashMap<CommodityKey, StockRecord>>> {
        self.items.clone()
    }
}

impl StockBackend for MemoryBackend {
    fn load(&mut self, _now_ms: i64) -> Result<StoredState> {
        let items = self.items.lock().map_err(|_| anyhow::anyhow!("memory backend poisoned"))?;
        let mut records: Vec<_> = items.iter().map(|(k, r)| (k.clone(), *r)).collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(StoredState { records, clock: self.clock, migrated: 0 })
    }

    fn save(&mut self, batch: &[(CommodityKey, StockRecord)], clock: i64) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("injected save failure");
        }
        let mut items = self.items.lock().map_err(|_| anyhow::anyhow!("memory backend poisoned"))?;
        for (key, record) in batch {
            items.insert(key.clone(), *record);
        }
        self.clock = self.clock.max(clock);
        Ok(())
    }
}
