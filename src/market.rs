//! Market facade: the read/write surface consumed by shop front-ends.

use std::sync::{Arc, RwLock};

use serde_json::json;

use crate::commodity::CommodityKey;
use crate::logging::{log, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::pricing::{PriceParameters, PricingEngine};
use crate::stock::{StockRecord, StockStore};

/// Anything rendering market data that must redraw when a commodity changes.
pub trait Refresh: Send + Sync {
    fn refresh(&self, key: &CommodityKey);
}

pub struct Market {
    engine: RwLock<PricingEngine>,
    store: Arc<StockStore>,
    consumers: RwLock<Vec<Box<dyn Refresh>>>,
}

impl Market {
    pub fn new(params: PriceParameters, store: Arc<StockStore>) -> Self {
        Self {
            engine: RwLock::new(PricingEngine::new(params)),
            store,
            consumers: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<StockStore> {
        &self.store
    }

    fn engine(&self) -> std::sync::RwLockReadGuard<'_, PricingEngine> {
        self.engine.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in new parameters. Existing stock state is untouched; configured
    /// commodities without a record get one.
    pub fn reload_parameters(&self, params: PriceParameters) {
        for key in params.commodities() {
            self.store.touch(key);
        }
        let tracked = params.commodities().count();
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = PricingEngine::new(params);
        log(Level::Info, Domain::Pricing, "parameters_reloaded", obj(&[("commodities", json!(tracked))]));
    }

    pub fn price_buy(&self, key: &CommodityKey, qty: f64) -> Option<f64> {
        let view = self.store.get(key).view(ts_epoch_ms());
        self.engine().total_buy_cost(key, view, qty)
    }

    pub fn price_sell(&self, key: &CommodityKey, qty: f64) -> Option<f64> {
        let view = self.store.get(key).view(ts_epoch_ms());
        self.engine().total_sell_value(key, view, qty)
    }

    pub fn base_price(&self, key: &CommodityKey) -> Option<f64> {
        self.engine().params().base_price(key)
    }

    pub fn is_tradeable(&self, key: &CommodityKey) -> bool {
        self.base_price(key).is_some()
    }

    pub fn current_stock(&self, key: &CommodityKey) -> f64 {
        self.store.get(key).stock
    }

    pub fn can_buy(&self, key: &CommodityKey) -> bool {
        if !self.is_tradeable(key) {
            return false;
        }
        if self.restricted() {
            let stock = self.current_stock(key);
            if stock <= 0.0 {
                log(
                    Level::Info,
                    Domain::Pricing,
                    "buy_blocked",
                    obj(&[("commodity", v_str(key.as_str())), ("stock", v_num(stock))]),
                );
                return false;
            }
        }
        true
    }

    /// How much of `requested` may actually be bought. Only limited when
    /// buying into shortage is disabled.
    pub fn max_buyable(&self, key: &CommodityKey, requested: f64) -> f64 {
        if !self.restricted() {
            return requested;
        }
        let available = self.current_stock(key).floor().max(0.0);
        requested.min(available)
    }

    pub fn apply_purchase(&self, key: &CommodityKey, qty: f64) -> StockRecord {
        let record = self.store.apply_delta(key, -qty);
        self.notify(key);
        record
    }

    pub fn apply_sale(&self, key: &CommodityKey, qty: f64) -> StockRecord {
        let record = self.store.apply_delta(key, qty);
        self.notify(key);
        record
    }

    pub fn register_consumer(&self, consumer: Box<dyn Refresh>) {
        self.consumers.write().unwrap_or_else(|e| e.into_inner()).push(consumer);
    }

    /// Tell every registered consumer that `key` changed.
    pub fn notify(&self, key: &CommodityKey) {
        for consumer in self.consumers.read().unwrap_or_else(|e| e.into_inner()).iter() {
            consumer.refresh(key);
        }
    }

    /// Value of all positive stock at base price.
    pub fn total_stock_value(&self) -> f64 {
        let engine = self.engine();
        self.store
            .snapshot()
            .iter()
            .filter_map(|(key, r)| engine.params().base_price(key).map(|b| b * r.stock.max(0.0)))
            .sum()
    }

    pub fn total_purchases_value(&self) -> f64 {
        let engine = self.engine();
        self.store
            .snapshot()
            .iter()
            .filter_map(|(key, r)| engine.params().base_price(key).map(|b| b * r.purchases))
            .sum()
    }

    /// Tradeable commodities in the current price table.
    pub fn tracked_commodities(&self) -> Vec<CommodityKey> {
        let engine = self.engine();
        let params = engine.params();
        let mut keys: Vec<_> = params.commodities().filter(|k| params.base_price(k).is_some()).cloned().collect();
        keys.sort();
        keys
    }

    fn restricted(&self) -> bool {
        self.engine().params().settings.restrict_buy_at_zero
    }
}
