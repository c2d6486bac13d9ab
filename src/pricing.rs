//! Continuous pricing.
//!
//! A transaction of `amount` units is priced by integrating the price curve
//! `P(s)` over the stock interval it sweeps, so bulk trades pay for the price
//! movement they cause instead of trading every unit at the spot price.
//!
//! The curve has three regions:
//!
//! - `s <= 0`: `P(s) = B * t * q^(-s)` (shortage amplification)
//! - `0 <= s <= L`: `P(s) = B * (1 - 0.5 * k * s / L)` (linear decay)
//! - `s >= L`: `P(s) = B * (1 - k)` (floor)
//!
//! where `t = (1 + hourly)^h` inflates prices the longer a commodity has
//! been in shortage.

use std::collections::HashMap;

use crate::commodity::CommodityKey;
use crate::config::PricingConfig;

const LN_EPSILON: f64 = 1e-12;

/// Everything the pricing curve needs to know about a commodity's stock.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StockView {
    pub stock: f64,
    /// Effective hours in shortage, including the currently running span.
    pub shortage_hours: f64,
}

#[derive(Debug, Clone)]
pub struct PriceParameters {
    pub settings: PricingConfig,
    base_prices: HashMap<CommodityKey, f64>,
}

impl PriceParameters {
    pub fn new(settings: PricingConfig, base_prices: HashMap<CommodityKey, f64>) -> Self {
        Self { settings, base_prices }
    }

    /// Base price, or `None` when the commodity is unknown or disabled
    /// (negative base price).
    pub fn base_price(&self, key: &CommodityKey) -> Option<f64> {
        self.base_prices.get(key).copied().filter(|b| *b >= 0.0)
    }

    /// Configured commodities, including disabled ones.
    pub fn commodities(&self) -> impl Iterator<Item = &CommodityKey> {
        self.base_prices.keys()
    }

    pub fn sell_tax(&self) -> f64 {
        self.settings.sell_tax_percent / 100.0
    }
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    params: PriceParameters,
}

impl PricingEngine {
    pub fn new(params: PriceParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PriceParameters {
        &self.params
    }

    /// Total cost of buying `amount` units: `∫ P(s) ds` over
    /// `[stock - amount, stock]`, clamped to the configured multiplier band.
    ///
    /// Returns `None` for untradeable commodities.
    pub fn total_buy_cost(&self, key: &CommodityKey, view: StockView, amount: f64) -> Option<f64> {
        let base = self.params.base_price(key)?;
        if amount <= 0.0 {
            return Some(0.0);
        }
        if !self.params.settings.dynamic_pricing {
            return Some(base * amount);
        }
        let total = self.curve(base, view).integrate(view.stock - amount, view.stock);
        Some(self.clamp(base, amount, total))
    }

    /// Total payout for selling `amount` units: `∫ P(s) ds` over
    /// `[stock, stock + amount]`, clamped, then taxed.
    pub fn total_sell_value(&self, key: &CommodityKey, view: StockView, amount: f64) -> Option<f64> {
        let base = self.params.base_price(key)?;
        if amount <= 0.0 {
            return Some(0.0);
        }
        let tax = self.params.sell_tax();
        if !self.params.settings.dynamic_pricing {
            return Some((base * amount * (1.0 - tax)).max(0.0));
        }
        let total = self.curve(base, view).integrate(view.stock, view.stock + amount);
        let clamped = self.clamp(base, amount, total);
        Some((clamped * (1.0 - tax)).max(0.0))
    }

    pub fn unit_buy_price(&self, key: &CommodityKey, view: StockView) -> Option<f64> {
        self.total_buy_cost(key, view, 1.0)
    }

    pub fn unit_sell_price(&self, key: &CommodityKey, view: StockView) -> Option<f64> {
        self.total_sell_value(key, view, 1.0)
    }

    fn clamp(&self, base: f64, amount: f64, total: f64) -> f64 {
        let s = &self.params.settings;
        let max_total = base * amount * s.max_price_multiplier;
        let min_total = base * amount * s.min_price_multiplier;
        min_total.max(total.min(max_total))
    }

    fn curve(&self, base: f64, view: StockView) -> Curve {
        let s = &self.params.settings;
        let inflation = if s.time_inflation {
            (1.0 + s.hourly_increase_percent / 100.0).powf(view.shortage_hours.max(0.0))
        } else {
            1.0
        };
        Curve {
            base,
            strength: s.curve_strength,
            ceiling: s.max_stock,
            q: 1.0 + s.negative_stock_percent / 100.0,
            inflation,
        }
    }
}

struct Curve {
    base: f64,
    strength: f64,
    ceiling: f64,
    q: f64,
    inflation: f64,
}

impl Curve {
    /// Sum of the overlaps of `[a, b]` with each region. Overlaps are only
    /// counted when `lo < hi` so boundary points never contribute twice.
    fn integrate(&self, a: f64, b: f64) -> f64 {
        let mut total = 0.0;

        let (neg_a, neg_b) = (a.min(0.0), b.min(0.0));
        if neg_a < neg_b {
            total += self.negative(neg_a, neg_b);
        }

        if self.ceiling > 0.0 {
            let (mid_a, mid_b) = (a.max(0.0), b.min(self.ceiling));
            if mid_a < mid_b {
                total += self.mid(mid_a, mid_b);
            }
        }

        let floor_start = self.ceiling.max(0.0);
        let (high_a, high_b) = (a.max(floor_start), b.max(floor_start));
        if high_a < high_b {
            total += self.high(high_a, high_b);
        }

        total
    }

    // ∫ B·t·q^(-s) ds = B·t·(q^(-a) - q^(-b)) / ln(q)
    fn negative(&self, a: f64, b: f64) -> f64 {
        let ln_q = if self.q > 0.0 { self.q.ln() } else { 0.0 };
        if ln_q.abs() < LN_EPSILON {
            // q == 1: the curve is flat at B·t
            return self.base * self.inflation * (b - a);
        }
        self.base * self.inflation * (self.q.powf(-a) - self.q.powf(-b)) / ln_q
    }

    // ∫ B(1 - 0.5k·s/L) ds = B[(b - a) - 0.5k(b² - a²)/(2L)]
    fn mid(&self, a: f64, b: f64) -> f64 {
        let span = b - a;
        let decay = 0.5 * self.strength * (b * b - a * a) / (2.0 * self.ceiling);
        self.base * (span - decay)
    }

    fn high(&self, a: f64, b: f64) -> f64 {
        self.base * (1.0 - self.strength) * (b - a)
    }
}
