//! Fill model for simulated execution.
//!
//! Fills orders against synthetic bid/ask quotes: buys at the ask, sells at
//! the bid, with slippage on market and stop fills.

use barsim_core::{Config, Fill, Order, OrderKind, OrderSide, SyntheticQuote};

/// Configuration for the fill model.
#[derive(Debug, Clone)]
pub struct FillModelConfig {
    /// Slippage in ticks for market and stop fills.
    pub slippage_ticks: u32,
    /// Tick size.
    pub tick_size: f64,
}

impl Default for FillModelConfig {
    fn default() -> Self {
        Self {
            slippage_ticks: 0,
            tick_size: 0.1,
        }
    }
}

impl From<&Config> for FillModelConfig {
    fn from(config: &Config) -> Self {
        Self {
            slippage_ticks: config.backtest.slippage_ticks,
            tick_size: config.instrument.tick_size,
        }
    }
}

/// Fill model for simulating order execution.
#[derive(Debug, Clone)]
pub struct FillModel {
    config: FillModelConfig,
}

impl FillModel {
    /// Create a new fill model.
    pub fn new(config: FillModelConfig) -> Self {
        Self { config }
    }

    #[inline]
    fn slippage(&self) -> f64 {
        f64::from(self.config.slippage_ticks) * self.config.tick_size
    }

    fn make_fill(order: &Order, quote: &SyntheticQuote, price: f64) -> Fill {
        Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            ts_ms: quote.ts_ms,
            price,
            size: order.qty,
            side: order.side,
            quote_seq: quote.seq,
        }
    }

    /// Simulate a market buy fill.
    pub fn market_buy(&self, order: &Order, quote: &SyntheticQuote) -> Fill {
        Self::make_fill(order, quote, quote.ask + self.slippage())
    }

    /// Simulate a market sell fill.
    pub fn market_sell(&self, order: &Order, quote: &SyntheticQuote) -> Fill {
        Self::make_fill(order, quote, quote.bid - self.slippage())
    }

    /// Simulate a limit buy fill (if possible).
    ///
    /// Returns None if the limit price is not hit.
    pub fn limit_buy(
        &self,
        order: &Order,
        limit_price: f64,
        quote: &SyntheticQuote,
    ) -> Option<Fill> {
        // Fill if ask <= limit price
        (quote.ask <= limit_price)
            .then(|| Self::make_fill(order, quote, limit_price.min(quote.ask)))
    }

    /// Simulate a limit sell fill (if possible).
    ///
    /// Returns None if the limit price is not hit.
    pub fn limit_sell(
        &self,
        order: &Order,
        limit_price: f64,
        quote: &SyntheticQuote,
    ) -> Option<Fill> {
        // Fill if bid >= limit price
        (quote.bid >= limit_price)
            .then(|| Self::make_fill(order, quote, limit_price.max(quote.bid)))
    }

    /// Simulate a stop buy: triggers once the ask reaches the stop.
    pub fn stop_buy(&self, order: &Order, stop_price: f64, quote: &SyntheticQuote) -> Option<Fill> {
        (quote.ask >= stop_price)
            .then(|| Self::make_fill(order, quote, quote.ask + self.slippage()))
    }

    /// Simulate a stop sell: triggers once the bid reaches the stop.
    pub fn stop_sell(
        &self,
        order: &Order,
        stop_price: f64,
        quote: &SyntheticQuote,
    ) -> Option<Fill> {
        (quote.bid <= stop_price)
            .then(|| Self::make_fill(order, quote, quote.bid - self.slippage()))
    }

    /// Fill `order` against `quote` if its conditions are met.
    pub fn try_fill(&self, order: &Order, quote: &SyntheticQuote) -> Option<Fill> {
        match (order.kind, order.side) {
            (OrderKind::Market, OrderSide::Buy) => Some(self.market_buy(order, quote)),
            (OrderKind::Market, OrderSide::Sell) => Some(self.market_sell(order, quote)),
            (OrderKind::Limit(px), OrderSide::Buy) => self.limit_buy(order, px, quote),
            (OrderKind::Limit(px), OrderSide::Sell) => self.limit_sell(order, px, quote),
            (OrderKind::Stop(px), OrderSide::Buy) => self.stop_buy(order, px, quote),
            (OrderKind::Stop(px), OrderSide::Sell) => self.stop_sell(order, px, quote),
        }
    }

    /// Whether price travel from `from` (exclusive) to `to` (inclusive) reaches
    /// the order's trigger in the direction that triggers it.
    ///
    /// Limit buys and stop sells trigger on the way down; limit sells and stop
    /// buys on the way up. Market orders are never crossed.
    pub fn is_crossed(order: &Order, from: f64, to: f64) -> bool {
        let Some(trigger) = order.kind.trigger_price() else {
            return false;
        };
        let down = to <= trigger && trigger < from;
        let up = from < trigger && trigger <= to;
        match (order.kind, order.side) {
            (OrderKind::Limit(_), OrderSide::Buy) | (OrderKind::Stop(_), OrderSide::Sell) => down,
            (OrderKind::Limit(_), OrderSide::Sell) | (OrderKind::Stop(_), OrderSide::Buy) => up,
            (OrderKind::Market, _) => false,
        }
    }

    /// Bid and ask for a quote injected at `trigger` so the side `order`
    /// trades against touches the trigger exactly.
    pub fn touching_quote(order: &Order, trigger: f64, half_spread: f64) -> (f64, f64) {
        match order.side {
            OrderSide::Buy => (trigger - 2.0 * half_spread, trigger),
            OrderSide::Sell => (trigger, trigger + 2.0 * half_spread),
        }
    }
}

impl Default for FillModel {
    fn default() -> Self {
        Self::new(FillModelConfig::default())
    }
}
