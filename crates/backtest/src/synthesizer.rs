//! Quote synthesizer: turns historical bars into synthetic quotes.
//!
//! Each bar is decomposed into strokes: an up bar (close >= open) travels
//! open, low, high, close; a down bar travels open, high, low, close; a bar
//! with high == low yields only open and close. Every stroke price is widened
//! into bid/ask by the spread model.
//!
//! Sequence numbers are per symbol and strictly increasing without gaps.
//! [`QuoteSynthesizer::synthesize`] hands out provisional numbers without
//! consuming them. Quotes injected for pending orders always take fresh
//! numbers, and [`QuoteSynthesizer::commit`] renumbers a stroke quote only
//! when an injected quote already consumed its provisional number.
//!
//! The last committed price carries over between bars, so the gap from one
//! bar's close to the next bar's open is scanned for fills like any stroke.

use crate::fill_model::FillModel;
use crate::spread::{widen, SpreadModel};
use barsim_core::{Bar, Order, ScaleInterval, Stroke, Symbol, SyntheticQuote};
use ordered_float::OrderedFloat;
use std::sync::Arc;

/// Quotes a non-degenerate bar produces.
pub const QUOTES_PER_BAR: usize = 4;

/// Stroke prices of a bar in emission order.
pub fn strokes(bar: &Bar) -> Vec<(Stroke, f64)> {
    if bar.is_degenerate() {
        return vec![(Stroke::Open, bar.open), (Stroke::Close, bar.close)];
    }
    if bar.is_up() {
        vec![
            (Stroke::Open, bar.open),
            (Stroke::Low, bar.low),
            (Stroke::High, bar.high),
            (Stroke::Close, bar.close),
        ]
    } else {
        vec![
            (Stroke::Open, bar.open),
            (Stroke::High, bar.high),
            (Stroke::Low, bar.low),
            (Stroke::Close, bar.close),
        ]
    }
}

/// Synthesizes quotes for one symbol.
#[derive(Debug)]
pub struct QuoteSynthesizer {
    symbol: Symbol,
    scale: ScaleInterval,
    spread: Arc<dyn SpreadModel>,
    /// Last sequence number handed downstream.
    last_seq: u64,
    /// Price of the last committed stroke quote.
    last_price: Option<f64>,
}

impl QuoteSynthesizer {
    pub fn new(
        symbol: impl Into<Symbol>,
        scale: ScaleInterval,
        spread: Arc<dyn SpreadModel>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            scale,
            spread,
            last_seq: 0,
            last_price: None,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn spread_model(&self) -> &Arc<dyn SpreadModel> {
        &self.spread
    }

    /// Stroke quotes of `bar` with provisional sequence numbers.
    ///
    /// A bar whose open is NaN is still forming and yields nothing.
    pub fn synthesize(&self, bar: &Bar) -> Vec<SyntheticQuote> {
        if bar.is_forming() {
            tracing::warn!(
                symbol = %self.symbol,
                index = bar.index,
                "forming bar skipped by synthesizer"
            );
            return Vec::new();
        }

        let half = self.spread.half_spread(bar);
        let strokes = strokes(bar);
        let n = strokes.len() as i64;
        let duration = self.scale.duration_ms();

        strokes
            .into_iter()
            .enumerate()
            .map(|(i, (stroke, price))| {
                let (bid, ask) = widen(price, half);
                SyntheticQuote {
                    symbol: self.symbol.clone(),
                    ts_ms: bar.open_ts + i as i64 * duration / n,
                    price,
                    bid,
                    ask,
                    seq: self.last_seq + 1 + i as u64,
                    bar_index: bar.index,
                    stroke,
                    injected_for_fill: false,
                }
            })
            .collect()
    }

    /// Quotes at the trigger price of every pending order crossed on the way
    /// from the last committed price (exclusive) to `target.price` (inclusive).
    /// Nothing is injected before the first committed quote.
    ///
    /// Quotes come in order of travel, ties by order id. Each one consumes a
    /// fresh sequence number and carries the target's timestamp and stroke.
    pub fn inject_fill_quotes(
        &mut self,
        target: &SyntheticQuote,
        bar: &Bar,
        pending: &[Order],
    ) -> Vec<SyntheticQuote> {
        let Some(from) = self.last_price else {
            return Vec::new();
        };
        let to = target.price;

        let mut crossed: Vec<&Order> = pending
            .iter()
            .filter(|o| o.symbol == self.symbol && FillModel::is_crossed(o, from, to))
            .collect();
        if crossed.is_empty() {
            return Vec::new();
        }

        crossed.sort_by_key(|o| o.id);
        let rising = to > from;
        crossed.sort_by_key(|o| {
            let trigger = o.kind.trigger_price().unwrap_or(to);
            OrderedFloat(if rising { trigger } else { -trigger })
        });

        let half = self.spread.half_spread(bar);
        crossed
            .into_iter()
            .filter_map(|order| {
                let trigger = order.kind.trigger_price()?;
                let (bid, ask) = FillModel::touching_quote(order, trigger, half);
                self.last_seq += 1;
                tracing::debug!(
                    symbol = %self.symbol,
                    order = %order.id,
                    trigger,
                    seq = self.last_seq,
                    "fill quote injected"
                );
                Some(SyntheticQuote {
                    symbol: self.symbol.clone(),
                    ts_ms: target.ts_ms,
                    price: trigger,
                    bid,
                    ask,
                    seq: self.last_seq,
                    bar_index: target.bar_index,
                    stroke: target.stroke,
                    injected_for_fill: true,
                })
            })
            .collect()
    }

    /// Assign the target its final sequence number and consume it.
    ///
    /// Returns true if the provisional number had been consumed by an
    /// injected quote and the target was renumbered.
    pub fn commit(&mut self, target: &mut SyntheticQuote) -> bool {
        let next = self.last_seq + 1;
        let renumbered = target.seq != next;
        target.seq = next;
        self.last_seq = next;
        self.last_price = Some(target.price);
        renumbered
    }
}
