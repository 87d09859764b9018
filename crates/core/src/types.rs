//! Core data types for the simulation core.

use chrono::{Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Size/quantity type.
pub type Size = f64;

/// Instrument symbol.
pub type Symbol = String;

/// Render a timestamp for log lines.
pub fn ts_to_rfc3339(ts_ms: TimestampMs) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts_ms.to_string())
}

/// Unit of a bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarScale {
    Second,
    Minute,
    Hour,
    Day,
}

/// Bar scale plus multiplier, e.g. 5-Minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleInterval {
    pub scale: BarScale,
    pub interval: u32,
}

impl ScaleInterval {
    pub fn new(scale: BarScale, interval: u32) -> Self {
        Self { scale, interval }
    }

    pub fn minutes(interval: u32) -> Self {
        Self::new(BarScale::Minute, interval)
    }

    /// Length of one bar.
    pub fn duration(&self) -> Duration {
        let n = i64::from(self.interval);
        match self.scale {
            BarScale::Second => Duration::seconds(n),
            BarScale::Minute => Duration::minutes(n),
            BarScale::Hour => Duration::hours(n),
            BarScale::Day => Duration::days(n),
        }
    }

    /// Length of one bar in milliseconds (at least 1).
    #[inline]
    pub fn duration_ms(&self) -> i64 {
        self.duration().num_milliseconds().max(1)
    }

    /// Floor a timestamp to the opening boundary of its bar.
    #[inline]
    pub fn floor(&self, ts_ms: TimestampMs) -> TimestampMs {
        let d = self.duration_ms();
        ts_ms.div_euclid(d) * d
    }
}

impl Default for ScaleInterval {
    fn default() -> Self {
        Self::minutes(1)
    }
}

impl fmt::Display for ScaleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:?}", self.interval, self.scale)
    }
}

/// Immutable OHLC bar. Identity is its index in the owning series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Opening boundary timestamp (ms).
    pub open_ts: TimestampMs,
    /// Open price. NaN marks a bar that is still forming.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Position in the owning series.
    #[serde(default)]
    pub index: usize,
}

impl Bar {
    pub fn new(
        index: usize,
        open_ts: TimestampMs,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Self {
        Self {
            open_ts,
            open,
            high,
            low,
            close,
            index,
        }
    }

    /// Up bar: close at or above open.
    #[inline]
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }

    /// High equals low; only open and close are meaningful strokes.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.high == self.low
    }

    /// A streaming bar whose open has not been set yet.
    #[inline]
    pub fn is_forming(&self) -> bool {
        self.open.is_nan()
    }

    #[inline]
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Ordered, append-only sequence of bars for one symbol and scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    /// Human-readable name, e.g. the data source it came from.
    pub name: String,
    pub symbol: Symbol,
    pub scale: ScaleInterval,
    bars: Vec<Bar>,
}

/// Series shared between the driver, the consumers and the strategy.
pub type SharedSeries = Arc<RwLock<BarSeries>>;

impl BarSeries {
    pub fn new(name: impl Into<String>, symbol: impl Into<Symbol>, scale: ScaleInterval) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            scale,
            bars: Vec::new(),
        }
    }

    /// Build a series from bars, re-indexing them by position.
    pub fn from_bars(
        name: impl Into<String>,
        symbol: impl Into<Symbol>,
        scale: ScaleInterval,
        bars: Vec<Bar>,
    ) -> Self {
        let mut series = Self::new(name, symbol, scale);
        for bar in bars {
            series.push(bar);
        }
        series
    }

    /// Same symbol and scale, zero bars.
    pub fn clone_without_bars(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.symbol.clone(), self.scale)
    }

    /// Append a bar, assigning its index. Returns the index.
    pub fn push(&mut self, mut bar: Bar) -> usize {
        let index = self.bars.len();
        bar.index = index;
        self.bars.push(bar);
        index
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn into_shared(self) -> SharedSeries {
        Arc::new(RwLock::new(self))
    }
}

impl fmt::Display for BarSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]x{}", self.name, self.symbol, self.scale, self.bars.len())
    }
}

/// Which of the bar's price points a quote stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stroke {
    Open,
    Low,
    High,
    Close,
}

/// A simulated bid/ask tick derived from a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticQuote {
    pub symbol: Symbol,
    /// Timestamp in milliseconds.
    pub ts_ms: TimestampMs,
    /// Price point this quote stands for.
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    /// Sequence number per symbol, starts at 1.
    pub seq: u64,
    /// Index of the source bar in the original series.
    pub bar_index: usize,
    pub stroke: Stroke,
    /// Spliced in ahead of a stroke to give a pending order its trigger price.
    pub injected_for_fill: bool,
}

impl SyntheticQuote {
    #[inline]
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    #[inline]
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Order identifier; allocation order is submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buy, -1 for sell.
    pub fn sign(self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit(f64),
    Stop(f64),
}

impl OrderKind {
    pub fn trigger_price(&self) -> Option<f64> {
        match *self {
            OrderKind::Market => None,
            OrderKind::Limit(px) | OrderKind::Stop(px) => Some(px),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Created, not yet handed to a broker.
    Pending,
    /// Held back until its locking close orders fill.
    SubmittingSequenced,
    Submitting,
    /// Working at the broker.
    Submitted,
    Filled,
    Rejected,
    Killed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Rejected | OrderState::Killed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: Size,
    pub state: OrderState,
}

impl Order {
    pub fn new(
        id: OrderId,
        symbol: impl Into<Symbol>,
        side: OrderSide,
        kind: OrderKind,
        qty: Size,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            side,
            kind,
            qty,
            state: OrderState::Pending,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {} {} {:?} [{:?}]",
            self.id, self.side, self.qty, self.symbol, self.kind, self.state
        )
    }
}

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Get sign: +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Order side that opens a position on this side.
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

/// Fill information for a simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    /// Timestamp of fill.
    pub ts_ms: TimestampMs,
    /// Fill price.
    pub price: f64,
    /// Fill size (positive).
    pub size: Size,
    pub side: OrderSide,
    /// Sequence number of the quote that filled it.
    pub quote_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_floor() {
        let scale = ScaleInterval::minutes(1);
        // 2024-01-01 00:01:30.500 -> 2024-01-01 00:01:00.000
        assert_eq!(scale.floor(1704067290500), 1704067260000);

        let five = ScaleInterval::minutes(5);
        assert_eq!(five.duration_ms(), 300_000);
        assert_eq!(five.floor(299_999), 0);
        assert_eq!(five.floor(300_000), 300_000);
    }

    #[test]
    fn test_bar_direction() {
        let up = Bar::new(0, 0, 100.0, 102.0, 99.0, 101.0);
        let down = Bar::new(0, 0, 101.0, 102.0, 99.0, 100.0);
        let flat = Bar::new(0, 0, 100.0, 100.0, 100.0, 100.0);

        assert!(up.is_up());
        assert!(!down.is_up());
        assert!(flat.is_up());
        assert!(flat.is_degenerate());
        assert!(!up.is_degenerate());
    }

    #[test]
    fn test_forming_bar() {
        let bar = Bar::new(0, 0, f64::NAN, 0.0, 0.0, 0.0);
        assert!(bar.is_forming());
    }

    #[test]
    fn test_series_push_reindexes() {
        let mut series = BarSeries::new("test", "AAPL", ScaleInterval::minutes(1));
        series.push(Bar::new(42, 0, 1.0, 1.0, 1.0, 1.0));
        series.push(Bar::new(42, 60_000, 1.0, 1.0, 1.0, 1.0));

        assert_eq!(series.len(), 2);
        assert_eq!(series.get(0).map(|b| b.index), Some(0));
        assert_eq!(series.last().map(|b| b.index), Some(1));
    }

    #[test]
    fn test_clone_without_bars() {
        let series = BarSeries::from_bars(
            "orig",
            "AAPL",
            ScaleInterval::minutes(5),
            vec![Bar::new(0, 0, 1.0, 2.0, 0.5, 1.5)],
        );
        let shadow = series.clone_without_bars("shadow");

        assert!(shadow.is_empty());
        assert_eq!(shadow.symbol, "AAPL");
        assert_eq!(shadow.scale, ScaleInterval::minutes(5));
        assert_eq!(shadow.name, "shadow");
    }

    #[test]
    fn test_order_trigger_price() {
        assert_eq!(OrderKind::Market.trigger_price(), None);
        assert_eq!(OrderKind::Limit(99.5).trigger_price(), Some(99.5));
        assert_eq!(OrderKind::Stop(101.0).trigger_price(), Some(101.0));
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn test_quote_mid() {
        let quote = SyntheticQuote {
            symbol: "AAPL".into(),
            ts_ms: 0,
            price: 100.0,
            bid: 99.5,
            ask: 100.5,
            seq: 1,
            bar_index: 0,
            stroke: Stroke::Open,
            injected_for_fill: false,
        };
        assert!((quote.mid() - 100.0).abs() < 1e-10);
        assert!((quote.spread() - 1.0).abs() < 1e-10);
    }
}
