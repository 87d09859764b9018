//! Streaming bar formation from quotes.
//!
//! Builds bars of one symbol and scale from a stream of quotes. A quote whose
//! timestamp floors past the forming bar's boundary completes that bar.

use barsim_core::{Bar, ScaleInterval, Symbol, SyntheticQuote, TimestampMs};

/// Outcome of absorbing one quote.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsorbResult {
    /// Bar completed by this quote, if it crossed a boundary.
    pub completed: Option<Bar>,
    /// Bar currently forming, including this quote.
    pub forming: Bar,
}

/// A bar that's currently being built.
#[derive(Debug, Clone)]
struct BarInProgress {
    open_ts: TimestampMs,
    index: usize,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    quote_count: u32,
}

impl BarInProgress {
    fn new(open_ts: TimestampMs, index: usize, price: f64) -> Self {
        Self {
            open_ts,
            index,
            open: price,
            high: price,
            low: price,
            close: price,
            quote_count: 1,
        }
    }

    fn add_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.quote_count += 1;
    }

    fn to_bar(&self) -> Bar {
        Bar::new(self.index, self.open_ts, self.open, self.high, self.low, self.close)
    }
}

/// Forms bars of one symbol and scale from quotes.
#[derive(Debug, Clone)]
pub struct StreamingBarFactory {
    symbol: Symbol,
    scale: ScaleInterval,
    /// Bar being built.
    forming: Option<BarInProgress>,
    /// Most recently completed bar.
    last_completed: Option<Bar>,
    /// Bars completed so far; index of the next bar.
    completed_count: usize,
}

impl StreamingBarFactory {
    /// Create an empty factory.
    pub fn new(symbol: impl Into<Symbol>, scale: ScaleInterval) -> Self {
        Self {
            symbol: symbol.into(),
            scale,
            forming: None,
            last_completed: None,
            completed_count: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn scale(&self) -> ScaleInterval {
        self.scale
    }

    /// Absorb a quote into the forming bar.
    ///
    /// Quotes timestamped before the forming bar's boundary are folded into
    /// the forming bar rather than reopening a completed one.
    pub fn absorb_quote(&mut self, quote: &SyntheticQuote) -> AbsorbResult {
        let boundary = self.scale.floor(quote.ts_ms);
        let price = quote.price;

        let completed = match self.forming.as_mut() {
            Some(bar) if boundary <= bar.open_ts => {
                bar.add_price(price);
                None
            }
            Some(bar) => {
                let done = bar.to_bar();
                tracing::trace!(
                    symbol = %self.symbol,
                    index = done.index,
                    quotes = bar.quote_count,
                    "bar completed"
                );
                self.completed_count += 1;
                self.last_completed = Some(done);
                self.forming = Some(BarInProgress::new(boundary, self.completed_count, price));
                Some(done)
            }
            None => {
                self.forming = Some(BarInProgress::new(boundary, self.completed_count, price));
                None
            }
        };

        let forming = self
            .forming
            .as_ref()
            .map(BarInProgress::to_bar)
            .unwrap_or_else(|| {
                Bar::new(self.completed_count, boundary, price, price, price, price)
            });

        AbsorbResult { completed, forming }
    }

    /// The bar currently forming, if any quote has arrived.
    pub fn forming(&self) -> Option<Bar> {
        self.forming.as_ref().map(BarInProgress::to_bar)
    }

    pub fn last_completed(&self) -> Option<&Bar> {
        self.last_completed.as_ref()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    /// Force completion of the forming bar, e.g. at end of data.
    pub fn force_complete(&mut self) -> Option<Bar> {
        let bar = self.forming.take()?.to_bar();
        self.completed_count += 1;
        self.last_completed = Some(bar);
        Some(bar)
    }
}
