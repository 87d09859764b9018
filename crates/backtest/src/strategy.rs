//! Strategy callback surface.
//!
//! Strategies see quotes and completed bars of the active series and answer
//! with order requests collected on a [`StrategyContext`].

use crate::position::Position;
use barsim_core::{Bar, OrderSide, SharedSeries, Size, SyntheticQuote};

/// What a strategy asks the executor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderRequest {
    Market { side: OrderSide, qty: Size },
    Limit { side: OrderSide, qty: Size, price: f64 },
    Stop { side: OrderSide, qty: Size, price: f64 },
    /// End up on `side` with `qty`: any opposite position is closed first and
    /// the opening order is held until that close fills.
    Reverse { side: OrderSide, qty: Size },
    /// Flatten the current position at market.
    ClosePosition,
    /// Cancel every working order.
    KillPending,
}

/// View handed to strategy callbacks.
pub struct StrategyContext<'a> {
    series: &'a SharedSeries,
    position: Option<Position>,
    requests: Vec<OrderRequest>,
}

impl<'a> StrategyContext<'a> {
    pub fn new(series: &'a SharedSeries, position: Option<Position>) -> Self {
        Self {
            series,
            position,
            requests: Vec::new(),
        }
    }

    /// Series the strategy is running on; the shadow series during a replay.
    pub fn series(&self) -> &SharedSeries {
        self.series
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn buy_at_market(&mut self, qty: Size) {
        self.requests.push(OrderRequest::Market {
            side: OrderSide::Buy,
            qty,
        });
    }

    pub fn sell_at_market(&mut self, qty: Size) {
        self.requests.push(OrderRequest::Market {
            side: OrderSide::Sell,
            qty,
        });
    }

    pub fn limit(&mut self, side: OrderSide, qty: Size, price: f64) {
        self.requests.push(OrderRequest::Limit { side, qty, price });
    }

    pub fn stop(&mut self, side: OrderSide, qty: Size, price: f64) {
        self.requests.push(OrderRequest::Stop { side, qty, price });
    }

    pub fn reverse(&mut self, side: OrderSide, qty: Size) {
        self.requests.push(OrderRequest::Reverse { side, qty });
    }

    pub fn close_position(&mut self) {
        self.requests.push(OrderRequest::ClosePosition);
    }

    pub fn kill_pending(&mut self) {
        self.requests.push(OrderRequest::KillPending);
    }

    pub fn into_requests(self) -> Vec<OrderRequest> {
        self.requests
    }
}

/// Trading logic driven by the executor.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Every quote, with the bar it is forming.
    fn on_quote(
        &mut self,
        _quote: &SyntheticQuote,
        _forming: &Bar,
        _ctx: &mut StrategyContext<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Every completed bar, already appended to the active series.
    fn on_bar(&mut self, bar: &Bar, ctx: &mut StrategyContext<'_>) -> anyhow::Result<()>;
}

/// Moving-average crossover: long when the fast average is above the slow one,
/// short when below. Flips with close-then-open sequencing.
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    fast: usize,
    slow: usize,
    qty: Size,
    /// Sign of (fast - slow) at the previous bar.
    last_sign: Option<bool>,
}

impl MovingAverageCrossover {
    pub fn new(fast: usize, slow: usize, qty: Size) -> anyhow::Result<Self> {
        anyhow::ensure!(fast > 0 && fast < slow, "need 0 < fast[{fast}] < slow[{slow}]");
        anyhow::ensure!(qty > 0.0, "qty must be positive, got {qty}");
        Ok(Self {
            fast,
            slow,
            qty,
            last_sign: None,
        })
    }
}

fn average_close(bars: &[Bar]) -> f64 {
    bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64
}

impl Strategy for MovingAverageCrossover {
    fn name(&self) -> &str {
        "ma-crossover"
    }

    fn on_bar(&mut self, _bar: &Bar, ctx: &mut StrategyContext<'_>) -> anyhow::Result<()> {
        let (fast, slow) = {
            let series = ctx.series().read();
            let bars = series.bars();
            if bars.len() < self.slow {
                return Ok(());
            }
            (
                average_close(&bars[bars.len() - self.fast..]),
                average_close(&bars[bars.len() - self.slow..]),
            )
        };

        let above = fast > slow;
        if self.last_sign.replace(above) == Some(above) {
            return Ok(());
        }

        let side = if above { OrderSide::Buy } else { OrderSide::Sell };
        let already = ctx
            .position()
            .is_some_and(|p| p.side.entry_side() == side);
        if !already {
            tracing::debug!(fast, slow, ?side, "moving averages crossed");
            ctx.reverse(side, self.qty);
        }
        Ok(())
    }
}
