//! Strategy executor: routes quotes and bars to the strategy and turns its
//! requests into orders.

use crate::broker::{Broker, FillListener, SimulatedBroker};
use crate::fill_model::{FillModel, FillModelConfig};
use crate::orders::{OrderProcessor, OrderRegistry};
use crate::position::{ClosedTrade, ExitReason, Position, PositionTracker};
use crate::sequencer::{OrderSequencer, SequencerUnlock};
use crate::strategy::{OrderRequest, Strategy, StrategyContext};
use anyhow::{bail, Context};
use barsim_core::{
    Bar, Config, ErrorReporter, Fill, Order, OrderId, OrderKind, OrderSide, OrderState,
    SharedSeries, Symbol, SyntheticQuote,
};
use barsim_streaming::StreamingAdapter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// Runs one strategy on one symbol.
pub struct Executor {
    symbol: Symbol,
    strategy_name: String,
    strategy: Mutex<Box<dyn Strategy>>,
    active_series: RwLock<SharedSeries>,
    registry: Arc<OrderRegistry>,
    broker: Arc<SimulatedBroker>,
    sequencer: Arc<OrderSequencer>,
    positions: Mutex<PositionTracker>,
    /// Why a pending exit order was placed.
    exit_reasons: Mutex<HashMap<OrderId, ExitReason>>,
    live_adapter: Option<Arc<StreamingAdapter>>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Feeds broker fills into the executor's position.
struct PositionListener {
    executor: Weak<Executor>,
}

impl FillListener for PositionListener {
    fn on_fill(&self, order: &Order, fill: &Fill) {
        if let Some(executor) = self.executor.upgrade() {
            executor.apply_fill(order.id, fill);
        }
    }
}

impl Executor {
    /// Build an executor with its own order registry, simulated broker and sequencer.
    ///
    /// `live_adapter` is the streaming adapter of the live data source, if the
    /// series has one; bar formation continues there after a replay.
    pub fn new(
        config: &Config,
        series: SharedSeries,
        strategy: Box<dyn Strategy>,
        live_adapter: Option<Arc<StreamingAdapter>>,
        runtime: Handle,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Arc<Self> {
        let symbol = series.read().symbol.clone();
        let strategy_name = strategy.name().to_string();
        let registry = Arc::new(OrderRegistry::new());
        let processor: Arc<dyn OrderProcessor> = registry.clone();
        let broker = Arc::new(SimulatedBroker::new(
            FillModel::new(FillModelConfig::from(config)),
            processor.clone(),
            reporter.clone(),
        ));
        let sequencer = Arc::new(OrderSequencer::new(
            processor,
            broker.clone(),
            runtime,
            config.sequencer.clone(),
            reporter.clone(),
        ));

        Arc::new_cyclic(|weak: &Weak<Executor>| {
            // Positions update before the sequencer releases reopening orders.
            broker.add_listener(Arc::new(PositionListener {
                executor: weak.clone(),
            }));
            broker.add_listener(Arc::new(SequencerUnlock::new(&sequencer)));

            Self {
                symbol,
                strategy_name,
                strategy: Mutex::new(strategy),
                active_series: RwLock::new(series),
                registry,
                broker,
                sequencer,
                positions: Mutex::new(PositionTracker::new()),
                exit_reasons: Mutex::new(HashMap::new()),
                live_adapter,
                reporter,
            }
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn registry(&self) -> &Arc<OrderRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<SimulatedBroker> {
        &self.broker
    }

    pub fn sequencer(&self) -> &Arc<OrderSequencer> {
        &self.sequencer
    }

    pub fn live_adapter(&self) -> Option<&Arc<StreamingAdapter>> {
        self.live_adapter.as_ref()
    }

    /// Series the strategy currently runs on.
    pub fn active_series(&self) -> SharedSeries {
        self.active_series.read().clone()
    }

    /// Replace the active series, returning the previous one.
    pub fn set_active_series(&self, series: SharedSeries) -> SharedSeries {
        std::mem::replace(&mut *self.active_series.write(), series)
    }

    pub fn open_position(&self) -> Option<Position> {
        self.positions.lock().position.clone()
    }

    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.positions.lock().trades.clone()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.positions.lock().total_pnl
    }

    /// Orders not yet filled or cancelled: working at the broker, in flight to
    /// it, or held by the sequencer.
    pub fn pending_orders(&self) -> Vec<Order> {
        let mut pending = self.broker.pending_orders(&self.symbol);
        pending.extend(self.registry.in_state(OrderState::Submitting));
        pending.extend(self.registry.in_state(OrderState::SubmittingSequenced));
        pending.sort_by_key(|o| o.id);
        pending
    }

    /// Cancel one pending order wherever it currently is.
    pub fn kill_order(&self, id: OrderId) -> anyhow::Result<()> {
        if self.broker.is_pending(id) {
            return Ok(self.broker.kill_order(id)?);
        }
        match self.registry.state(id) {
            Some(OrderState::SubmittingSequenced) => {
                self.sequencer.forget_dependent(id);
                self.registry.update_state_and_post_process(
                    id,
                    OrderState::Killed,
                    "killed while sequenced",
                )?;
            }
            Some(OrderState::Submitting) => {
                self.registry.update_state_and_post_process(
                    id,
                    OrderState::Killed,
                    "killed before reaching the broker",
                )?;
            }
            Some(state) => bail!("order {id} is [{state:?}], nothing to kill"),
            None => bail!("unknown order {id}"),
        }
        Ok(())
    }

    /// Flatten the open position against the last quote seen.
    ///
    /// Returns false if there was nothing to close.
    pub fn close_position_at_market(&self, reason: ExitReason) -> anyhow::Result<bool> {
        let Some(position) = self.open_position() else {
            return Ok(false);
        };
        let order = self
            .registry
            .create(self.symbol.clone(), position.exit_side(), OrderKind::Market, position.size);
        self.exit_reasons.lock().insert(order.id, reason);
        let id = order.id;
        self.broker
            .fill_at_last_quote(order)
            .with_context(|| {
                format!("closing {:?} {} at market with {id}", position.side, position.size)
            })?;
        Ok(true)
    }

    /// Replace a rejected locking close order with a fresh market order and
    /// resubmit it. Returns the replacement id.
    pub fn replace_rejected_close(&self, rejected: OrderId, qty: f64) -> anyhow::Result<OrderId> {
        let original = self
            .registry
            .get(rejected)
            .with_context(|| format!("unknown order {rejected}"))?;
        let replacement = self
            .registry
            .create(self.symbol.clone(), original.side, OrderKind::Market, qty);
        self.sequencer.replace_locking_order(rejected, replacement.id)?;
        {
            let mut reasons = self.exit_reasons.lock();
            if let Some(reason) = reasons.remove(&rejected) {
                reasons.insert(replacement.id, reason);
            }
        }
        let id = replacement.id;
        self.broker.submit_orders(vec![replacement])?;
        Ok(id)
    }

    fn apply_fill(&self, order_id: OrderId, fill: &Fill) {
        let reason = self
            .exit_reasons
            .lock()
            .remove(&order_id)
            .unwrap_or(ExitReason::Signal);
        if let Some(trade) = self.positions.lock().apply_fill(fill, reason) {
            tracing::info!(
                strategy = %self.strategy_name,
                side = ?trade.side,
                entry = trade.entry_price,
                exit = trade.exit_price,
                pnl = trade.pnl,
                reason = ?trade.exit_reason,
                "trade closed"
            );
        }
    }

    /// Deliver a quote: fill working orders first, then run the strategy.
    pub fn on_quote(&self, quote: &SyntheticQuote, forming: &Bar) -> anyhow::Result<()> {
        self.broker.on_quote(quote);
        let series = self.active_series();
        let mut ctx = StrategyContext::new(&series, self.open_position());
        self.strategy
            .lock()
            .on_quote(quote, forming, &mut ctx)
            .with_context(|| format!("{} on quote seq[{}]", self.strategy_name, quote.seq))?;
        self.process_requests(ctx.into_requests())
    }

    /// Deliver a completed bar.
    pub fn on_bar(&self, bar: &Bar) -> anyhow::Result<()> {
        let series = self.active_series();
        let mut ctx = StrategyContext::new(&series, self.open_position());
        self.strategy
            .lock()
            .on_bar(bar, &mut ctx)
            .with_context(|| format!("{} on bar #{}", self.strategy_name, bar.index))?;
        self.process_requests(ctx.into_requests())
    }

    fn submit(&self, side: OrderSide, kind: OrderKind, qty: f64) -> anyhow::Result<()> {
        let order = self.registry.create(self.symbol.clone(), side, kind, qty);
        self.broker.submit_orders(vec![order])?;
        Ok(())
    }

    fn process_requests(&self, requests: Vec<OrderRequest>) -> anyhow::Result<()> {
        for request in requests {
            match request {
                OrderRequest::Market { side, qty } => self.submit(side, OrderKind::Market, qty)?,
                OrderRequest::Limit { side, qty, price } => {
                    self.submit(side, OrderKind::Limit(price), qty)?
                }
                OrderRequest::Stop { side, qty, price } => {
                    self.submit(side, OrderKind::Stop(price), qty)?
                }
                OrderRequest::Reverse { side, qty } => self.reverse(side, qty)?,
                OrderRequest::ClosePosition => {
                    if let Some(position) = self.open_position() {
                        let order = self.registry.create(
                            self.symbol.clone(),
                            position.exit_side(),
                            OrderKind::Market,
                            position.size,
                        );
                        self.exit_reasons.lock().insert(order.id, ExitReason::Signal);
                        self.broker.submit_orders(vec![order])?;
                    }
                }
                OrderRequest::KillPending => {
                    for order in self.pending_orders() {
                        if let Err(e) = self.kill_order(order.id) {
                            self.reporter.warning(&format!("kill {}: {e:#}", order.id));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reverse(&self, side: OrderSide, qty: f64) -> anyhow::Result<()> {
        if !self.sequencer.is_empty() {
            tracing::debug!(
                strategy = %self.strategy_name,
                "reversal already in flight, request ignored"
            );
            return Ok(());
        }
        match self.open_position() {
            Some(position) if position.side.entry_side() == side => {
                tracing::debug!(
                    strategy = %self.strategy_name,
                    ?side,
                    "already positioned, reverse ignored"
                );
                Ok(())
            }
            Some(position) => {
                let close = self.registry.create(
                    self.symbol.clone(),
                    position.exit_side(),
                    OrderKind::Market,
                    position.size,
                );
                let open = self.registry.create(self.symbol.clone(), side, OrderKind::Market, qty);
                let open_id = open.id;
                if let Err(e) = self.sequencer.initialize_sequence(&[close.clone()], vec![open]) {
                    for id in [close.id, open_id] {
                        self.registry.update_state_and_post_process(
                            id,
                            OrderState::Killed,
                            "reversal not sequenced",
                        )?;
                    }
                    return Err(e).context("sequencing reversal");
                }
                self.exit_reasons.lock().insert(close.id, ExitReason::Flip);
                self.broker.submit_orders(vec![close])?;
                Ok(())
            }
            None => self.submit(side, OrderKind::Market, qty),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("symbol", &self.symbol)
            .field("strategy", &self.strategy_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsim_core::{BarSeries, CollectingReporter, ScaleInterval, Stroke};

    /// Replays a scripted list of requests, one batch per quote.
    struct Scripted {
        script: Vec<Vec<OrderRequest>>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_quote(
            &mut self,
            _q: &SyntheticQuote,
            _f: &Bar,
            ctx: &mut StrategyContext<'_>,
        ) -> anyhow::Result<()> {
            if !self.script.is_empty() {
                for request in self.script.remove(0) {
                    match request {
                        OrderRequest::Market { side, qty } if side == OrderSide::Buy => {
                            ctx.buy_at_market(qty)
                        }
                        OrderRequest::Market { qty, .. } => ctx.sell_at_market(qty),
                        OrderRequest::Reverse { side, qty } => ctx.reverse(side, qty),
                        OrderRequest::Limit { side, qty, price } => ctx.limit(side, qty, price),
                        OrderRequest::Stop { side, qty, price } => ctx.stop(side, qty, price),
                        OrderRequest::ClosePosition => ctx.close_position(),
                        OrderRequest::KillPending => ctx.kill_pending(),
                    }
                }
            }
            Ok(())
        }

        fn on_bar(&mut self, _bar: &Bar, _ctx: &mut StrategyContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn make_quote(seq: u64, price: f64) -> SyntheticQuote {
        SyntheticQuote {
            symbol: "ES".into(),
            ts_ms: seq as i64 * 1000,
            price,
            bid: price,
            ask: price,
            seq,
            bar_index: 0,
            stroke: Stroke::Open,
            injected_for_fill: false,
        }
    }

    fn make_executor(script: Vec<Vec<OrderRequest>>) -> Arc<Executor> {
        let series = BarSeries::new("live", "ES", ScaleInterval::minutes(1)).into_shared();
        Executor::new(
            &Config::default(),
            series,
            Box::new(Scripted { script }),
            None,
            Handle::current(),
            Arc::new(CollectingReporter::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_market_request_opens_position() {
        let executor = make_executor(vec![vec![OrderRequest::Market {
            side: OrderSide::Buy,
            qty: 2.0,
        }]]);
        let bar = Bar::new(0, 0, 100.0, 100.0, 100.0, 100.0);

        executor.on_quote(&make_quote(1, 100.0), &bar).unwrap();
        assert_eq!(executor.pending_orders().len(), 1);
        executor.on_quote(&make_quote(2, 101.0), &bar).unwrap();

        let position = executor.open_position().unwrap();
        assert!((position.entry_price - 101.0).abs() < 1e-10);
        assert!((position.size - 2.0).abs() < 1e-10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reverse_closes_then_opens() {
        let executor = make_executor(vec![
            vec![OrderRequest::Market {
                side: OrderSide::Buy,
                qty: 1.0,
            }],
            vec![],
            vec![OrderRequest::Reverse {
                side: OrderSide::Sell,
                qty: 1.0,
            }],
        ]);
        let bar = Bar::new(0, 0, 100.0, 100.0, 100.0, 100.0);

        executor.on_quote(&make_quote(1, 100.0), &bar).unwrap();
        executor.on_quote(&make_quote(2, 100.0), &bar).unwrap();
        executor.on_quote(&make_quote(3, 105.0), &bar).unwrap();
        assert!(!executor.sequencer().is_empty());
        assert_eq!(
            executor.registry().in_state(OrderState::SubmittingSequenced).len(),
            1
        );

        // Close fills, reopening is released and submitted after the delay.
        executor.on_quote(&make_quote(4, 110.0), &bar).unwrap();
        assert!(executor.sequencer().is_empty());
        assert!(executor.open_position().is_none());
        assert_eq!(executor.trades()[0].exit_reason, ExitReason::Flip);
        assert!((executor.realized_pnl() - 10.0).abs() < 1e-10);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        executor.on_quote(&make_quote(5, 111.0), &bar).unwrap();
        let position = executor.open_position().unwrap();
        assert_eq!(position.side, barsim_core::PositionSide::Short);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replaced_close_keeps_reopening_sequenced() {
        let executor = make_executor(vec![
            vec![OrderRequest::Market {
                side: OrderSide::Buy,
                qty: 1.0,
            }],
            vec![],
            vec![OrderRequest::Reverse {
                side: OrderSide::Sell,
                qty: 1.0,
            }],
        ]);
        let bar = Bar::new(0, 0, 100.0, 100.0, 100.0, 100.0);
        executor.on_quote(&make_quote(1, 100.0), &bar).unwrap();
        executor.on_quote(&make_quote(2, 100.0), &bar).unwrap();
        executor.on_quote(&make_quote(3, 105.0), &bar).unwrap();

        let close = executor.broker().pending_orders("ES")[0].id;
        executor.broker().kill_order(close).unwrap();
        let replacement = executor.replace_rejected_close(close, 1.0).unwrap();

        let locks = executor.sequencer().pending_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].locking.orders, vec![replacement]);
        assert!(executor.broker().is_pending(replacement));

        executor.on_quote(&make_quote(4, 110.0), &bar).unwrap();
        assert!(executor.sequencer().is_empty());
        assert_eq!(executor.trades()[0].exit_reason, ExitReason::Flip);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_pending_and_flatten() {
        let executor = make_executor(vec![
            vec![OrderRequest::Market {
                side: OrderSide::Buy,
                qty: 1.0,
            }],
            vec![OrderRequest::Limit {
                side: OrderSide::Buy,
                qty: 1.0,
                price: 50.0,
            }],
        ]);
        let bar = Bar::new(0, 0, 100.0, 100.0, 100.0, 100.0);
        executor.on_quote(&make_quote(1, 100.0), &bar).unwrap();
        executor.on_quote(&make_quote(2, 100.0), &bar).unwrap();

        let pending = executor.pending_orders();
        assert_eq!(pending.len(), 1);
        executor.kill_order(pending[0].id).unwrap();
        assert!(executor.kill_order(pending[0].id).is_err());

        assert!(executor.close_position_at_market(ExitReason::BacktestEnded).unwrap());
        assert!(executor.open_position().is_none());
        assert!(!executor.close_position_at_market(ExitReason::BacktestEnded).unwrap());
        assert_eq!(executor.trades()[0].exit_reason, ExitReason::BacktestEnded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_strategy_error_is_returned() {
        let executor = make_executor(vec![]);
        let bar = Bar::new(3, 0, 1.0, 1.0, 1.0, 1.0);
        let err = executor.on_bar(&bar).unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(format!("{err:#}").contains("bar #3"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_active_series_returns_previous() {
        let executor = make_executor(vec![]);
        let shadow = BarSeries::new("shadow", "ES", ScaleInterval::minutes(1)).into_shared();
        let previous = executor.set_active_series(shadow);
        assert_eq!(previous.read().name, "live");
        assert_eq!(executor.active_series().read().name, "shadow");
    }
}
