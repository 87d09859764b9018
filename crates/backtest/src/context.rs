//! Context swap: run the strategy on an empty shadow series during a replay.
//!
//! `swap_in` hides the original series behind an empty clone fed by the
//! replay's own streaming adapter. `swap_out` restores the original and hands
//! the replay's forming bar to the live adapter so a live stream can continue
//! where the replay stopped.

use crate::control::RunControl;
use crate::executor::Executor;
use crate::spread::SpreadModel;
use barsim_core::{
    Bar, Error, Invariants, Result, ScaleInterval, SharedSeries, Symbol, SyntheticQuote,
};
use barsim_streaming::{QuoteBarConsumer, StreamingAdapter};
use std::sync::Arc;

/// Scoped synthetic data source around the shadow series.
#[derive(Debug, Clone)]
pub struct BacktestDataSource {
    pub symbol: Symbol,
    pub scale: ScaleInterval,
    pub shadow: SharedSeries,
    pub spread: Arc<dyn SpreadModel>,
    pub adapter: Arc<StreamingAdapter>,
}

/// Grows the shadow series and forwards the feed to the executor.
pub struct BacktestConsumer {
    name: String,
    shadow: SharedSeries,
    executor: Arc<Executor>,
    control: Arc<RunControl>,
}

impl QuoteBarConsumer for BacktestConsumer {
    fn consume_quote(&self, quote: &SyntheticQuote, forming: &Bar) {
        if let Err(e) = self.executor.on_quote(quote, forming) {
            self.control.record_fault(&format!("quote seq[{}]", quote.seq), &e);
        }
    }

    fn consume_bar(&self, bar: &Bar) {
        let appended = {
            let mut shadow = self.shadow.write();
            let index = shadow.push(*bar);
            shadow.get(index).copied()
        };
        let Some(appended) = appended else {
            return;
        };
        if let Err(e) = self.executor.on_bar(&appended) {
            self.control.record_fault(&format!("bar #{}", appended.index), &e);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Swapped-in state of one replay.
#[derive(Debug, Default)]
pub struct ContextSwap {
    original: Option<SharedSeries>,
    source: Option<BacktestDataSource>,
    consumer_name: String,
}

impl ContextSwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `swap_in` and `swap_out`.
    pub fn is_in_progress(&self) -> bool {
        self.original.is_some()
    }

    pub fn original(&self) -> Option<&SharedSeries> {
        self.original.as_ref()
    }

    pub fn data_source(&self) -> Option<&BacktestDataSource> {
        self.source.as_ref()
    }

    pub fn swap_in(
        &mut self,
        executor: &Arc<Executor>,
        original: SharedSeries,
        spread: Arc<dyn SpreadModel>,
        control: Arc<RunControl>,
        invariants: &Invariants,
    ) -> Result<BacktestDataSource> {
        invariants.check(!self.is_in_progress(), || {
            "swap_in while a previous replay is still swapped in".to_string()
        })?;

        let (shadow, symbol, scale) = {
            let series = original.read();
            invariants.check(!series.is_empty(), || {
                format!("original series {series} has no bars")
            })?;
            let shadow = series.clone_without_bars(format!("{}:backtest", series.name));
            (shadow, series.symbol.clone(), series.scale)
        };
        let shadow = shadow.into_shared();

        let adapter = Arc::new(StreamingAdapter::new(format!("backtest:{symbol}")));
        adapter.register_stream(&symbol, scale);

        let consumer_name = format!("{}:{}", executor.strategy_name(), executor.symbol());
        let consumer = Arc::new(BacktestConsumer {
            name: consumer_name.clone(),
            shadow: shadow.clone(),
            executor: executor.clone(),
            control,
        });
        adapter.distributor().subscribe_quote(&symbol, scale, consumer.clone());
        adapter.distributor().subscribe_bar(&symbol, scale, consumer);

        executor.set_active_series(shadow.clone());

        let checked = invariants
            .check(shadow.read().is_empty(), || "shadow series not empty after clone".to_string())
            .and_then(|()| {
                invariants.check(executor.active_series().read().is_empty(), || {
                    "executor's active series not empty after swap in".to_string()
                })
            });
        if let Err(e) = checked {
            executor.set_active_series(original);
            return Err(e);
        }

        let source = BacktestDataSource {
            symbol,
            scale,
            shadow,
            spread,
            adapter,
        };
        tracing::info!(
            symbol = %source.symbol,
            scale = %source.scale,
            bars = original.read().len(),
            "context swapped in"
        );
        self.original = Some(original);
        self.source = Some(source.clone());
        self.consumer_name = consumer_name;
        Ok(source)
    }

    pub fn swap_out(&mut self, executor: &Executor) -> Result<()> {
        let (Some(original), Some(source)) = (self.original.take(), self.source.take()) else {
            return Err(Error::Other("no replay context to swap out".to_string()));
        };

        let distributor = source.adapter.distributor();
        distributor.unsubscribe_quote(&source.symbol, source.scale, &self.consumer_name);
        distributor.unsubscribe_bar(&source.symbol, source.scale, &self.consumer_name);

        if let Some(live) = executor.live_adapter() {
            live.absorb_bar_factory_from(&source.adapter, &source.symbol, source.scale);
        }

        executor.set_active_series(original);
        tracing::info!(
            symbol = %source.symbol,
            shadow_bars = source.shadow.read().len(),
            "context swapped out"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spread::PercentageSpread;
    use crate::strategy::{Strategy, StrategyContext};
    use barsim_core::{BarSeries, CollectingReporter, Config, Severity, Stroke};
    use tokio::runtime::Handle;

    struct Idle;

    impl Strategy for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn on_bar(&mut self, _bar: &Bar, _ctx: &mut StrategyContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn make_original(n: usize) -> SharedSeries {
        let bars = (0..n)
            .map(|i| Bar::new(i, i as i64 * 60_000, 100.0, 101.0, 99.0, 100.5))
            .collect();
        BarSeries::from_bars("live", "ES", ScaleInterval::minutes(1), bars).into_shared()
    }

    fn make_quote(seq: u64, ts_ms: i64) -> SyntheticQuote {
        SyntheticQuote {
            symbol: "ES".into(),
            ts_ms,
            price: 100.0,
            bid: 99.9,
            ask: 100.1,
            seq,
            bar_index: 0,
            stroke: Stroke::Open,
            injected_for_fill: false,
        }
    }

    fn make_executor(
        original: &SharedSeries,
        live: Option<Arc<StreamingAdapter>>,
    ) -> Arc<Executor> {
        Executor::new(
            &Config::default(),
            original.clone(),
            Box::new(Idle),
            live,
            Handle::current(),
            Arc::new(CollectingReporter::new()),
        )
    }

    fn make_control(reporter: Arc<CollectingReporter>) -> Arc<RunControl> {
        Arc::new(RunControl::new(10, true, reporter))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_swap_in_and_out() {
        let original = make_original(3);
        let live = Arc::new(StreamingAdapter::new("live"));
        let executor = make_executor(&original, Some(live.clone()));
        let reporter = Arc::new(CollectingReporter::new());
        let invariants = Invariants::new(true, reporter.clone());

        let mut swap = ContextSwap::new();
        let source = swap
            .swap_in(
                &executor,
                original.clone(),
                Arc::new(PercentageSpread::default()),
                make_control(reporter.clone()),
                &invariants,
            )
            .unwrap();

        assert!(swap.is_in_progress());
        assert!(executor.active_series().read().is_empty());
        assert_eq!(executor.active_series().read().symbol, "ES");

        // Two bars' worth of quotes: the first bar lands in the shadow series.
        source.adapter.push_quote(&make_quote(1, 0));
        source.adapter.push_quote(&make_quote(2, 60_000));
        assert_eq!(source.shadow.read().len(), 1);

        swap.swap_out(&executor).unwrap();
        assert!(!swap.is_in_progress());
        assert_eq!(executor.active_series().read().len(), 3);
        assert_eq!(source.adapter.distributor().consumer_count(), 0);
        // Forming bar handed to the live adapter.
        let forming = live.forming_bar("ES", ScaleInterval::minutes(1));
        assert_eq!(forming.map(|b| b.open_ts), Some(60_000));
        assert_eq!(reporter.count(Severity::Error), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lenient_check_reports_empty_original() {
        let original = make_original(0);
        let executor = make_executor(&original, None);
        let reporter = Arc::new(CollectingReporter::new());
        let invariants = Invariants::new(false, reporter.clone());

        let mut swap = ContextSwap::new();
        let result = swap.swap_in(
            &executor,
            original,
            Arc::new(PercentageSpread::default()),
            make_control(reporter.clone()),
            &invariants,
        );
        assert!(result.is_ok());
        assert_eq!(reporter.count(Severity::Warning), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_swap_out_without_swap_in() {
        let original = make_original(1);
        let executor = make_executor(&original, None);
        let mut swap = ContextSwap::new();
        assert!(swap.swap_out(&executor).is_err());
    }
}
