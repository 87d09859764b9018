//! Simulation driver: replays a bar series through the strategy.
//!
//! A run is `start` (context swap in), `simulate` (bar loop on the calling
//! thread) and `finish` (cleanup, swap out, lifecycle events). The loop only
//! checks the abort-requested gate between bars; `abort` is the one call that
//! blocks, waiting a bounded time for the loop to confirm.
//!
//! A driver built with [`SimulationDriver::livesim`] is nested: it paces quotes
//! like a live feed, leaves orders and positions alone at the end and never
//! aborts itself on strategy faults.

use crate::context::{BacktestDataSource, ContextSwap};
use crate::control::{AbortOutcome, RunControl, SimulationRunState};
use crate::events::{EventGenerator, RunSummary, SimulationEvent};
use crate::executor::Executor;
use crate::livesim::LivesimPacer;
use crate::metrics::TradeStats;
use crate::position::ExitReason;
use crate::spread::{spread_model_from_config, SpreadModel};
use crate::synthesizer::{QuoteSynthesizer, QUOTES_PER_BAR};
use barsim_core::{
    ts_to_rfc3339, Config, Error, ErrorReporter, Invariants, Result, SharedSeries, SyntheticQuote,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often `abort` re-checks whether the run ended on its own.
const ABORT_POLL: Duration = Duration::from_millis(10);

/// Bars per progress notification.
pub fn chunk_size(bars_total: usize, progress_chunks: usize) -> usize {
    bars_total.div_ceil(progress_chunks.max(1)).max(1)
}

/// Drives one executor through replays of bar series.
pub struct SimulationDriver {
    config: Config,
    executor: Arc<Executor>,
    spread: Arc<dyn SpreadModel>,
    invariants: Invariants,
    reporter: Arc<dyn ErrorReporter>,
    control: Arc<RunControl>,
    events: EventGenerator,
    context: Mutex<ContextSwap>,
    pacer: Option<LivesimPacer>,
    bars_total: AtomicUsize,
    bars_simulated: AtomicUsize,
    quotes_generated: AtomicUsize,
    quotes_injected: AtomicUsize,
    /// Set once the bar loop has returned, for whatever reason.
    loop_done: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl SimulationDriver {
    /// Backtest driver: bars as fast as possible, forced cleanup at the end.
    pub fn new(
        config: Config,
        executor: Arc<Executor>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        Self::build(config, executor, reporter, None)
    }

    /// Nested livesim driver paced by `config.livesim`.
    pub fn livesim(
        config: Config,
        executor: Arc<Executor>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let pacer = LivesimPacer::new(config.livesim.clone());
        Self::build(config, executor, reporter, Some(pacer))
    }

    /// Livesim driver with an explicit pacer, e.g. a seeded one.
    pub fn livesim_with_pacer(
        config: Config,
        executor: Arc<Executor>,
        reporter: Arc<dyn ErrorReporter>,
        pacer: LivesimPacer,
    ) -> Result<Self> {
        Self::build(config, executor, reporter, Some(pacer))
    }

    fn build(
        config: Config,
        executor: Arc<Executor>,
        reporter: Arc<dyn ErrorReporter>,
        pacer: Option<LivesimPacer>,
    ) -> Result<Self> {
        config.validate()?;
        let spread = spread_model_from_config(&config.spread, reporter.as_ref());
        let invariants = Invariants::new(config.diagnostics.strict_invariants, reporter.clone());
        let control = Arc::new(RunControl::new(
            config.backtest.exceptions_limit,
            pacer.is_none(),
            reporter.clone(),
        ));
        Ok(Self {
            config,
            executor,
            spread,
            invariants,
            reporter,
            control,
            events: EventGenerator::new(),
            context: Mutex::new(ContextSwap::new()),
            pacer,
            bars_total: AtomicUsize::new(0),
            bars_simulated: AtomicUsize::new(0),
            quotes_generated: AtomicUsize::new(0),
            quotes_injected: AtomicUsize::new(0),
            loop_done: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    pub fn pacer(&self) -> Option<&LivesimPacer> {
        self.pacer.as_ref()
    }

    pub fn is_nested(&self) -> bool {
        self.pacer.is_some()
    }

    pub fn state(&self) -> SimulationRunState {
        self.control.state()
    }

    pub fn subscribe_events(&self) -> Receiver<SimulationEvent> {
        self.events.subscribe()
    }

    pub fn quotes_per_bar(&self) -> usize {
        QUOTES_PER_BAR
    }

    pub fn bars_total(&self) -> usize {
        self.bars_total.load(Ordering::SeqCst)
    }

    pub fn bars_simulated(&self) -> usize {
        self.bars_simulated.load(Ordering::SeqCst)
    }

    /// Stroke quotes pushed, not counting injected fill quotes.
    pub fn quotes_generated(&self) -> usize {
        self.quotes_generated.load(Ordering::SeqCst)
    }

    pub fn quotes_injected(&self) -> usize {
        self.quotes_injected.load(Ordering::SeqCst)
    }

    pub fn exceptions(&self) -> usize {
        self.control.exceptions()
    }

    pub fn progress_stats(&self) -> String {
        format!(
            "{}/{} bars, {} quotes (+{} injected), {} exceptions",
            self.bars_simulated(),
            self.bars_total(),
            self.quotes_generated(),
            self.quotes_injected(),
            self.exceptions()
        )
    }

    /// Configured wait for [`abort`](Self::abort).
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.config.backtest.abort_timeout_ms)
    }

    /// Swap in `original` and open the running gate.
    pub fn start(&self, original: SharedSeries) -> Result<()> {
        if self.control.running.is_open() {
            return Err(Error::Other(format!(
                "{} is already running: {}",
                self.executor.strategy_name(),
                self.progress_stats()
            )));
        }
        let (bars_total, symbol, span) = {
            let series = original.read();
            let (Some(first), Some(last)) = (series.bars().first(), series.last()) else {
                return Err(Error::empty_bars(series.to_string()));
            };
            let span = format!("{}..{}", ts_to_rfc3339(first.open_ts), ts_to_rfc3339(last.open_ts));
            (series.len(), series.symbol.clone(), span)
        };

        self.context.lock().swap_in(
            &self.executor,
            original,
            self.spread.clone(),
            self.control.clone(),
            &self.invariants,
        )?;

        self.bars_total.store(bars_total, Ordering::SeqCst);
        self.bars_simulated.store(0, Ordering::SeqCst);
        self.quotes_generated.store(0, Ordering::SeqCst);
        self.quotes_injected.store(0, Ordering::SeqCst);
        self.loop_done.store(false, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());
        self.control.begin();

        tracing::info!(
            %symbol,
            bars_total,
            %span,
            strategy = %self.executor.strategy_name(),
            nested = self.is_nested(),
            "simulation started"
        );
        self.events
            .raise(SimulationEvent::ContextInitialized { symbol, bars_total });
        Ok(())
    }

    /// Replay every bar but the last one, which the live feed owns.
    pub fn simulate(&self) -> Result<()> {
        let replayed = self.replay_bars();
        self.loop_done.store(true, Ordering::SeqCst);
        replayed
    }

    fn replay_bars(&self) -> Result<()> {
        let (source, original) = {
            let context = self.context.lock();
            match (context.data_source().cloned(), context.original().cloned()) {
                (Some(source), Some(original)) => (source, original),
                _ => return Err(Error::Other("simulate called before start".to_string())),
            }
        };
        let bars = original.read().bars().to_vec();
        let total = bars.len();
        let chunk = chunk_size(total, self.config.backtest.progress_chunks);
        let mut synth =
            QuoteSynthesizer::new(source.symbol.clone(), source.scale, source.spread.clone());

        for (i, bar) in bars.iter().take(total.saturating_sub(1)).enumerate() {
            if self.control.abort_requested.is_open() {
                self.control.mark_aborted_by_user();
                tracing::info!(
                    bar = i,
                    stats = %self.progress_stats(),
                    "abort honoured between bars"
                );
                break;
            }

            let strokes = synth.synthesize(bar);
            if strokes.is_empty() {
                continue;
            }

            for mut target in strokes {
                let pending = self.executor.broker().pending_orders(&source.symbol);
                let injected = synth.inject_fill_quotes(&target, bar, &pending);
                for quote in &injected {
                    if !self.deliver(&source, quote) {
                        self.control.mark_aborted_by_user();
                        return Ok(());
                    }
                    self.quotes_injected.fetch_add(1, Ordering::SeqCst);
                }

                if synth.commit(&mut target) {
                    tracing::trace!(seq = target.seq, "stroke quote renumbered after injection");
                }
                if !self.deliver(&source, &target) {
                    self.control.mark_aborted_by_user();
                    return Ok(());
                }
                self.quotes_generated.fetch_add(1, Ordering::SeqCst);
            }

            let simulated = self.bars_simulated.fetch_add(1, Ordering::SeqCst) + 1;
            if (i + 1) % chunk == 0 {
                tracing::debug!(stats = %self.progress_stats(), "chunk simulated");
                self.events.raise(SimulationEvent::ChunkSimulated {
                    bars_simulated: simulated,
                    bars_total: total,
                    quotes_generated: self.quotes_generated(),
                });
            }
        }
        Ok(())
    }

    /// Push one quote into the shadow feed. False means a livesim pause was
    /// ended by an abort request.
    fn deliver(&self, source: &BacktestDataSource, quote: &SyntheticQuote) -> bool {
        if let Some(pacer) = &self.pacer {
            if !pacer.wait_if_paused(&self.control) {
                return false;
            }
        }
        source.adapter.push_quote(quote);
        if let Some(pacer) = &self.pacer {
            pacer.pace();
        }
        true
    }

    /// Clean up, swap out and raise the closing events.
    pub fn finish(&self) -> Result<RunSummary> {
        if !self.is_nested() {
            self.kill_pending_orders();
            match self.executor.close_position_at_market(ExitReason::BacktestEnded) {
                Ok(true) => tracing::info!(
                    symbol = %self.executor.symbol(),
                    "open position closed at backtest end"
                ),
                Ok(false) => {}
                Err(e) => {
                    let cause: &(dyn std::error::Error + 'static) = e.as_ref();
                    self.reporter.error("closing position at backtest end", Some(cause));
                }
            }
        }

        if let Err(e) = self.context.lock().swap_out(&self.executor) {
            self.reporter.error("swapping out replay context", Some(&e));
        }
        let summary = self.summary();
        let aborted = self.control.aborted_by_user();
        if aborted {
            self.control.aborted.open();
        }
        // A request that arrived after the last bar is void.
        self.control.abort_requested.close();
        self.control.running.close();

        if aborted {
            let reason = summary.abort_reason.clone().unwrap_or_default();
            tracing::warn!(%reason, stats = %self.progress_stats(), "simulation aborted");
            self.events.raise(SimulationEvent::Aborted { reason });
        } else {
            tracing::info!(
                stats = %self.progress_stats(),
                pnl = summary.realized_pnl,
                "simulation finished"
            );
        }
        self.events.raise(SimulationEvent::Finished(summary.clone()));
        Ok(summary)
    }

    fn kill_pending_orders(&self) {
        for order in self.executor.pending_orders() {
            if let Err(e) = self.executor.kill_order(order.id) {
                let cause: &(dyn std::error::Error + 'static) = e.as_ref();
                self.reporter.error(&format!("killing {order} at backtest end"), Some(cause));
            }
        }
    }

    fn summary(&self) -> RunSummary {
        let aborted = self.control.aborted_by_user();
        let trades = self.executor.trades();
        let started_at = *self.started_at.lock();
        let elapsed_ms = started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
        RunSummary {
            symbol: self.executor.symbol().to_string(),
            strategy: self.executor.strategy_name().to_string(),
            bars_total: self.bars_total(),
            bars_simulated: self.bars_simulated(),
            quotes_generated: self.quotes_generated(),
            quotes_injected: self.quotes_injected(),
            exceptions: self.exceptions(),
            aborted,
            abort_reason: if aborted { self.control.abort_reason() } else { None },
            trades: trades.len(),
            realized_pnl: self.executor.realized_pnl(),
            stats: TradeStats::from_trades(&trades),
            elapsed_ms,
        }
    }

    /// The loop returned without honouring an abort request.
    fn completed_without_abort(&self) -> bool {
        !self.control.aborted_by_user()
            && (self.loop_done.load(Ordering::SeqCst) || !self.control.running.is_open())
    }

    /// Ask the loop to stop and wait up to `timeout` for it to confirm.
    ///
    /// A run whose loop already ended on its own is reported as completed
    /// instead of waiting out the timeout.
    pub fn abort(&self, reason: &str, timeout: Duration) -> AbortOutcome {
        if !self.control.running.is_open() {
            return AbortOutcome::NotRunning;
        }
        if self.completed_without_abort() {
            let outcome = AbortOutcome::Completed {
                reason: reason.to_string(),
            };
            self.reporter.info(&outcome.to_string());
            return outcome;
        }

        self.control.request_abort(reason);
        let reason = self.control.abort_reason().unwrap_or_else(|| reason.to_string());
        let deadline = Instant::now() + timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.control.aborted.wait_until_open(remaining.min(ABORT_POLL)) {
                break AbortOutcome::Aborted { reason };
            }
            if self.completed_without_abort() {
                break AbortOutcome::Completed { reason };
            }
            if remaining <= ABORT_POLL {
                break AbortOutcome::TimedOut {
                    reason,
                    timeout_ms: timeout.as_millis() as u64,
                };
            }
        };
        match &outcome {
            AbortOutcome::TimedOut { .. } => self.reporter.warning(&outcome.to_string()),
            _ => self.reporter.info(&outcome.to_string()),
        }
        outcome
    }

    /// start, simulate, finish. `finish` runs even if the loop failed.
    pub fn run(&self, original: SharedSeries) -> Result<RunSummary> {
        self.start(original)?;
        let simulated = self.simulate();
        let summary = self.finish();
        simulated?;
        summary
    }

    /// Run on a named background thread.
    pub fn spawn(
        self: &Arc<Self>,
        original: SharedSeries,
    ) -> std::io::Result<JoinHandle<Result<RunSummary>>> {
        let driver = self.clone();
        thread::Builder::new()
            .name(format!("backtest:{}", self.executor.symbol()))
            .spawn(move || driver.run(original))
    }
}

impl std::fmt::Debug for SimulationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationDriver")
            .field("executor", &self.executor)
            .field("state", &self.state())
            .field("nested", &self.is_nested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{Strategy, StrategyContext};
    use barsim_core::{Bar, BarSeries, CollectingReporter, ScaleInterval};
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

    fn make_series(n: usize) -> SharedSeries {
        let bars = (0..n)
            .map(|i| {
                let base = 100.0 + i as f64;
                Bar::new(i, i as i64 * 60_000, base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        BarSeries::from_bars("live", "ES", ScaleInterval::minutes(1), bars).into_shared()
    }

    fn make_driver(series: &SharedSeries) -> SimulationDriver {
        let reporter: Arc<dyn ErrorReporter> = Arc::new(CollectingReporter::new());
        let executor = Executor::new(
            &Config::default(),
            series.clone(),
            Box::new(Idle),
            None,
            Handle::current(),
            reporter.clone(),
        );
        SimulationDriver::new(Config::default(), executor, reporter).unwrap()
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(10, 20), 1);
        assert_eq!(chunk_size(100, 20), 5);
        assert_eq!(chunk_size(101, 20), 6);
        assert_eq!(chunk_size(0, 20), 1);
        assert_eq!(chunk_size(7, 0), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_series_never_starts() {
        let empty = BarSeries::new("live", "ES", ScaleInterval::minutes(1)).into_shared();
        let driver = make_driver(&empty);
        let err = driver.run(empty).unwrap_err();
        assert!(matches!(err, Error::EmptyBars(_)));
        assert_eq!(driver.state(), SimulationRunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_when_idle_is_noop() {
        let series = make_series(3);
        let driver = make_driver(&series);
        let outcome = driver.abort("user", Duration::from_millis(10));
        assert_eq!(outcome, AbortOutcome::NotRunning);
        assert!(!driver.control().abort_requested.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_counts_and_restores_series() {
        let series = make_series(5);
        let driver = make_driver(&series);
        let summary = driver.run(series.clone()).unwrap();

        assert_eq!(summary.bars_total, 5);
        assert_eq!(summary.bars_simulated, 4);
        assert_eq!(summary.quotes_generated, 4 * driver.quotes_per_bar());
        assert_eq!(summary.quotes_injected, 0);
        assert!(!summary.aborted);
        assert!(Arc::ptr_eq(&driver.executor().active_series(), &series));
        assert_eq!(driver.state(), SimulationRunState::Idle);
        assert_eq!(driver.progress_stats(), "4/5 bars, 16 quotes (+0 injected), 0 exceptions");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_is_rejected() {
        let series = make_series(3);
        let driver = make_driver(&series);
        driver.start(series.clone()).unwrap();
        assert!(driver.start(series).is_err());
        driver.finish().unwrap();
        assert_eq!(driver.state(), SimulationRunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_after_loop_reports_completed_run() {
        let series = make_series(5);
        let driver = make_driver(&series);
        driver.start(series).unwrap();
        driver.simulate().unwrap();

        let asked = Instant::now();
        let outcome = driver.abort("too late", Duration::from_secs(5));
        assert_eq!(outcome, AbortOutcome::Completed { reason: "too late".into() });
        assert!(asked.elapsed() < Duration::from_secs(1));
        assert!(!driver.control().abort_requested.is_open());

        let summary = driver.finish().unwrap();
        assert!(!summary.aborted);
        assert_eq!(summary.bars_simulated, 4);
        assert_eq!(driver.state(), SimulationRunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finish_closes_late_abort_request() {
        let series = make_series(5);
        let driver = make_driver(&series);
        driver.start(series).unwrap();
        driver.simulate().unwrap();
        driver.control().request_abort("after the last bar");

        let summary = driver.finish().unwrap();
        assert!(!summary.aborted);
        assert!(summary.abort_reason.is_none());
        assert!(!driver.control().abort_requested.is_open());
        assert!(!driver.control().aborted.is_open());
        assert_eq!(driver.state(), SimulationRunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_requested_before_loop_stops_at_first_bar() {
        let series = make_series(5);
        let driver = make_driver(&series);
        let events = driver.subscribe_events();

        driver.start(series).unwrap();
        driver.control().request_abort("stop now");
        driver.simulate().unwrap();
        let summary = driver.finish().unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.bars_simulated, 0);
        assert_eq!(summary.abort_reason.as_deref(), Some("stop now"));
        assert_eq!(driver.state(), SimulationRunState::Aborted);

        let received: Vec<SimulationEvent> = events.try_iter().collect();
        assert!(matches!(received[0], SimulationEvent::ContextInitialized { .. }));
        assert_eq!(received[1], SimulationEvent::Aborted { reason: "stop now".into() });
        assert!(matches!(received[2], SimulationEvent::Finished(_)));
    }
}
