//! Replay a bar series through the moving-average demo strategy.
//!
//! Usage:
//!   barsim-replay --bars bars.json [--config config.json] [--livesim]
//!
//! `bars.json` is an array of `{"open_ts", "open", "high", "low", "close"}`.
//! The run summary is printed as JSON; Ctrl-C aborts the run.

use anyhow::{anyhow, Context, Result};
use barsim_backtest::{Executor, MovingAverageCrossover, SimulationDriver};
use barsim_core::{Bar, BarSeries, Config, ErrorReporter, TracingReporter};
use barsim_streaming::StreamingAdapter;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "barsim-replay")]
#[command(about = "Replay historical bars as synthetic quotes through a strategy")]
struct Args {
    /// JSON file with the bars to replay
    #[arg(long)]
    bars: PathBuf,

    /// JSON configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Symbol of the series, overriding the configured one
    #[arg(long)]
    symbol: Option<String>,

    /// Pace quotes like a live feed
    #[arg(long)]
    livesim: bool,

    /// Fast moving-average window
    #[arg(long, default_value = "5")]
    fast: usize,

    /// Slow moving-average window
    #[arg(long, default_value = "20")]
    slow: usize,

    /// Order quantity
    #[arg(long, default_value = "1.0")]
    qty: f64,
}

fn load_bars(path: &PathBuf) -> Result<Vec<Bar>> {
    let json =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bars: Vec<Bar> =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
    Ok(bars)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(symbol) = args.symbol.clone() {
        config.instrument.symbol = symbol;
    }

    let bars = load_bars(&args.bars)?;
    info!(bars = bars.len(), file = %args.bars.display(), "bars loaded");
    let name = args
        .bars
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bars".to_string());
    let symbol = config.instrument.symbol.clone();
    let series = BarSeries::from_bars(name, symbol, config.instrument.scale, bars).into_shared();

    let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingReporter);
    let live_adapter = args.livesim.then(|| {
        let adapter = Arc::new(StreamingAdapter::new("live"));
        adapter.register_stream(&config.instrument.symbol, config.instrument.scale);
        adapter
    });
    let strategy = MovingAverageCrossover::new(args.fast, args.slow, args.qty)?;
    let executor = Executor::new(
        &config,
        series.clone(),
        Box::new(strategy),
        live_adapter,
        Handle::current(),
        reporter.clone(),
    );

    let driver = Arc::new(if args.livesim {
        SimulationDriver::livesim(config, executor, reporter)?
    } else {
        SimulationDriver::new(config, executor, reporter)?
    });

    let interrupt = {
        let driver = driver.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let timeout = driver.abort_timeout();
                let aborting =
                    tokio::task::spawn_blocking(move || driver.abort("interrupted", timeout));
                if let Ok(outcome) = aborting.await {
                    info!(%outcome, "interrupt handled");
                }
            }
        })
    };

    let handle = driver.spawn(series)?;
    let summary = tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| anyhow!("driver thread panicked"))??;
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
