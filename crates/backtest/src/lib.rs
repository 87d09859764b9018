//! Bar-by-bar backtest and livesim engine.
//!
//! This crate provides:
//! - Quote synthesis from historical bars, with fill quotes injected for
//!   pending orders
//! - A simulated broker with bid/ask fill modeling
//! - Close-then-open order sequencing
//! - Context swap of the strategy's series during a replay
//! - The simulation driver with abort, progress and lifecycle events

pub mod broker;
pub mod context;
pub mod control;
pub mod driver;
pub mod events;
pub mod executor;
pub mod fill_model;
pub mod livesim;
pub mod metrics;
pub mod orders;
pub mod position;
pub mod sequencer;
pub mod spread;
pub mod strategy;
pub mod synthesizer;

pub use broker::{Broker, FillListener, SimulatedBroker};
pub use context::{BacktestDataSource, ContextSwap};
pub use control::{AbortOutcome, RunControl, SimulationRunState};
pub use driver::SimulationDriver;
pub use events::{EventGenerator, RunSummary, SimulationEvent};
pub use executor::Executor;
pub use fill_model::FillModel;
pub use livesim::LivesimPacer;
pub use metrics::TradeStats;
pub use orders::{OrderProcessor, OrderRegistry};
pub use position::PositionTracker;
pub use sequencer::{GroupId, OrderSequencer};
pub use spread::{FixedSpread, PercentageSpread, SpreadModel};
pub use strategy::{MovingAverageCrossover, OrderRequest, Strategy, StrategyContext};
pub use synthesizer::QuoteSynthesizer;
