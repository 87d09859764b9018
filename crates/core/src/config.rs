//! Configuration structures for the simulation core.

use crate::error::{Error, Result};
use crate::types::ScaleInterval;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a simulation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instrument configuration.
    pub instrument: InstrumentConfig,
    /// Spread model selection.
    pub spread: SpreadConfig,
    /// Bar-by-bar backtest configuration.
    pub backtest: BacktestConfig,
    /// Close-then-open sequencing.
    pub sequencer: SequencerConfig,
    /// Livesim pacing.
    pub livesim: LivesimConfig,
    /// Invariant checking.
    pub diagnostics: DiagnosticsConfig,
}

impl Config {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the simulation cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.instrument.symbol.is_empty() {
            return Err(Error::config("instrument.symbol must not be empty"));
        }
        if self.instrument.scale.interval == 0 {
            return Err(Error::config("instrument.scale.interval must be positive"));
        }
        if self.spread.percent.is_nan() || self.spread.percent < 0.0 {
            return Err(Error::config(format!(
                "spread.percent must be non-negative, got {}",
                self.spread.percent
            )));
        }
        if self.spread.fixed_half_spread.is_nan() || self.spread.fixed_half_spread < 0.0 {
            return Err(Error::config("spread.fixed_half_spread must be non-negative"));
        }
        if self.backtest.progress_chunks == 0 {
            return Err(Error::config("backtest.progress_chunks must be positive"));
        }
        if self.livesim.delay_max_ms > 0 && self.livesim.delay_min_ms > self.livesim.delay_max_ms {
            return Err(Error::config(format!(
                "livesim.delay_min_ms[{}] > livesim.delay_max_ms[{}]",
                self.livesim.delay_min_ms, self.livesim.delay_max_ms
            )));
        }
        Ok(())
    }
}

/// Instrument-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Trading symbol.
    pub symbol: String,
    /// Bar scale of the replayed series.
    pub scale: ScaleInterval,
    /// Tick size (minimum price increment).
    pub tick_size: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            scale: ScaleInterval::minutes(1),
            tick_size: 0.1,
        }
    }
}

/// Spread model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadConfig {
    /// Model name ("percentage" or "fixed").
    pub model: String,
    /// Full spread as percent of the bar close (percentage model).
    pub percent: f64,
    /// Half-spread in price units (fixed model).
    pub fixed_half_spread: f64,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            model: "percentage".to_string(),
            percent: 0.01,
            fixed_half_spread: 0.0,
        }
    }
}

/// Bar-by-bar backtest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Strategy faults tolerated before the run aborts itself.
    pub exceptions_limit: usize,
    /// Roughly how many progress notifications a run raises.
    pub progress_chunks: usize,
    /// How long `abort` waits for confirmation (ms).
    pub abort_timeout_ms: u64,
    /// Slippage in ticks applied to market fills.
    pub slippage_ticks: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            exceptions_limit: 10,
            progress_chunks: 20,
            abort_timeout_ms: 1000,
            slippage_ticks: 0,
        }
    }
}

/// Close-then-open sequencing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Delay between the last close fill and submitting the reopening batch (ms).
    pub reopening_delay_ms: u64,
    /// Per-symbol overrides of `reopening_delay_ms`.
    pub per_symbol_delay_ms: HashMap<String, u64>,
}

impl SequencerConfig {
    /// Sequenced reopening delay for a symbol.
    pub fn reopening_delay(&self, symbol: &str) -> Duration {
        let ms = self
            .per_symbol_delay_ms
            .get(symbol)
            .copied()
            .unwrap_or(self.reopening_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            reopening_delay_ms: 100,
            per_symbol_delay_ms: HashMap::new(),
        }
    }
}

/// Livesim pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivesimConfig {
    /// Add a random delay between serial quotes.
    pub delay_between_quotes_enabled: bool,
    /// Lower bound of the random delay (ms).
    pub delay_min_ms: u64,
    /// Upper bound of the random delay (ms); 0 means exactly `delay_min_ms`.
    pub delay_max_ms: u64,
    /// Fixed pause after every quote so consumers keep up (ms).
    pub base_delay_ms: u64,
    /// How often a paused livesim re-checks for an abort request (ms).
    pub pause_poll_ms: u64,
}

impl Default for LivesimConfig {
    fn default() -> Self {
        Self {
            delay_between_quotes_enabled: false,
            delay_min_ms: 0,
            delay_max_ms: 0,
            base_delay_ms: 50,
            pause_poll_ms: 50,
        }
    }
}

/// Invariant checking configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Failed invariant checks become errors instead of warnings.
    pub strict_invariants: bool,
}
