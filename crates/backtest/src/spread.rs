//! Spread models: bid/ask half-spread per bar.

use barsim_core::config::SpreadConfig;
use barsim_core::{Bar, ErrorReporter};
use std::fmt;
use std::sync::Arc;

/// Name of the default model.
pub const PERCENTAGE: &str = "percentage";
pub const FIXED: &str = "fixed";

/// Produces the half-spread used to widen synthesized prices.
pub trait SpreadModel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Half-spread for quotes synthesized from `bar`. Never negative.
    fn half_spread(&self, bar: &Bar) -> f64;
}

/// Full spread as a percentage of the bar close.
#[derive(Debug, Clone, Copy)]
pub struct PercentageSpread {
    pub percent: f64,
}

impl PercentageSpread {
    pub fn new(percent: f64) -> Self {
        Self { percent }
    }
}

impl Default for PercentageSpread {
    fn default() -> Self {
        Self::new(SpreadConfig::default().percent)
    }
}

impl SpreadModel for PercentageSpread {
    fn name(&self) -> &str {
        PERCENTAGE
    }

    fn half_spread(&self, bar: &Bar) -> f64 {
        let close = if bar.close.is_finite() { bar.close.abs() } else { 0.0 };
        close * self.percent / 100.0 / 2.0
    }
}

/// Constant half-spread in price units.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpread {
    pub half_spread: f64,
}

impl SpreadModel for FixedSpread {
    fn name(&self) -> &str {
        FIXED
    }

    fn half_spread(&self, _bar: &Bar) -> f64 {
        self.half_spread
    }
}

/// Widen a price into (bid, ask).
#[inline]
pub fn widen(price: f64, half_spread: f64) -> (f64, f64) {
    (price - half_spread, price + half_spread)
}

/// Pick a model by name. Unknown names fall back to the percentage model.
pub fn spread_model_from_config(
    config: &SpreadConfig,
    reporter: &dyn ErrorReporter,
) -> Arc<dyn SpreadModel> {
    match config.model.to_ascii_lowercase().as_str() {
        PERCENTAGE => Arc::new(PercentageSpread::new(config.percent)),
        FIXED => Arc::new(FixedSpread {
            half_spread: config.fixed_half_spread,
        }),
        other => {
            reporter.warning(&format!(
                "unknown spread model [{other}], falling back to [{PERCENTAGE}] with percent[{}]",
                config.percent
            ));
            Arc::new(PercentageSpread::new(config.percent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use barsim_core::{CollectingReporter, Severity};

    fn make_bar(close: f64) -> Bar {
        Bar::new(0, 0, close, close, close, close)
    }

    #[test]
    fn test_percentage_half_spread() {
        let model = PercentageSpread::new(0.01);
        // 0.01% of 10000 = 1.0 full spread
        assert_relative_eq!(model.half_spread(&make_bar(10_000.0)), 0.5);
        assert_relative_eq!(model.half_spread(&make_bar(f64::NAN)), 0.0);
    }

    #[test]
    fn test_widen() {
        let (bid, ask) = widen(100.0, 0.25);
        assert!((bid - 99.75).abs() < 1e-10);
        assert!((ask - 100.25).abs() < 1e-10);
    }

    #[test]
    fn test_model_by_name() {
        let reporter = CollectingReporter::new();
        let config = SpreadConfig {
            model: "Fixed".into(),
            fixed_half_spread: 0.05,
            ..Default::default()
        };
        let model = spread_model_from_config(&config, &reporter);

        assert_eq!(model.name(), FIXED);
        assert_relative_eq!(model.half_spread(&make_bar(123.0)), 0.05);
        assert!(reporter.reports().is_empty());
    }

    #[test]
    fn test_unknown_model_falls_back_with_warning() {
        let reporter = CollectingReporter::new();
        let config = SpreadConfig {
            model: "microstructure".into(),
            ..Default::default()
        };
        let model = spread_model_from_config(&config, &reporter);

        assert_eq!(model.name(), PERCENTAGE);
        assert_eq!(reporter.count(Severity::Warning), 1);
        assert!(reporter.contains("microstructure"));
    }
}
