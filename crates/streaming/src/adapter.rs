//! Streaming adapter: bar factories in front of a distributor.

use crate::bar_factory::StreamingBarFactory;
use crate::distributor::Distributor;
use barsim_core::{Bar, ScaleInterval, Symbol, SyntheticQuote};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Turns pushed quotes into quote and bar notifications.
///
/// Each (symbol, scale) stream has its own bar factory. Completed bars are
/// distributed before the quote that completed them.
#[derive(Debug)]
pub struct StreamingAdapter {
    name: String,
    distributor: Distributor,
    factories: Mutex<HashMap<(Symbol, ScaleInterval), StreamingBarFactory>>,
}

impl StreamingAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            distributor: Distributor::new(format!("{name}:distributor")),
            name,
            factories: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    /// Make sure quotes for this stream are formed into bars.
    pub fn register_stream(&self, symbol: &str, scale: ScaleInterval) {
        self.factories
            .lock()
            .entry((symbol.to_string(), scale))
            .or_insert_with(|| StreamingBarFactory::new(symbol, scale));
    }

    /// Feed a quote to every factory of its symbol, then distribute.
    /// Returns the bars this quote completed.
    pub fn push_quote(&self, quote: &SyntheticQuote) -> Vec<(ScaleInterval, Bar)> {
        let results: Vec<_> = {
            let mut factories = self.factories.lock();
            factories
                .iter_mut()
                .filter(|((symbol, _), _)| *symbol == quote.symbol)
                .map(|((_, scale), factory)| (*scale, factory.absorb_quote(quote)))
                .collect()
        };

        if results.is_empty() {
            tracing::debug!(
                adapter = %self.name,
                symbol = %quote.symbol,
                "quote for unregistered stream dropped"
            );
        }

        let mut completed = Vec::new();
        for (scale, result) in results {
            if let Some(bar) = result.completed {
                self.distributor.push_bar(&quote.symbol, scale, &bar);
                completed.push((scale, bar));
            }
            self.distributor.push_quote(scale, quote, &result.forming);
        }
        completed
    }

    /// The bar currently forming for a stream.
    pub fn forming_bar(&self, symbol: &str, scale: ScaleInterval) -> Option<Bar> {
        self.factories
            .lock()
            .get(&(symbol.to_string(), scale))
            .and_then(StreamingBarFactory::forming)
    }

    /// Remove and return a stream's factory.
    pub fn take_bar_factory(
        &self,
        symbol: &str,
        scale: ScaleInterval,
    ) -> Option<StreamingBarFactory> {
        self.factories.lock().remove(&(symbol.to_string(), scale))
    }

    /// Continue `other`'s bar formation for this stream here.
    ///
    /// Returns false if `other` had no factory for the stream.
    pub fn absorb_bar_factory_from(
        &self,
        other: &StreamingAdapter,
        symbol: &str,
        scale: ScaleInterval,
    ) -> bool {
        let Some(factory) = other.take_bar_factory(symbol, scale) else {
            return false;
        };
        tracing::info!(
            from = %other.name,
            to = %self.name,
            symbol,
            %scale,
            forming = factory.forming().is_some(),
            "bar factory continuation absorbed"
        );
        self.factories.lock().insert((symbol.to_string(), scale), factory);
        true
    }
}
