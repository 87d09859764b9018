//! Quote and bar subscriptions per symbol and scale.
//!
//! The subscription map is guarded by one lock per distributor. Pushes take a
//! snapshot of the subscribers and release the lock before calling them, so a
//! consumer may subscribe or unsubscribe from inside a callback.

use barsim_core::{Bar, ScaleInterval, Symbol, SyntheticQuote};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Receives quotes and completed bars for the streams it is subscribed to.
pub trait QuoteBarConsumer: Send + Sync {
    /// A quote, together with the bar it is forming.
    fn consume_quote(&self, quote: &SyntheticQuote, forming: &Bar);

    /// A completed bar.
    fn consume_bar(&self, bar: &Bar);

    /// Identity of the consumer within one stream.
    fn name(&self) -> &str;
}

type StreamKey = (Symbol, ScaleInterval);
type Subscribers = HashMap<StreamKey, Vec<Arc<dyn QuoteBarConsumer>>>;

#[derive(Default)]
struct Subscriptions {
    quotes: Subscribers,
    bars: Subscribers,
}

/// Fan-out of quotes and bars to subscribed consumers.
#[derive(Default)]
pub struct Distributor {
    name: String,
    subscriptions: Mutex<Subscriptions>,
}

fn subscribe(map: &mut Subscribers, key: StreamKey, consumer: Arc<dyn QuoteBarConsumer>) -> bool {
    let list = map.entry(key).or_default();
    if list.iter().any(|c| c.name() == consumer.name()) {
        return false;
    }
    list.push(consumer);
    true
}

fn unsubscribe(map: &mut Subscribers, key: &StreamKey, consumer_name: &str) -> bool {
    let Some(list) = map.get_mut(key) else {
        return false;
    };
    let before = list.len();
    list.retain(|c| c.name() != consumer_name);
    let removed = list.len() != before;
    if list.is_empty() {
        map.remove(key);
    }
    removed
}

impl Distributor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to quotes. Returns false if a consumer of that name is already subscribed.
    pub fn subscribe_quote(
        &self,
        symbol: &str,
        scale: ScaleInterval,
        consumer: Arc<dyn QuoteBarConsumer>,
    ) -> bool {
        let key = (symbol.to_string(), scale);
        let added = subscribe(&mut self.subscriptions.lock().quotes, key, consumer);
        tracing::debug!(distributor = %self.name, symbol, %scale, added, "quote subscription");
        added
    }

    pub fn unsubscribe_quote(
        &self,
        symbol: &str,
        scale: ScaleInterval,
        consumer_name: &str,
    ) -> bool {
        let key = (symbol.to_string(), scale);
        unsubscribe(&mut self.subscriptions.lock().quotes, &key, consumer_name)
    }

    /// Subscribe to completed bars. Returns false if a consumer of that name is already subscribed.
    pub fn subscribe_bar(
        &self,
        symbol: &str,
        scale: ScaleInterval,
        consumer: Arc<dyn QuoteBarConsumer>,
    ) -> bool {
        let key = (symbol.to_string(), scale);
        let added = subscribe(&mut self.subscriptions.lock().bars, key, consumer);
        tracing::debug!(distributor = %self.name, symbol, %scale, added, "bar subscription");
        added
    }

    pub fn unsubscribe_bar(&self, symbol: &str, scale: ScaleInterval, consumer_name: &str) -> bool {
        let key = (symbol.to_string(), scale);
        unsubscribe(&mut self.subscriptions.lock().bars, &key, consumer_name)
    }

    pub fn is_subscribed_quote(
        &self,
        symbol: &str,
        scale: ScaleInterval,
        consumer_name: &str,
    ) -> bool {
        self.subscriptions
            .lock()
            .quotes
            .get(&(symbol.to_string(), scale))
            .is_some_and(|list| list.iter().any(|c| c.name() == consumer_name))
    }

    /// Number of distinct consumers subscribed to anything.
    pub fn consumer_count(&self) -> usize {
        let subs = self.subscriptions.lock();
        let mut names: Vec<&str> = subs
            .quotes
            .values()
            .chain(subs.bars.values())
            .flatten()
            .map(|c| c.name())
            .collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    /// Symbols and scales with at least one subscriber.
    pub fn streams(&self) -> Vec<(Symbol, ScaleInterval)> {
        let subs = self.subscriptions.lock();
        let mut keys: Vec<StreamKey> =
            subs.quotes.keys().chain(subs.bars.keys()).cloned().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.duration_ms().cmp(&b.1.duration_ms())));
        keys.dedup();
        keys
    }

    /// Deliver a quote. Returns how many consumers received it.
    pub fn push_quote(&self, scale: ScaleInterval, quote: &SyntheticQuote, forming: &Bar) -> usize {
        let snapshot: Vec<Arc<dyn QuoteBarConsumer>> = self
            .subscriptions
            .lock()
            .quotes
            .get(&(quote.symbol.clone(), scale))
            .cloned()
            .unwrap_or_default();

        for consumer in &snapshot {
            consumer.consume_quote(quote, forming);
        }
        snapshot.len()
    }

    /// Deliver a completed bar. Returns how many consumers received it.
    pub fn push_bar(&self, symbol: &str, scale: ScaleInterval, bar: &Bar) -> usize {
        let snapshot: Vec<Arc<dyn QuoteBarConsumer>> = self
            .subscriptions
            .lock()
            .bars
            .get(&(symbol.to_string(), scale))
            .cloned()
            .unwrap_or_default();

        for consumer in &snapshot {
            consumer.consume_bar(bar);
        }
        snapshot.len()
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("name", &self.name)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}
