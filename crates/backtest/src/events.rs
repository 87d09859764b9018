//! Simulation lifecycle events.

use crate::metrics::TradeStats;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub symbol: String,
    pub strategy: String,
    /// Bars in the original series.
    pub bars_total: usize,
    pub bars_simulated: usize,
    pub quotes_generated: usize,
    pub quotes_injected: usize,
    pub exceptions: usize,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub trades: usize,
    pub realized_pnl: f64,
    pub stats: TradeStats,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SimulationEvent {
    /// Context swapped in, counters cleared, run about to start.
    ContextInitialized { symbol: String, bars_total: usize },
    /// A progress chunk boundary was crossed.
    ChunkSimulated {
        bars_simulated: usize,
        bars_total: usize,
        quotes_generated: usize,
    },
    Aborted { reason: String },
    Finished(RunSummary),
}

/// Fans events out to subscribers over channels.
#[derive(Debug, Default)]
pub struct EventGenerator {
    subscribers: Mutex<Vec<Sender<SimulationEvent>>>,
}

impl EventGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SimulationEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send to every live subscriber; disconnected ones are dropped.
    pub fn raise(&self, event: SimulationEvent) {
        tracing::trace!(?event, "simulation event");
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
