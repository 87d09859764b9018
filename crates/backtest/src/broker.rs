//! Broker abstraction and the simulated broker used for replays.
//!
//! The simulated broker keeps submitted orders working in submission order and
//! fills them against every quote pushed to it. Fill and reject notifications
//! go to registered [`FillListener`]s after the pending-order lock is released.

use crate::fill_model::FillModel;
use crate::orders::OrderProcessor;
use barsim_core::{
    Error, ErrorReporter, Fill, Order, OrderId, OrderKind, OrderState, Result, Symbol,
    SyntheticQuote,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Order entry surface.
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    /// Accept a batch of orders for execution.
    fn submit_orders(&self, orders: Vec<Order>) -> Result<()>;

    /// Cancel a working order.
    fn kill_order(&self, id: OrderId) -> Result<()>;
}

/// Receives execution notifications.
pub trait FillListener: Send + Sync {
    fn on_fill(&self, order: &Order, fill: &Fill);

    fn on_reject(&self, _order: &Order, _reason: &str) {}
}

/// Submit a batch after `delay` on the runtime, never on the calling thread.
pub fn submit_orders_delayed(
    broker: Arc<dyn Broker>,
    orders: Vec<Order>,
    delay: Duration,
    runtime: &Handle,
    reporter: Arc<dyn ErrorReporter>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let count = orders.len();
        if let Err(e) = broker.submit_orders(orders) {
            reporter.error(
                &format!("delayed submission of [{count}] orders to [{}] failed", broker.name()),
                Some(&e),
            );
        }
    })
}

/// In-process broker filling orders from synthetic quotes.
pub struct SimulatedBroker {
    fill_model: FillModel,
    processor: Arc<dyn OrderProcessor>,
    /// Working orders in submission order.
    pending: Mutex<Vec<Order>>,
    last_quotes: Mutex<HashMap<Symbol, SyntheticQuote>>,
    listeners: RwLock<Vec<Arc<dyn FillListener>>>,
    fills: Mutex<Vec<Fill>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl SimulatedBroker {
    pub fn new(
        fill_model: FillModel,
        processor: Arc<dyn OrderProcessor>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            fill_model,
            processor,
            pending: Mutex::new(Vec::new()),
            last_quotes: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            fills: Mutex::new(Vec::new()),
            reporter,
        }
    }

    /// Listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn FillListener>) {
        self.listeners.write().push(listener);
    }

    /// Working orders for a symbol, in submission order.
    pub fn pending_orders(&self, symbol: &str) -> Vec<Order> {
        self.pending
            .lock()
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: OrderId) -> bool {
        self.pending.lock().iter().any(|o| o.id == id)
    }

    pub fn last_quote(&self, symbol: &str) -> Option<SyntheticQuote> {
        self.last_quotes.lock().get(symbol).cloned()
    }

    /// Every fill so far.
    pub fn fills(&self) -> Vec<Fill> {
        self.fills.lock().clone()
    }

    fn reject_reason(order: &Order) -> Option<String> {
        if !(order.qty.is_finite() && order.qty > 0.0) {
            return Some(format!("invalid quantity [{}]", order.qty));
        }
        match order.kind.trigger_price() {
            Some(px) if !(px.is_finite() && px > 0.0) => {
                Some(format!("invalid trigger price [{px}]"))
            }
            _ => None,
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn FillListener>> {
        self.listeners.read().clone()
    }

    fn reject(&self, mut order: Order, reason: &str) {
        if let Err(e) = self
            .processor
            .update_state_and_post_process(order.id, OrderState::Rejected, reason)
        {
            self.reporter.error(&format!("rejecting {}", order.id), Some(&e));
        }
        order.state = OrderState::Rejected;
        tracing::warn!(order = %order, reason, "order rejected");
        for listener in self.listeners_snapshot() {
            listener.on_reject(&order, reason);
        }
    }

    fn complete_fill(&self, mut order: Order, fill: Fill) {
        let note = format!("filled {}@{} by quote seq[{}]", fill.size, fill.price, fill.quote_seq);
        if let Err(e) = self
            .processor
            .update_state_and_post_process(order.id, OrderState::Filled, &note)
        {
            self.reporter.error(&format!("marking {} filled", order.id), Some(&e));
        }
        order.state = OrderState::Filled;
        tracing::debug!(
            order = %order.id,
            price = fill.price,
            seq = fill.quote_seq,
            "order filled"
        );
        self.fills.lock().push(fill.clone());
        for listener in self.listeners_snapshot() {
            listener.on_fill(&order, &fill);
        }
    }

    /// Fill every working order the quote satisfies. Returns the fills.
    pub fn on_quote(&self, quote: &SyntheticQuote) -> Vec<Fill> {
        self.last_quotes.lock().insert(quote.symbol.clone(), quote.clone());

        let filled: Vec<(Order, Fill)> = {
            let mut pending = self.pending.lock();
            let mut filled = Vec::new();
            let mut still_working = Vec::with_capacity(pending.len());
            for order in pending.drain(..) {
                match (order.symbol == quote.symbol)
                    .then(|| self.fill_model.try_fill(&order, quote))
                    .flatten()
                {
                    Some(fill) => filled.push((order, fill)),
                    None => still_working.push(order),
                }
            }
            *pending = still_working;
            filled
        };

        let fills: Vec<Fill> = filled.iter().map(|(_, f)| f.clone()).collect();
        for (order, fill) in filled {
            self.complete_fill(order, fill);
        }
        fills
    }

    /// Fill a market order immediately against the last quote of its symbol.
    ///
    /// Used to flatten positions when no further quotes will arrive.
    pub fn fill_at_last_quote(&self, order: Order) -> Result<Fill> {
        if order.kind != OrderKind::Market {
            return Err(Error::broker(format!("{} is not a market order", order.id)));
        }
        let quote = self.last_quote(&order.symbol).ok_or_else(|| {
            Error::broker(format!("no quote for [{}] to fill {}", order.symbol, order.id))
        })?;
        self.processor.update_state_and_post_process(
            order.id,
            OrderState::Submitted,
            "submitted for immediate fill",
        )?;
        let fill = self
            .fill_model
            .try_fill(&order, &quote)
            .ok_or_else(|| Error::broker(format!("{} not fillable at last quote", order.id)))?;
        self.complete_fill(order, fill.clone());
        Ok(fill)
    }
}

impl Broker for SimulatedBroker {
    fn name(&self) -> &str {
        "simulated"
    }

    fn submit_orders(&self, orders: Vec<Order>) -> Result<()> {
        for mut order in orders {
            if let Some(reason) = Self::reject_reason(&order) {
                self.reject(order, &reason);
                continue;
            }
            if let Err(e) = self.processor.update_state_and_post_process(
                order.id,
                OrderState::Submitted,
                "working at simulated broker",
            ) {
                // Killed while a delayed submission was in flight.
                self.reporter.warning(&format!("{} not submitted: {e}", order.id));
                continue;
            }
            order.state = OrderState::Submitted;
            tracing::debug!(order = %order, "order working");
            self.pending.lock().push(order);
        }
        Ok(())
    }

    fn kill_order(&self, id: OrderId) -> Result<()> {
        let removed = {
            let mut pending = self.pending.lock();
            let index = pending.iter().position(|o| o.id == id);
            index.map(|i| pending.remove(i))
        };
        if removed.is_none() {
            return Err(Error::broker(format!("order {id} is not working")));
        }
        self.processor
            .update_state_and_post_process(id, OrderState::Killed, "killed at simulated broker")
    }
}
