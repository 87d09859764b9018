//! Order registry: id allocation, state transitions and order messages.

use barsim_core::{Error, Order, OrderId, OrderKind, OrderSide, OrderState, Result, Size, Symbol};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// State transitions and notes on orders, shared by the broker and the sequencer.
pub trait OrderProcessor: Send + Sync {
    /// Move an order to `state`, recording `note` on it.
    fn update_state_and_post_process(
        &self,
        id: OrderId,
        state: OrderState,
        note: &str,
    ) -> Result<()>;

    /// Whether `update_state_and_post_process(id, state, ..)` would succeed,
    /// without changing anything.
    fn can_transition(&self, id: OrderId, state: OrderState) -> Result<()>;

    /// Record a note on an order without changing its state.
    fn append_message(&self, id: OrderId, note: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct OrderRecord {
    order: Order,
    messages: Vec<String>,
}

/// Every order created during a session, keyed by id.
#[derive(Debug)]
pub struct OrderRegistry {
    next_id: AtomicU64,
    orders: RwLock<BTreeMap<OrderId, OrderRecord>>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            orders: RwLock::new(BTreeMap::new()),
        }
    }

    /// Allocate an id and register a new pending order.
    pub fn create(
        &self,
        symbol: impl Into<Symbol>,
        side: OrderSide,
        kind: OrderKind,
        qty: Size,
    ) -> Order {
        let id = OrderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let order = Order::new(id, symbol, side, kind, qty);
        self.orders.write().insert(
            id,
            OrderRecord {
                order: order.clone(),
                messages: Vec::new(),
            },
        );
        tracing::debug!(order = %order, "order created");
        order
    }

    /// Current snapshot of an order.
    pub fn get(&self, id: OrderId) -> Option<Order> {
        self.orders.read().get(&id).map(|r| r.order.clone())
    }

    pub fn state(&self, id: OrderId) -> Option<OrderState> {
        self.orders.read().get(&id).map(|r| r.order.state)
    }

    pub fn messages(&self, id: OrderId) -> Vec<String> {
        self.orders
            .read()
            .get(&id)
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    /// Orders currently in `state`, by id.
    pub fn in_state(&self, state: OrderState) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|r| r.order.state == state)
            .map(|r| r.order.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}

impl Default for OrderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn refusal(id: OrderId, from: OrderState, to: OrderState) -> Option<String> {
    (from.is_terminal() && from != to)
        .then(|| format!("order {id} is already [{from:?}], refusing [{to:?}]"))
}

impl OrderProcessor for OrderRegistry {
    fn update_state_and_post_process(
        &self,
        id: OrderId,
        state: OrderState,
        note: &str,
    ) -> Result<()> {
        let mut orders = self.orders.write();
        let record = orders
            .get_mut(&id)
            .ok_or_else(|| Error::data(format!("unknown order {id}")))?;

        let from = record.order.state;
        if let Some(refused) = refusal(id, from, state) {
            return Err(Error::data(format!("{refused}: {note}")));
        }
        record.order.state = state;
        record.messages.push(note.to_string());
        tracing::debug!(order = %id, ?from, to = ?state, note, "order state");
        Ok(())
    }

    fn can_transition(&self, id: OrderId, state: OrderState) -> Result<()> {
        let orders = self.orders.read();
        let record = orders
            .get(&id)
            .ok_or_else(|| Error::data(format!("unknown order {id}")))?;
        match refusal(id, record.order.state, state) {
            Some(refused) => Err(Error::data(refused)),
            None => Ok(()),
        }
    }

    fn append_message(&self, id: OrderId, note: &str) -> Result<()> {
        let mut orders = self.orders.write();
        let record = orders
            .get_mut(&id)
            .ok_or_else(|| Error::data(format!("unknown order {id}")))?;
        record.messages.push(note.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_creation_order() {
        let registry = OrderRegistry::new();
        let a = registry.create("ES", OrderSide::Buy, OrderKind::Market, 1.0);
        let b = registry.create("ES", OrderSide::Sell, OrderKind::Limit(10.0), 2.0);

        assert!(a.id < b.id);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(a.id), Some(OrderState::Pending));
    }

    #[test]
    fn test_state_transition_records_message() {
        let registry = OrderRegistry::new();
        let order = registry.create("ES", OrderSide::Buy, OrderKind::Market, 1.0);

        registry
            .update_state_and_post_process(order.id, OrderState::Submitted, "sent")
            .unwrap();
        registry.append_message(order.id, "ack").unwrap();

        assert_eq!(registry.state(order.id), Some(OrderState::Submitted));
        assert_eq!(registry.messages(order.id), vec!["sent", "ack"]);
        assert_eq!(registry.in_state(OrderState::Submitted).len(), 1);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let registry = OrderRegistry::new();
        let order = registry.create("ES", OrderSide::Buy, OrderKind::Market, 1.0);
        registry
            .update_state_and_post_process(order.id, OrderState::Killed, "killed")
            .unwrap();

        assert!(registry.can_transition(order.id, OrderState::Killed).is_ok());
        assert!(registry.can_transition(order.id, OrderState::Submitting).is_err());
        let result =
            registry.update_state_and_post_process(order.id, OrderState::Submitting, "release");
        assert!(matches!(result, Err(Error::Data(_))));
        assert_eq!(registry.state(order.id), Some(OrderState::Killed));
    }

    #[test]
    fn test_unknown_order() {
        let registry = OrderRegistry::new();
        assert!(registry.append_message(OrderId(42), "x").is_err());
        assert!(registry.can_transition(OrderId(42), OrderState::Submitted).is_err());
        assert!(registry.get(OrderId(42)).is_none());
    }
}
