//! Close-then-open order sequencing.
//!
//! A locking group of closing orders holds back a dependent group of opening
//! orders. The dependents are released exactly once, when the last locking
//! order fills, and are submitted as one batch after the symbol's sequenced
//! reopening delay on the runtime.
//!
//! The whole map sits behind one mutex.

use crate::broker::{submit_orders_delayed, Broker, FillListener};
use crate::orders::OrderProcessor;
use barsim_core::config::SequencerConfig;
use barsim_core::{Error, ErrorReporter, Fill, Order, OrderId, OrderState, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Opaque identifier of a locking group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Orders that resolve together.
#[derive(Debug, Clone)]
pub struct PendingOrderGroup<T> {
    pub id: GroupId,
    pub orders: Vec<T>,
}

impl<T> PendingOrderGroup<T> {
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Locking group of close orders and the opening orders it holds back.
#[derive(Debug, Clone)]
pub struct SequencerEntry {
    pub locking: PendingOrderGroup<OrderId>,
    pub dependent: Vec<Order>,
}

/// A dependent batch handed to the broker.
#[derive(Debug)]
pub struct ReleasedBatch {
    /// Locking group that emptied, or `None` if it was empty at registration.
    pub group: Option<GroupId>,
    pub orders: Vec<OrderId>,
    pub submission: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SequencerState {
    next_group: u64,
    entries: BTreeMap<GroupId, SequencerEntry>,
}

impl SequencerState {
    fn allocate(&mut self) -> GroupId {
        self.next_group += 1;
        GroupId(self.next_group)
    }

    fn locking_group_of(&self, id: OrderId) -> Option<GroupId> {
        self.entries
            .iter()
            .find(|(_, e)| e.locking.orders.contains(&id))
            .map(|(g, _)| *g)
    }

    fn is_dependent(&self, id: OrderId) -> bool {
        self.entries.values().any(|e| e.dependent.iter().any(|o| o.id == id))
    }
}

/// Tracks locking groups and releases their dependents.
pub struct OrderSequencer {
    state: Mutex<SequencerState>,
    processor: Arc<dyn OrderProcessor>,
    broker: Arc<dyn Broker>,
    runtime: Handle,
    config: SequencerConfig,
    reporter: Arc<dyn ErrorReporter>,
}

impl OrderSequencer {
    pub fn new(
        processor: Arc<dyn OrderProcessor>,
        broker: Arc<dyn Broker>,
        runtime: Handle,
        config: SequencerConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            processor,
            broker,
            runtime,
            config,
            reporter,
        }
    }

    /// Register `closing` as the lock on `opening`.
    ///
    /// Every opening order goes to `SubmittingSequenced`. An empty `closing`
    /// releases `opening` immediately and nothing is stored. If any opening
    /// order cannot be sequenced, no order changes state.
    pub fn initialize_sequence(
        &self,
        closing: &[Order],
        opening: Vec<Order>,
    ) -> Result<Option<GroupId>> {
        let mut state = self.state.lock();

        for order in closing {
            if let Some(group) = state.locking_group_of(order.id) {
                return Err(Error::sequencer(format!("{} already locks group {group}", order.id)));
            }
        }
        for order in &opening {
            if state.is_dependent(order.id) {
                return Err(Error::sequencer(format!("{} is already sequenced", order.id)));
            }
            self.processor
                .can_transition(order.id, OrderState::SubmittingSequenced)
                .map_err(|e| Error::sequencer(format!("{} cannot be sequenced: {e}", order.id)))?;
        }

        if closing.is_empty() {
            drop(state);
            tracing::info!(
                opening = opening.len(),
                "empty locking group, releasing dependents now"
            );
            self.release(None, opening, "empty closing group");
            return Ok(None);
        }

        let total = opening.len();
        let mut dependent = Vec::with_capacity(total);
        for mut order in opening {
            let note = format!(
                "sequenced [{:?}]=>[{:?}]: one of [{total}] held by [{}] closing orders",
                order.state,
                OrderState::SubmittingSequenced,
                closing.len()
            );
            self.processor
                .update_state_and_post_process(order.id, OrderState::SubmittingSequenced, &note)?;
            order.state = OrderState::SubmittingSequenced;
            dependent.push(order);
        }

        let id = state.allocate();
        let locking = PendingOrderGroup {
            id,
            orders: closing.iter().map(|o| o.id).collect(),
        };
        tracing::info!(
            group = %id,
            closing = locking.len(),
            opening = total,
            "close-then-open sequence registered"
        );
        state.entries.insert(id, SequencerEntry { locking, dependent });
        Ok(Some(id))
    }

    /// Swap a rejected locking order for its replacement in every group
    /// containing it. Each affected group gets a new id and keeps its dependents.
    ///
    /// Returns the new group ids.
    pub fn replace_locking_order(
        &self,
        rejected: OrderId,
        replacement: OrderId,
    ) -> Result<Vec<GroupId>> {
        let mut state = self.state.lock();
        if let Some(group) = state.locking_group_of(replacement) {
            return Err(Error::sequencer(format!(
                "replacement {replacement} already locks group {group}"
            )));
        }

        let affected: Vec<GroupId> = state
            .entries
            .iter()
            .filter(|(_, e)| e.locking.orders.contains(&rejected))
            .map(|(g, _)| *g)
            .collect();

        let mut rekeyed = Vec::with_capacity(affected.len());
        for old in affected {
            let Some(mut entry) = state.entries.remove(&old) else {
                continue;
            };
            entry.locking.orders.retain(|id| *id != rejected);
            entry.locking.orders.push(replacement);
            let new = state.allocate();
            entry.locking.id = new;
            tracing::info!(
                from = %old,
                to = %new,
                %rejected,
                %replacement,
                "locking order replaced"
            );
            state.entries.insert(new, entry);
            rekeyed.push(new);
        }
        Ok(rekeyed)
    }

    /// Remove a filled close order from its locking groups and release every
    /// dependent group whose lock became empty.
    pub fn order_filled_unlock_dependents(&self, closed: OrderId) -> Vec<ReleasedBatch> {
        let emptied: Vec<(GroupId, Vec<Order>)> = {
            let mut state = self.state.lock();
            let mut emptied = Vec::new();
            let containing: Vec<GroupId> = state
                .entries
                .iter()
                .filter(|(_, e)| e.locking.orders.contains(&closed))
                .map(|(g, _)| *g)
                .collect();

            for group in containing {
                let now_empty = match state.entries.get_mut(&group) {
                    Some(entry) => {
                        entry.locking.orders.retain(|id| *id != closed);
                        entry.locking.is_empty()
                    }
                    None => false,
                };
                if !now_empty {
                    continue;
                }
                if let Some(entry) = state.entries.remove(&group) {
                    emptied.push((group, entry.dependent));
                }
            }
            emptied
        };

        let mut released = Vec::new();
        for (group, dependent) in emptied {
            let note = format!(
                "last closing order of {group} filled, releasing [{}] opening orders",
                dependent.len()
            );
            if let Err(e) = self.processor.append_message(closed, &note) {
                self.reporter.error(&format!("note on {closed}"), Some(&e));
            }
            if dependent.is_empty() {
                continue;
            }
            released.extend(self.release(Some(group), dependent, &format!("close {closed}")));
        }
        released
    }

    fn release(
        &self,
        group: Option<GroupId>,
        dependent: Vec<Order>,
        releaser: &str,
    ) -> Option<ReleasedBatch> {
        let count = dependent.len();
        let mut batch = Vec::with_capacity(count);
        for mut order in dependent {
            let note = format!(
                "released [{:?}]=>[{:?}]: one of [{count}] opening orders, by {releaser}",
                order.state,
                OrderState::Submitting
            );
            match self
                .processor
                .update_state_and_post_process(order.id, OrderState::Submitting, &note)
            {
                Ok(()) => {
                    order.state = OrderState::Submitting;
                    batch.push(order);
                }
                Err(e) => self.reporter.error(&format!("releasing {}", order.id), Some(&e)),
            }
        }
        let first = batch.first()?;
        let delay = self.config.reopening_delay(&first.symbol);
        let orders: Vec<OrderId> = batch.iter().map(|o| o.id).collect();
        tracing::info!(
            group = ?group,
            orders = orders.len(),
            delay_ms = delay.as_millis() as u64,
            "sequence released"
        );

        let submission = submit_orders_delayed(
            self.broker.clone(),
            batch,
            delay,
            &self.runtime,
            self.reporter.clone(),
        );
        Some(ReleasedBatch {
            group,
            orders,
            submission,
        })
    }

    /// A locking order was rejected. Its dependents stay held until the order
    /// is replaced. Returns true if the order was locking anything.
    pub fn on_order_rejected(&self, rejected: OrderId) -> bool {
        let group = self.state.lock().locking_group_of(rejected);
        if let Some(group) = group {
            self.reporter.warning(&format!(
                "locking order {rejected} of group {group} rejected; \
                 dependents stay sequenced until it is replaced"
            ));
        }
        group.is_some()
    }

    /// Drop a dependent order (killed before release). An entry left with no
    /// dependents is removed. Returns true if the order was sequenced.
    pub fn forget_dependent(&self, id: OrderId) -> bool {
        let mut state = self.state.lock();
        let mut found = false;
        state.entries.retain(|_, entry| {
            let before = entry.dependent.len();
            entry.dependent.retain(|o| o.id != id);
            found |= entry.dependent.len() != before;
            !entry.dependent.is_empty()
        });
        found
    }

    /// Snapshot of every registered entry.
    pub fn pending_locks(&self) -> Vec<SequencerEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl fmt::Debug for OrderSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSequencer")
            .field("entries", &self.state.lock().entries.len())
            .finish()
    }
}

/// Broker listener forwarding fills and rejects to a sequencer.
pub struct SequencerUnlock {
    sequencer: Weak<OrderSequencer>,
}

impl SequencerUnlock {
    pub fn new(sequencer: &Arc<OrderSequencer>) -> Self {
        Self {
            sequencer: Arc::downgrade(sequencer),
        }
    }
}

impl FillListener for SequencerUnlock {
    fn on_fill(&self, order: &Order, _fill: &Fill) {
        if let Some(sequencer) = self.sequencer.upgrade() {
            sequencer.order_filled_unlock_dependents(order.id);
        }
    }

    fn on_reject(&self, order: &Order, _reason: &str) {
        if let Some(sequencer) = self.sequencer.upgrade() {
            sequencer.on_order_rejected(order.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::OrderRegistry;
    use barsim_core::{CollectingReporter, OrderKind, OrderSide};

    #[derive(Default)]
    struct RecordingBroker {
        batches: Mutex<Vec<Vec<OrderId>>>,
    }

    impl Broker for RecordingBroker {
        fn name(&self) -> &str {
            "recording"
        }

        fn submit_orders(&self, orders: Vec<Order>) -> Result<()> {
            self.batches.lock().push(orders.iter().map(|o| o.id).collect());
            Ok(())
        }

        fn kill_order(&self, _id: OrderId) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<OrderRegistry>,
        broker: Arc<RecordingBroker>,
        sequencer: OrderSequencer,
    }

    fn make_fixture(delay_ms: u64) -> Fixture {
        let registry = Arc::new(OrderRegistry::new());
        let broker = Arc::new(RecordingBroker::default());
        let sequencer = OrderSequencer::new(
            registry.clone(),
            broker.clone(),
            Handle::current(),
            SequencerConfig {
                reopening_delay_ms: delay_ms,
                ..Default::default()
            },
            Arc::new(CollectingReporter::new()),
        );
        Fixture {
            registry,
            broker,
            sequencer,
        }
    }

    fn make_order(f: &Fixture, side: OrderSide) -> Order {
        f.registry.create("ES", side, OrderKind::Market, 1.0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_after_all_closes_fill() {
        let f = make_fixture(10);
        let close_a = make_order(&f, OrderSide::Sell);
        let close_b = make_order(&f, OrderSide::Sell);
        let open = make_order(&f, OrderSide::Buy);

        let group = f
            .sequencer
            .initialize_sequence(&[close_a.clone(), close_b.clone()], vec![open.clone()])
            .unwrap();
        assert!(group.is_some());
        assert_eq!(f.registry.state(open.id), Some(OrderState::SubmittingSequenced));
        assert!(f.registry.messages(open.id)[0].contains("held by [2] closing orders"));

        assert!(f.sequencer.order_filled_unlock_dependents(close_a.id).is_empty());
        assert!(!f.sequencer.is_empty());
        assert_eq!(f.registry.state(open.id), Some(OrderState::SubmittingSequenced));

        let released = f.sequencer.order_filled_unlock_dependents(close_b.id);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].orders, vec![open.id]);
        assert!(f.sequencer.is_empty());
        assert_eq!(f.registry.state(open.id), Some(OrderState::Submitting));

        // Released exactly once.
        assert!(f.sequencer.order_filled_unlock_dependents(close_b.id).is_empty());

        for batch in released {
            batch.submission.await.unwrap();
        }
        assert_eq!(*f.broker.batches.lock(), vec![vec![open.id]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsequenceable_opening_leaves_no_order_behind() {
        let f = make_fixture(0);
        let close = make_order(&f, OrderSide::Sell);
        let open_a = make_order(&f, OrderSide::Buy);
        let open_b = make_order(&f, OrderSide::Buy);
        f.registry
            .update_state_and_post_process(open_b.id, OrderState::Killed, "killed by user")
            .unwrap();

        let result = f
            .sequencer
            .initialize_sequence(&[close.clone()], vec![open_a.clone(), open_b.clone()]);
        assert!(matches!(result, Err(Error::Sequencer(_))));
        assert!(f.sequencer.is_empty());
        assert_eq!(f.registry.state(open_a.id), Some(OrderState::Pending));
        assert!(f.registry.messages(open_a.id).is_empty());
        assert_eq!(f.registry.state(open_b.id), Some(OrderState::Killed));

        // A corrected batch can still be sequenced behind the same close.
        let group = f
            .sequencer
            .initialize_sequence(&[close.clone()], vec![open_a.clone()])
            .unwrap();
        assert!(group.is_some());
        assert_eq!(f.sequencer.order_filled_unlock_dependents(close.id).len(), 1);
        assert_eq!(f.registry.state(open_a.id), Some(OrderState::Submitting));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_closing_group_releases_immediately() {
        let f = make_fixture(0);
        let open = make_order(&f, OrderSide::Buy);

        let group = f.sequencer.initialize_sequence(&[], vec![open.clone()]).unwrap();
        assert!(group.is_none());
        assert!(f.sequencer.is_empty());
        assert_eq!(f.registry.state(open.id), Some(OrderState::Submitting));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(f.broker.batches.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replace_preserves_dependents() {
        let f = make_fixture(0);
        let rejected = make_order(&f, OrderSide::Sell);
        let other = make_order(&f, OrderSide::Sell);
        let replacement = make_order(&f, OrderSide::Sell);
        let open = make_order(&f, OrderSide::Buy);

        let old = f
            .sequencer
            .initialize_sequence(&[rejected.clone(), other.clone()], vec![open.clone()])
            .unwrap()
            .unwrap();
        let rekeyed = f.sequencer.replace_locking_order(rejected.id, replacement.id).unwrap();

        assert_eq!(rekeyed.len(), 1);
        assert_ne!(rekeyed[0], old);
        let locks = f.sequencer.pending_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].locking.orders, vec![other.id, replacement.id]);
        assert_eq!(locks[0].dependent[0].id, open.id);

        // The rejected order no longer unlocks anything.
        assert!(f.sequencer.order_filled_unlock_dependents(rejected.id).is_empty());
        f.sequencer.order_filled_unlock_dependents(other.id);
        let released = f.sequencer.order_filled_unlock_dependents(replacement.id);
        assert_eq!(released.len(), 1);
        assert!(f.sequencer.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_order_locks_at_most_one_group() {
        let f = make_fixture(0);
        let close = make_order(&f, OrderSide::Sell);
        let open_a = make_order(&f, OrderSide::Buy);
        let open_b = make_order(&f, OrderSide::Buy);

        f.sequencer
            .initialize_sequence(&[close.clone()], vec![open_a.clone()])
            .unwrap();
        let again = f.sequencer.initialize_sequence(&[close.clone()], vec![open_b]);
        assert!(matches!(again, Err(Error::Sequencer(_))));

        let other_close = make_order(&f, OrderSide::Sell);
        let dup = f.sequencer.initialize_sequence(&[other_close], vec![open_a]);
        assert!(matches!(dup, Err(Error::Sequencer(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forget_dependent_drops_entry() {
        let f = make_fixture(0);
        let close = make_order(&f, OrderSide::Sell);
        let open = make_order(&f, OrderSide::Buy);
        f.sequencer.initialize_sequence(&[close.clone()], vec![open.clone()]).unwrap();

        assert!(f.sequencer.on_order_rejected(close.id));
        assert!(f.sequencer.forget_dependent(open.id));
        assert!(f.sequencer.is_empty());
        assert!(!f.sequencer.forget_dependent(open.id));
    }
}
