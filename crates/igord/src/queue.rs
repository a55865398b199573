//! Order manager and event manager (spec.md Section 4.1, Section 4.2).
//!
//! Ported from `igor/server/queue.py`. Both managers are plain, synchronous
//! mutations over in-process state — the connection handler (`conn.rs`)
//! owns the `Mutex` that serialises access, so no concurrency primitives
//! appear here (spec.md Section 5: "no locks are required inside the
//! server").

use std::collections::{HashMap, HashSet, VecDeque};

use igor_core::wire::Event;
use igor_core::Order;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown order id: {0}")]
    UnknownOrder(Uuid),
    #[error(transparent)]
    Order(#[from] igor_core::OrderError),
}

/// A connected order subscriber: one unit of demand per entry in `sub_q`.
pub struct Subscriber {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Order>,
}

/// Pending-order FIFO, subscription FIFO, and assignment matching
/// (spec.md Section 4.1).
///
/// `on_assign` is fixed for the manager's lifetime at construction time,
/// unlike the source, where `Subscribe`'s handler rebinds it per
/// connection so only the most recently connected handler ever hears
/// about assignments (spec.md Section 9, first open question).
pub struct OrderManager {
    orders: HashMap<Uuid, Order>,
    subscribers: HashMap<Uuid, Subscriber>,
    order_q: VecDeque<Uuid>,
    sub_q: VecDeque<Uuid>,
    on_assign: Option<mpsc::UnboundedSender<Order>>,
}

impl OrderManager {
    pub fn new(on_assign: Option<mpsc::UnboundedSender<Order>>) -> Self {
        Self {
            orders: HashMap::new(),
            subscribers: HashMap::new(),
            order_q: VecDeque::new(),
            sub_q: VecDeque::new(),
            on_assign,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.orders.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Register one unit of demand for `subscriber`, then drain.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        let id = subscriber.id;
        self.subscribers.insert(id, subscriber);
        self.sub_q.push_back(id);
        self.drain();
    }

    /// Remove all outstanding demand and the handle for `id`.
    pub fn unsubscribe(&mut self, id: Uuid) {
        self.subscribers.remove(&id);
        self.sub_q.retain(|sub_id| *sub_id != id);
    }

    /// Place `order` in the pending queue, then drain.
    pub fn add_order(&mut self, order: Order) {
        self.order_q.push_back(order.id);
        self.orders.insert(order.id, order);
        self.drain();
    }

    /// While both queues are non-empty, pop one order id and one
    /// subscriber id and assign. Strict FIFO both sides.
    fn drain(&mut self) {
        while let (Some(order_id), Some(sub_id)) = (self.order_q.front(), self.sub_q.front()) {
            let order_id = *order_id;
            let sub_id = *sub_id;
            self.order_q.pop_front();
            self.sub_q.pop_front();

            let order = self.orders.remove(&order_id).expect("order_q entry must exist in orders");
            let assigned = order
                .assign(sub_id.to_string())
                .expect("an order in order_q is never already assigned");
            self.orders.insert(order_id, assigned.clone());

            if let Some(sub) = self.subscribers.get(&sub_id) {
                if sub.tx.send(assigned.clone()).is_err() {
                    warn!(subscriber = %sub_id, "dropped assignment: subscriber gone");
                }
            }

            if let Some(on_assign) = &self.on_assign {
                on_assign.send(assigned).ok();
            }

            if !self.sub_q.contains(&sub_id) {
                self.subscribers.remove(&sub_id);
            }
        }
    }

    /// Remove `id` from the queue and the order map. Returns the last
    /// known value, or `None` if unknown. Permitted in any state.
    pub fn cancel_order(&mut self, id: Uuid) -> Option<Order> {
        self.order_q.retain(|order_id| *order_id != id);
        self.orders.remove(&id)
    }

    /// Transition Assigned → Completed, removing the order from the map.
    ///
    /// Only removes on success: an order that is present but unassigned
    /// (still sitting in `order_q`) must stay in `orders` if `complete()`
    /// fails, or its id would be left in `order_q` with no entry in
    /// `orders`, violating invariant 5 and panicking the next `drain`.
    pub fn complete_order_id(&mut self, id: Uuid) -> Result<Order, QueueError> {
        let order = self.orders.get(&id).ok_or(QueueError::UnknownOrder(id))?;
        let completed = order.complete()?;
        self.orders.remove(&id);
        Ok(completed)
    }

    /// If `id` is currently assigned, unassign it and push it to the
    /// front of the pending queue, then drain.
    pub fn unassign_order(&mut self, id: Uuid) {
        let Some(order) = self.orders.get(&id) else {
            return;
        };
        if !order.is_assigned() {
            return;
        }
        let unassigned = order.unassign().expect("checked is_assigned above");
        self.orders.insert(id, unassigned);
        self.order_q.push_front(id);
        self.drain();
    }
}

/// A connected event subscriber, with its filter set. An empty filter
/// means "all events" (spec.md Section 4.2).
struct EventSubscriber {
    tx: mpsc::UnboundedSender<Event>,
    filter: HashSet<String>,
}

/// Per-subscriber event filters and fan-out delivery (spec.md Section
/// 4.2). Ported from `igor/server/queue.py`'s `EventManager`.
#[derive(Default)]
pub struct EventManager {
    subscribers: HashMap<Uuid, EventSubscriber>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: Uuid, tx: mpsc::UnboundedSender<Event>, filter: HashSet<String>) {
        self.subscribers.insert(id, EventSubscriber { tx, filter });
    }

    pub fn discard(&mut self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    /// Deliver `event` to every subscriber whose filter is empty or
    /// contains the event's name.
    pub fn push_event(&self, event: Event) {
        for sub in self.subscribers.values() {
            if sub.filter.is_empty() || sub.filter.contains(event.name()) {
                sub.tx.send(event.clone()).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn order() -> Order {
        Order::new(igor_core::NewOrder {
            id: None,
            desc: "test".into(),
            spec_uri: "/fake/local/dir".into(),
            spec_ref: "build0".into(),
            source_uri: "git://example.org/foo/bar".into(),
            source_args: vec!["abcdef0".into()],
            env: BTreeMap::new(),
        })
    }

    fn subscriber() -> (Subscriber, mpsc::UnboundedReceiver<Order>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Subscriber {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn subscribe_twice_then_two_orders_delivers_both() {
        let mut om = OrderManager::new(None);
        let (sub, mut rx) = subscriber();
        let id = sub.id;
        let sub2 = Subscriber {
            id,
            tx: sub.tx.clone(),
        };
        om.subscribe(sub);
        om.subscribe(sub2);

        let o1 = order();
        let o2 = order();
        let o3 = order();
        om.add_order(o1.clone());
        om.add_order(o2.clone());
        om.add_order(o3); // should not be delivered

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first, o1.assign(id.to_string()).unwrap());
        assert_eq!(second, o2.assign(id.to_string()).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_voids_multiple_subscriptions() {
        let mut om = OrderManager::new(None);
        let (sub, mut rx) = subscriber();
        let id = sub.id;
        om.subscribe(Subscriber {
            id,
            tx: sub.tx.clone(),
        });
        om.subscribe(sub);
        om.unsubscribe(id);
        om.add_order(order());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn order_present_before_add_is_false() {
        let om = OrderManager::new(None);
        assert!(!om.contains(order().id));
    }

    #[test]
    fn order_present_after_add() {
        let mut om = OrderManager::new(None);
        let o = order();
        om.add_order(o.clone());
        assert!(om.contains(o.id));
    }

    #[test]
    fn order_absent_after_assignment() {
        let mut om = OrderManager::new(None);
        let o = order();
        om.add_order(o.clone());
        let (sub, _rx) = subscriber();
        om.subscribe(sub);
        assert!(!om.contains(o.id));
    }

    #[test]
    fn cancel_before_assignment_returns_unassigned_order() {
        let mut om = OrderManager::new(None);
        let o = order();
        om.add_order(o.clone());
        let cancelled = om.cancel_order(o.id).unwrap();
        assert_eq!(cancelled, o);
        assert!(!om.contains(o.id));
    }

    #[test]
    fn cancel_unknown_order_returns_none() {
        let mut om = OrderManager::new(None);
        assert!(om.cancel_order(Uuid::new_v4()).is_none());
    }

    #[test]
    fn unassign_before_assignment_has_no_effect_on_presence() {
        let mut om = OrderManager::new(None);
        let o = order();
        om.add_order(o.clone());
        om.unassign_order(o.id);
        assert!(om.contains(o.id));
    }

    #[test]
    fn unassign_after_assignment_reassigns_to_next_subscriber() {
        let mut om = OrderManager::new(None);
        let (sub1, mut rx1) = subscriber();
        let (sub2, mut rx2) = subscriber();
        let id2 = sub2.id;
        om.subscribe(sub1);
        om.subscribe(sub2);
        let o = order();
        om.add_order(o.clone());
        let _ = rx1.try_recv().unwrap();

        om.unassign_order(o.id);
        let reassigned = rx2.try_recv().unwrap();
        assert_eq!(reassigned, o.assign(id2.to_string()).unwrap());
    }

    #[test]
    fn complete_order_id_returns_completed_order() {
        let mut om = OrderManager::new(None);
        let (sub, mut rx) = subscriber();
        let id = sub.id;
        om.subscribe(sub);
        let o = order();
        om.add_order(o.clone());
        let pushed = rx.try_recv().unwrap();
        let completed = om.complete_order_id(o.id).unwrap();
        assert_eq!(completed, pushed.complete().unwrap());
        assert!(!om.contains(o.id));
    }

    #[test]
    fn complete_order_id_on_a_pending_unassigned_order_leaves_state_intact() {
        // Regression: completing an id that is still pending (no
        // subscriber yet) must fail without deleting the order, or its id
        // is left in order_q with no entry in orders, panicking the next
        // drain (invariant 5).
        let mut om = OrderManager::new(None);
        let o = order();
        om.add_order(o.clone());

        let err = om.complete_order_id(o.id).unwrap_err();
        assert!(matches!(
            err,
            QueueError::Order(igor_core::OrderError::CompleteUnassigned)
        ));
        assert!(om.contains(o.id));

        // A subsequent drain must not panic.
        let (sub, mut rx) = subscriber();
        let sub_id = sub.id;
        om.subscribe(sub);
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered, o.assign(sub_id.to_string()).unwrap());
    }

    #[test]
    fn on_assign_callback_fires_with_assigned_order() {
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
        let mut om = OrderManager::new(Some(cb_tx));
        let (sub, _rx) = subscriber();
        let id = sub.id;
        om.subscribe(sub);
        assert!(cb_rx.try_recv().is_err());
        let o = order();
        om.add_order(o.clone());
        let seen = cb_rx.try_recv().unwrap();
        assert_eq!(seen, o.assign(id.to_string()).unwrap());
    }

    #[test]
    fn event_manager_delivers_filtered_events_once_each() {
        let mut em = EventManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();

        em.add(Uuid::new_v4(), tx1, HashSet::new());
        let mut foo_only = HashSet::new();
        foo_only.insert("OrderCreated".to_string());
        em.add(Uuid::new_v4(), tx2, foo_only);
        let mut bar_only = HashSet::new();
        bar_only.insert("OrderCompleted".to_string());
        em.add(Uuid::new_v4(), tx3, bar_only);

        let ev = Event::OrderCreated {
            order_id: Uuid::nil(),
        };
        em.push_event(ev.clone());

        assert_eq!(rx1.try_recv().unwrap(), ev);
        assert_eq!(rx2.try_recv().unwrap(), ev);
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn discarded_subscriber_receives_nothing() {
        let mut em = EventManager::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        em.add(id, tx, HashSet::new());
        em.discard(id);
        em.push_event(Event::Unsubscribe);
        assert!(rx.try_recv().is_err());
    }
}
