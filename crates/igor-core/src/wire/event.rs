//! Events fanned out to subscribers (spec.md Section 4.2, Section 4.3).
//!
//! Each variant carries its own `name()` used both for wire serialisation
//! and for matching against a subscriber's filter set — the tagged-enum
//! equivalent of the source's duck-typed `name()` method on event classes
//! (spec.md Section 9).

use serde::Serialize;
use uuid::Uuid;

/// The eight registered event names (spec.md Section 4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "params")]
pub enum Event {
    Subscribe,
    Unsubscribe,
    OrderCreated { order_id: Uuid },
    OrderWaiting,
    OrderAssigned { order_id: Uuid, worker: String },
    OrderCompleted { order_id: Uuid },
    OrderUnassigned { order_id: Uuid },
    OrderCancelled { order_id: Uuid },
}

impl Event {
    /// The event's registered name, used for filter matching.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Subscribe => "Subscribe",
            Event::Unsubscribe => "Unsubscribe",
            Event::OrderCreated { .. } => "OrderCreated",
            Event::OrderWaiting => "OrderWaiting",
            Event::OrderAssigned { .. } => "OrderAssigned",
            Event::OrderCompleted { .. } => "OrderCompleted",
            Event::OrderUnassigned { .. } => "OrderUnassigned",
            Event::OrderCancelled { .. } => "OrderCancelled",
        }
    }

    /// All registered event names, in registration order.
    pub fn registered_names() -> &'static [&'static str] {
        &[
            "Subscribe",
            "Unsubscribe",
            "OrderCreated",
            "OrderWaiting",
            "OrderAssigned",
            "OrderCompleted",
            "OrderUnassigned",
            "OrderCancelled",
        ]
    }

    pub fn to_frame(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Event always serialises")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matches_wire_tag() {
        let e = Event::OrderCreated {
            order_id: Uuid::nil(),
        };
        let frame = e.to_frame();
        assert_eq!(frame["event"], "OrderCreated");
        assert_eq!(e.name(), "OrderCreated");
    }

    #[test]
    fn nullary_variant_has_no_params_field_value() {
        let frame = Event::OrderWaiting.to_frame();
        assert_eq!(frame["event"], "OrderWaiting");
    }
}
