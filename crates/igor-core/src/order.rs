//! The `Order` value type (spec.md Section 3).
//!
//! An `Order` is an immutable record; every lifecycle transition returns a
//! new value rather than mutating in place, matching `igor/order.py`'s
//! `_mutate` helper.

use std::collections::BTreeMap;

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("cannot assign an already-assigned order")]
    AlreadyAssigned,
    #[error("cannot unassign an unassigned order")]
    NotAssigned,
    #[error("cannot unassign a completed order")]
    AlreadyCompleted,
    #[error("cannot complete an unassigned order")]
    CompleteUnassigned,
}

/// Immutable description of a unit of work (spec.md Section 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub desc: String,
    pub spec_uri: String,
    pub spec_ref: String,
    pub source_uri: String,
    #[serde(default)]
    pub source_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub created: String,
    #[serde(default)]
    pub assigned: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub worker: Option<String>,
}

/// Fields required to construct a fresh `Order` (spec.md Section 3).
///
/// Mirrors `order.py`'s keyword-only constructor: `id`, `env`, `created`,
/// `assigned`, `completed` and `worker` all default sensibly when absent.
#[derive(Debug, Clone, Default)]
pub struct NewOrder {
    pub id: Option<Uuid>,
    pub desc: String,
    pub spec_uri: String,
    pub spec_ref: String,
    pub source_uri: String,
    pub source_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Order {
    /// Construct a new, unassigned, incomplete order.
    pub fn new(fields: NewOrder) -> Self {
        Self {
            id: fields.id.unwrap_or_else(Uuid::new_v4),
            desc: fields.desc,
            spec_uri: fields.spec_uri,
            spec_ref: fields.spec_ref,
            source_uri: fields.source_uri,
            source_args: fields.source_args,
            env: fields.env,
            created: now_rfc2822(),
            assigned: None,
            completed: None,
            worker: None,
        }
    }

    /// Parse an order from a decoded JSON object, ignoring unrecognised
    /// keys (matches `Order.from_obj`'s `obj.keys() & cls.__attrs__`).
    pub fn from_obj(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialise this order to a JSON object in the shape `to_obj` expects.
    pub fn to_obj(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Order always serialises")
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Assign the order to `worker`, returning a new, assigned order.
    pub fn assign(&self, worker: impl Into<String>) -> Result<Self, OrderError> {
        if self.is_assigned() {
            return Err(OrderError::AlreadyAssigned);
        }
        Ok(Self {
            assigned: Some(now_rfc2822()),
            worker: Some(worker.into()),
            ..self.clone()
        })
    }

    /// Unassign the order, clearing `assigned` and `worker`.
    pub fn unassign(&self) -> Result<Self, OrderError> {
        if !self.is_assigned() {
            return Err(OrderError::NotAssigned);
        }
        if self.is_completed() {
            return Err(OrderError::AlreadyCompleted);
        }
        Ok(Self {
            assigned: None,
            worker: None,
            ..self.clone()
        })
    }

    /// Record completion. Idempotent once completed.
    pub fn complete(&self) -> Result<Self, OrderError> {
        if !self.is_assigned() {
            return Err(OrderError::CompleteUnassigned);
        }
        if self.is_completed() {
            return Ok(self.clone());
        }
        Ok(Self {
            completed: Some(now_rfc2822()),
            ..self.clone()
        })
    }
}

fn now_rfc2822() -> String {
    Local::now().to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(NewOrder {
            id: None,
            desc: "test".into(),
            spec_uri: "/fake/local/dir".into(),
            spec_ref: "build0".into(),
            source_uri: "git://example.org/foo/bar".into(),
            source_args: vec!["abcdef0".into()],
            env: BTreeMap::new(),
        })
    }

    #[test]
    fn new_order_is_unassigned_and_incomplete() {
        let o = order();
        assert!(!o.is_assigned());
        assert!(!o.is_completed());
        assert!(o.worker.is_none());
    }

    #[test]
    fn assign_sets_assigned_and_worker() {
        let o = order().assign("bob").unwrap();
        assert!(o.assigned.is_some());
        assert_eq!(o.worker.as_deref(), Some("bob"));
        assert!(!o.is_completed());
    }

    #[test]
    fn assign_twice_is_an_error() {
        let o = order().assign("bob").unwrap();
        assert!(matches!(o.assign("bob"), Err(OrderError::AlreadyAssigned)));
    }

    #[test]
    fn unassign_restores_original_order() {
        let o = order();
        let round_tripped = o.assign("bob").unwrap().unassign().unwrap();
        assert_eq!(o, round_tripped);
    }

    #[test]
    fn unassign_when_not_assigned_is_an_error() {
        assert!(matches!(order().unassign(), Err(OrderError::NotAssigned)));
    }

    #[test]
    fn unassign_when_completed_is_an_error() {
        let o = order().assign("bob").unwrap().complete().unwrap();
        assert!(matches!(o.unassign(), Err(OrderError::AlreadyCompleted)));
    }

    #[test]
    fn complete_when_not_assigned_is_an_error() {
        assert!(matches!(
            order().complete(),
            Err(OrderError::CompleteUnassigned)
        ));
    }

    #[test]
    fn complete_is_idempotent() {
        let o = order().assign("bob").unwrap().complete().unwrap();
        let again = o.complete().unwrap();
        assert_eq!(o, again);
    }

    #[test]
    fn to_obj_from_obj_round_trips() {
        let o = order().assign("bob").unwrap();
        let obj = o.to_obj();
        let back = Order::from_obj(obj).unwrap();
        assert_eq!(o, back);
    }

    #[test]
    fn from_obj_ignores_unrecognised_keys() {
        let mut obj = order().to_obj();
        obj.as_object_mut()
            .unwrap()
            .insert("bogus".into(), serde_json::json!("value"));
        assert!(Order::from_obj(obj).is_ok());
    }
}
