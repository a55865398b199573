//! Client → server commands (spec.md Section 4.3).
//!
//! Command name lookup is case-insensitive; a numeric command identifier
//! is stringified before lookup (spec.md: "applies `str(...)` to numeric
//! command identifiers"). Unknown command names are `ClientError`s;
//! malformed `params` are `ParamError`s.

use serde_json::Value;
use uuid::Uuid;

use crate::order::Order;
use crate::wire::error::WireError;
use crate::wire::event::Event;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe { events: Vec<String> },
    Unsubscribe,
    OrderCreate { order: Order },
    OrderAssign,
    OrderComplete { order_id: Uuid },
    /// Declared but unimplemented (spec.md Section 4.3, Section 9).
    OrderUnassign,
    /// Declared but unimplemented (spec.md Section 4.3, Section 9).
    OrderCancel,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "Subscribe",
            Command::Unsubscribe => "Unsubscribe",
            Command::OrderCreate { .. } => "OrderCreate",
            Command::OrderAssign => "OrderAssign",
            Command::OrderComplete { .. } => "OrderComplete",
            Command::OrderUnassign => "OrderUnassign",
            Command::OrderCancel => "OrderCancel",
        }
    }

    /// Parse a client frame: `{"command": ..., "params": {...}}`.
    pub fn parse(frame: &Value) -> Result<Command, WireError> {
        let obj = frame
            .as_object()
            .ok_or_else(|| WireError::client("Frame must be a JSON object."))?;

        let command_value = obj
            .get("command")
            .ok_or_else(|| WireError::client("No command given."))?;

        let name = match command_value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(WireError::client(format!(
                    "Command name must be a string or number, got {other}"
                )))
            }
        };

        let empty = Value::Object(serde_json::Map::new());
        let params = obj.get("params").unwrap_or(&empty);

        match name.to_lowercase().as_str() {
            "subscribe" => parse_subscribe(params),
            "unsubscribe" => Ok(Command::Unsubscribe),
            "ordercreate" => parse_order_create(params),
            "orderassign" => Ok(Command::OrderAssign),
            "ordercomplete" => parse_order_complete(params),
            "orderunassign" => Ok(Command::OrderUnassign),
            "ordercancel" => Ok(Command::OrderCancel),
            _ => Err(WireError::client(format!("Unknown command: {name:?}"))),
        }
    }
}

fn parse_subscribe(params: &Value) -> Result<Command, WireError> {
    let events = params
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| WireError::param("`events` must be a list of event names."))?;

    let events = events
        .iter()
        .map(|v| {
            let name = v
                .as_str()
                .ok_or_else(|| WireError::param("`events` entries must be strings."))?;
            if !Event::registered_names().contains(&name) {
                return Err(WireError::param(format!("unknown event: {name:?}")));
            }
            Ok(name.to_string())
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Command::Subscribe { events })
}

fn parse_order_create(params: &Value) -> Result<Command, WireError> {
    let order_obj = params
        .get("order")
        .ok_or_else(|| WireError::param("`order` parameter is required."))?;
    let order = Order::from_obj(order_obj.clone())
        .map_err(|e| WireError::param(format!("malformed order: {e}")))?;
    Ok(Command::OrderCreate { order })
}

fn parse_order_complete(params: &Value) -> Result<Command, WireError> {
    let raw = params
        .get("order_id")
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::param("`order_id` parameter is required."))?;
    let order_id = Uuid::parse_str(raw)
        .map_err(|e| WireError::param(format!("malformed order_id: {e}")))?;
    Ok(Command::OrderComplete { order_id })
}
