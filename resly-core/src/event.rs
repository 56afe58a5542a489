use std::collections::HashMap;

use serde_json::Value;

use crate::resource::Resource;

/// Event names with framework-defined semantics. Custom events must not
/// collide with these; the reserved ones are emitted through their
/// dedicated methods.
const RESERVED_EVENTS: &[&str] = &[
    "change",
    "add",
    "remove",
    "delete",
    "create",
    "patch",
    "reaccess",
    "unsubscribe",
    "query",
];

/// Validates a custom event name: a single printable-ASCII token that is
/// not reserved.
pub(crate) fn validate_event_name(name: &str) -> Result<(), String> {
    if RESERVED_EVENTS.contains(&name) {
        return Err(format!("{name:?} is a reserved event name"));
    }
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b) && !matches!(b, b'.' | b'?' | b'*' | b'>'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid event name {name:?}"))
    }
}

/// An event observed by a listener, delivered synchronously on the
/// emitting group's worker after the event is published.
///
/// Which fields are set depends on the event:
///
/// - `change`: `new_values` holds the published changes; `old_values` holds
///   the reverse map when an apply hook produced one.
/// - `add`: `value` and `idx`.
/// - `remove`: `idx`, and `value` when an apply hook returned the removed
///   value.
/// - `create` / `delete`: `data`.
/// - custom events: `payload`.
/// - `reaccess`: name only.
#[derive(Clone)]
pub struct ResourceEvent {
    pub resource: Resource,
    pub name: String,
    pub new_values: Option<HashMap<String, Value>>,
    pub old_values: Option<HashMap<String, Value>>,
    pub value: Option<Value>,
    pub idx: Option<usize>,
    pub data: Option<Value>,
    pub payload: Option<Value>,
}

impl ResourceEvent {
    pub(crate) fn new(resource: Resource, name: impl Into<String>) -> Self {
        ResourceEvent {
            resource,
            name: name.into(),
            new_values: None,
            old_values: None,
            value: None,
            idx: None,
            data: None,
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_rejected() {
        for name in ["change", "add", "remove", "create", "delete", "patch", "reaccess", "unsubscribe", "query"] {
            assert!(validate_event_name(name).is_err(), "{name} should be reserved");
        }
    }

    #[test]
    fn custom_names_validated() {
        assert!(validate_event_name("played").is_ok());
        assert!(validate_event_name("custom_event").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("two.tokens").is_err());
        assert!(validate_event_name("sp ace").is_err());
        assert!(validate_event_name("star*").is_err());
    }
}
