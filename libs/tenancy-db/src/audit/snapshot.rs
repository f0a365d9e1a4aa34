use serde::Serialize;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Serialize a model into an audit snapshot with credential-like fields masked.
pub(crate) fn capture<M: Serialize>(model: &M, redacted_fields: &[String]) -> Value {
    let mut value = serde_json::to_value(model).unwrap_or(Value::Null);
    redact(&mut value, redacted_fields);
    value
}

/// Mask every object field whose name contains one of `fragments` (case-insensitive).
pub(crate) fn redact(value: &mut Value, fragments: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                let key = key.to_ascii_lowercase();
                if fragments
                    .iter()
                    .any(|f| key.contains(&f.to_ascii_lowercase()))
                {
                    *field = Value::String(REDACTED.to_owned());
                } else {
                    redact(field, fragments);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, fragments);
            }
        }
        _ => {}
    }
}

/// Keep only the top-level fields that differ between two snapshots.
pub(crate) fn diff(before: &Value, after: &Value) -> (Value, Value) {
    let (Value::Object(b), Value::Object(a)) = (before, after) else {
        return (before.clone(), after.clone());
    };
    let mut changed_before = Map::new();
    let mut changed_after = Map::new();
    for (key, new) in a {
        let old = b.get(key).unwrap_or(&Value::Null);
        if old != new {
            changed_before.insert(key.clone(), old.clone());
            changed_after.insert(key.clone(), new.clone());
        }
    }
    for (key, old) in b {
        if !a.contains_key(key) {
            changed_before.insert(key.clone(), old.clone());
            changed_after.insert(key.clone(), Value::Null);
        }
    }
    (Value::Object(changed_before), Value::Object(changed_after))
}

/// Primary key of a snapshot as text.
pub(crate) fn entity_id(snapshot: &Value, id_field: &str) -> String {
    match snapshot.get(id_field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
