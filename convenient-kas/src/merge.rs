//! Deterministic merging of configuration trees
//!
//! Mappings are merged recursively, anything else is replaced: the value
//! applied last wins per leaf key. Sequences are never concatenated.
//! Keys keep the position they had in `dest`; keys new to `dest` are
//! appended in the order of `update`.

use serde_yaml::{Mapping, Value};

/// Attempt to merge a value that is not a mapping
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Cannot merge using non-mapping value (got {0})")]
pub struct MergeError(pub &'static str);

/// Merge `update` into a copy of `dest`
pub fn merge(dest: &Value, update: &Value) -> Result<Value, MergeError> {
    match (dest, update) {
        (Value::Mapping(dest), Value::Mapping(update)) => {
            Ok(Value::Mapping(merge_mappings(dest, update)))
        }
        (Value::Mapping(_), other) | (other, _) => Err(MergeError(kind_of(other))),
    }
}

/// Merge two mappings, neither input is modified
pub fn merge_mappings(dest: &Mapping, update: &Mapping) -> Mapping {
    let mut merged = dest.clone();
    for (key, value) in update {
        let combined = match (merged.get(key), value) {
            (Some(Value::Mapping(current)), Value::Mapping(incoming)) => {
                Value::Mapping(merge_mappings(current, incoming))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
