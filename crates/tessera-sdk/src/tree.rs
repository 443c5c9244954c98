//! Addressing inside the shared tree.
//!
//! The tree is an opaque JSON document. Editable nodes are objects carrying
//! a string `"id"`; they may sit at any depth, inside objects or arrays.

use crate::error::{Result, SdkError};
use serde_json::{Map, Value};

pub const FIELD_ID: &str = "id";
pub const FIELD_STATUS: &str = "status";
/// Derived from `status`; kept in sync by [`set_status`].
pub const FIELD_DEVELOPED: &str = "developed";
pub const FIELD_RESOURCES: &str = "resources";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_COURSE_LINK: &str = "courseLink";
pub const FIELD_ASSIGNED: &str = "assigned";
pub const FIELD_DEADLINE: &str = "deadline";

/// The status value that marks a node as developed.
pub const STATUS_DEVELOPED: &str = "developed";

fn is_node(value: &Value, id: &str) -> bool {
    value.get(FIELD_ID).and_then(Value::as_str) == Some(id)
}

/// Find the node with `id` anywhere in `tree` (depth first).
pub fn find_node<'a>(tree: &'a Value, id: &str) -> Option<&'a Value> {
    if is_node(tree, id) {
        return Some(tree);
    }
    match tree {
        Value::Object(fields) => fields.values().find_map(|child| find_node(child, id)),
        Value::Array(items) => items.iter().find_map(|child| find_node(child, id)),
        _ => None,
    }
}

pub fn find_node_mut<'a>(tree: &'a mut Value, id: &str) -> Option<&'a mut Value> {
    if is_node(tree, id) {
        return Some(tree);
    }
    match tree {
        Value::Object(fields) => fields.values_mut().find_map(|child| find_node_mut(child, id)),
        Value::Array(items) => items.iter_mut().find_map(|child| find_node_mut(child, id)),
        _ => None,
    }
}

/// The fields of node `id`, or `TargetNotFound`.
pub fn node_fields_mut<'a>(tree: &'a mut Value, id: &str) -> Result<&'a mut Map<String, Value>> {
    find_node_mut(tree, id)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| SdkError::TargetNotFound(id.to_string()))
}

/// Read one field of node `id`. Absent fields read as `Null`.
pub fn field(tree: &Value, id: &str, field: &str) -> Result<Value> {
    let node = find_node(tree, id).ok_or_else(|| SdkError::TargetNotFound(id.to_string()))?;
    Ok(node.get(field).cloned().unwrap_or(Value::Null))
}

/// Write one field and return the previous value (`Null` if absent).
/// Writing `Null` removes the field.
pub fn set_field(node: &mut Map<String, Value>, field: &str, value: Value) -> Value {
    let previous = if value.is_null() {
        node.remove(field)
    } else {
        node.insert(field.to_string(), value)
    };
    previous.unwrap_or(Value::Null)
}

/// Status and `developed` flag of a node, `Null` where absent.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusFields {
    pub status: Value,
    pub developed: Value,
}

/// Set `status` and the `developed` flag together and return what was there.
///
/// With `developed = None` the flag is derived from the status; otherwise
/// the given value is written as-is (`Null` removes the flag).
pub fn set_status(node: &mut Map<String, Value>, status: Value, developed: Option<Value>) -> StatusFields {
    let developed =
        developed.unwrap_or_else(|| Value::Bool(status.as_str() == Some(STATUS_DEVELOPED)));
    StatusFields {
        status: set_field(node, FIELD_STATUS, status),
        developed: set_field(node, FIELD_DEVELOPED, developed),
    }
}

/// The node's resource list, created empty if absent.
pub fn resources_mut<'a>(node: &'a mut Map<String, Value>, id: &str) -> Result<&'a mut Vec<Value>> {
    node.entry(FIELD_RESOURCES)
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| SdkError::InvalidTree(format!("{id}.{FIELD_RESOURCES} is not an array")))
}

/// Collect the ids of every addressable node, in document order.
pub fn node_ids(tree: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        if let Some(id) = value.get(FIELD_ID).and_then(Value::as_str) {
            out.push(id.to_string());
        }
        match value {
            Value::Object(fields) => fields.values().for_each(|child| walk(child, out)),
            Value::Array(items) => items.iter().for_each(|child| walk(child, out)),
            _ => {}
        }
    }
    let mut ids = Vec::new();
    walk(tree, &mut ids);
    ids
}
