//! JSON Schema dialect adjustment for function parameters and structured output.
//!
//! Clients write OpenAI-flavoured schemas (`strict`, `additionalProperties: false`
//! on every object); the upstream rejects both. Schemas only ever flow outbound.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDirection {
    ToUpstream,
    ToClient,
}

/// Adjust a schema tree in place and hand it back.
///
/// `ToUpstream` drops a root-level `strict` flag and every
/// `additionalProperties: false` sitting on an object node that declares
/// `properties`. `ToClient` leaves the tree untouched.
pub fn adjust_schema(mut schema: Value, direction: SchemaDirection) -> Value {
    if direction == SchemaDirection::ToClient {
        return schema;
    }

    if let Some(root) = schema.as_object_mut() {
        root.remove("strict");
    }
    adjust_node(&mut schema);
    schema
}

fn adjust_node(node: &mut Value) {
    match node {
        Value::Array(items) => items.iter_mut().for_each(adjust_node),
        Value::Object(map) => {
            let closed_object = map.get("type").and_then(Value::as_str) == Some("object")
                && map.get("properties").is_some_and(Value::is_object)
                && map.get("additionalProperties") == Some(&Value::Bool(false));
            if closed_object {
                map.remove("additionalProperties");
            }
            map.values_mut().for_each(adjust_node);
        }
        _ => {}
    }
}
