//! Script values are plain JSON. Host objects (functions, builtins, the store
//! handle, schema types) are single-key objects tagged with a `$` key.

use serde_json::{json, Map, Value};

use crate::script::parser::literal_number;
use crate::tools::types::{FieldKind, InputSchema, SchemaField};

const FUNCTION_TAG: &str = "$function";
const BUILTIN_TAG: &str = "$builtin";
const HANDLE_TAG: &str = "$handle";
const TYPE_TAG: &str = "$type";
const SCHEMA_TAG: &str = "$schema";
const TOOL_TAG: &str = "$tool";

pub const STORE_HANDLE: &str = "data_store";

fn tagged(tag: &str, payload: Value) -> Value {
    let mut map = Map::new();
    map.insert(tag.to_owned(), payload);
    Value::Object(map)
}

fn tag_of<'a>(value: &'a Value, tag: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    if map.len() == 1 || tag == SCHEMA_TAG {
        map.get(tag)
    } else {
        None
    }
}

pub fn function_ref(name: &str) -> Value {
    tagged(FUNCTION_TAG, json!(name))
}

pub fn builtin_ref(name: &str) -> Value {
    tagged(BUILTIN_TAG, json!(name))
}

pub fn store_handle() -> Value {
    tagged(HANDLE_TAG, json!(STORE_HANDLE))
}

pub fn type_ref(kind: FieldKind) -> Value {
    tagged(TYPE_TAG, json!(kind.as_str()))
}

pub fn tool_value(definition: Value) -> Value {
    tagged(TOOL_TAG, definition)
}

pub fn as_function(value: &Value) -> Option<&str> {
    tag_of(value, FUNCTION_TAG)?.as_str()
}

pub fn as_builtin(value: &Value) -> Option<&str> {
    tag_of(value, BUILTIN_TAG)?.as_str()
}

pub fn as_handle(value: &Value) -> Option<&str> {
    tag_of(value, HANDLE_TAG)?.as_str()
}

pub fn as_type(value: &Value) -> Option<FieldKind> {
    FieldKind::parse(tag_of(value, TYPE_TAG)?.as_str()?)
}

pub fn schema_value(schema: &InputSchema) -> Value {
    let fields: Vec<Value> = schema
        .fields
        .iter()
        .map(|field| {
            json!({
                "name": field.name,
                "type": field.kind.as_str(),
                "description": field.description,
                "required": field.required,
                "default": field.default,
            })
        })
        .collect();
    json!({ SCHEMA_TAG: schema.name, "fields": fields })
}

pub fn as_schema(value: &Value) -> Option<InputSchema> {
    let map = value.as_object()?;
    let name = map.get(SCHEMA_TAG)?.as_str()?;
    let fields = map.get("fields")?.as_array()?;

    let mut schema = InputSchema::new(name);
    for field in fields {
        schema.fields.push(SchemaField {
            name: field.get("name")?.as_str()?.to_owned(),
            kind: FieldKind::parse(field.get("type")?.as_str()?)?,
            description: field
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_owned),
            required: field.get("required")?.as_bool()?,
            default: field.get("default").filter(|value| !value.is_null()).cloned(),
        });
    }
    Some(schema)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(v) => *v,
        Value::Number(v) => v.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(v) => !v.is_empty(),
        Value::Array(v) => !v.is_empty(),
        Value::Object(v) => !v.is_empty(),
        Value::Null => false,
    }
}

pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(v) => v.as_f64(),
        Value::String(v) => v.trim().parse::<f64>().ok(),
        Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Rough footprint of `value` (string and key bytes plus one per slot or
/// scalar) and its nesting depth. Walks without recursion.
pub fn measure(value: &Value) -> (usize, usize) {
    let mut bytes = 0usize;
    let mut depth = 0usize;
    let mut pending = vec![(value, 1usize)];

    while let Some((value, level)) = pending.pop() {
        depth = depth.max(level);
        match value {
            Value::String(text) => bytes = bytes.saturating_add(text.len()),
            Value::Array(items) => {
                bytes = bytes.saturating_add(items.len());
                pending.extend(items.iter().map(|item| (item, level + 1)));
            }
            Value::Object(map) => {
                for (key, item) in map {
                    bytes = bytes.saturating_add(key.len());
                    pending.push((item, level + 1));
                }
            }
            _ => bytes = bytes.saturating_add(1),
        }
    }
    (bytes, depth)
}

pub fn number_to_value(number: f64) -> Value {
    literal_number(number).unwrap_or(Value::Null)
}

pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(v) => Some(v.clone()),
        Value::Number(v) => Some(v.to_string()),
        Value::Bool(v) => Some(v.to_string()),
        _ => None,
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(v) => v.clone(),
        Value::Null => "null".to_owned(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if as_function(value).is_some() => "function",
        Value::Object(_) if as_builtin(value).is_some() => "builtin",
        Value::Object(_) if as_handle(value).is_some() => "handle",
        Value::Object(_) if as_type(value).is_some() => "type",
        Value::Object(_) if as_schema(value).is_some() => "schema",
        Value::Object(_) => "object",
    }
}
