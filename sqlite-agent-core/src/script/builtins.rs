use regex::Regex;
use serde_json::{Map, Value};

use crate::script::value::{
    as_string, measure, number_to_value, to_number, type_name, value_to_string,
};
use crate::tools::output::Table;

pub const MAX_STRING_BYTES: usize = 1 << 20;
pub const MAX_ARRAY_LEN: usize = 100_000;
/// Limit on the total footprint of one value, as counted by `measure`.
pub const MAX_VALUE_BYTES: usize = 4 << 20;
pub const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinError {
    /// Wrong arguments or an unknown function.
    Invalid(String),
    /// The result would not fit the value limits; nothing was built.
    TooLarge(String),
}

impl From<String> for BuiltinError {
    fn from(message: String) -> Self {
        Self::Invalid(message)
    }
}

/// Builtins that need the host (store, extraction) or the interpreter
/// (`structured_tool`) rather than plain values.
pub const HOST_BUILTINS: [&str; 4] = [
    "data_store",
    "extract_user",
    "extract_product",
    "structured_tool",
];

pub const PURE_BUILTINS: [&str; 25] = [
    "upper",
    "lower",
    "trim",
    "split",
    "join",
    "replace",
    "length",
    "abs",
    "floor",
    "ceil",
    "round",
    "first",
    "last",
    "sum",
    "min",
    "max",
    "keys",
    "values",
    "get",
    "has",
    "to_string",
    "to_number",
    "type",
    "format_table",
    "push",
];

pub fn is_pure_builtin(name: &str) -> bool {
    PURE_BUILTINS.contains(&name)
}

pub fn call_pure(name: &str, args: &[Value]) -> Result<Value, BuiltinError> {
    if name == "format_table" {
        let table = Table::from_objects(required_arg_as_array(name, args, 0)?);
        let bytes = table.rendered_len();
        if bytes > MAX_STRING_BYTES {
            return Err(too_large(name, bytes, MAX_STRING_BYTES, "bytes"));
        }
        return Ok(Value::String(table.render()));
    }
    ensure_result_fits(name, args)?;
    evaluate(name, args).map_err(BuiltinError::Invalid)
}

fn too_large(name: &str, size: usize, limit: usize, unit: &str) -> BuiltinError {
    BuiltinError::TooLarge(format!(
        "'{name}' would produce {size} {unit}; the limit is {limit}"
    ))
}

/// Projects the size of results that can outgrow their inputs and rejects
/// the call before anything is allocated.
fn ensure_result_fits(name: &str, args: &[Value]) -> Result<(), BuiltinError> {
    let (size, limit, unit) = match name {
        "replace" => (replaced_len(args), MAX_STRING_BYTES, "bytes"),
        "join" => (joined_len(args), MAX_STRING_BYTES, "bytes"),
        "split" => (split_count(args), MAX_ARRAY_LEN, "items"),
        "push" => (pushed_footprint(args), MAX_VALUE_BYTES, "bytes"),
        _ => return Ok(()),
    };
    match size {
        Some(size) if size > limit => Err(too_large(name, size, limit, unit)),
        _ => Ok(()),
    }
}

fn replaced_len(args: &[Value]) -> Option<usize> {
    let text = as_string(args.first()?)?;
    let from = as_string(args.get(1)?)?;
    let to = as_string(args.get(2)?)?;
    let occurrences = if from.is_empty() {
        text.chars().count() + 1
    } else {
        text.matches(from.as_str()).count()
    };
    let kept = text.len() - occurrences * from.len();
    Some(kept.saturating_add(occurrences.saturating_mul(to.len())))
}

fn joined_len(args: &[Value]) -> Option<usize> {
    let items = args.first()?.as_array()?;
    let delimiter = args.get(1).and_then(as_string).unwrap_or_default();
    let mut total = delimiter
        .len()
        .saturating_mul(items.len().saturating_sub(1));
    for item in items {
        let len = match item {
            Value::String(text) => text.len(),
            other => value_to_string(other).len(),
        };
        total = total.saturating_add(len);
        if total > MAX_STRING_BYTES {
            break;
        }
    }
    Some(total)
}

fn split_count(args: &[Value]) -> Option<usize> {
    let text = as_string(args.first()?)?;
    let delimiter = as_string(args.get(1)?)?;
    Some(if delimiter.is_empty() {
        text.chars().count() + 2
    } else {
        text.matches(delimiter.as_str()).count() + 1
    })
}

fn pushed_footprint(args: &[Value]) -> Option<usize> {
    let items = args.first()?;
    let item = args.get(1)?;
    Some(measure(items).0.saturating_add(measure(item).0))
}

fn evaluate(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "upper" => one_string_arg(name, args, |v| Value::String(v.to_uppercase())),
        "lower" => one_string_arg(name, args, |v| Value::String(v.to_lowercase())),
        "trim" => one_string_arg(name, args, |v| Value::String(v.trim().to_owned())),
        "split" => {
            let text = required_arg_as_string(name, args, 0)?;
            let delimiter = required_arg_as_string(name, args, 1)?;
            Ok(Value::Array(
                text.split(&delimiter)
                    .map(|item| Value::String(item.to_owned()))
                    .collect(),
            ))
        }
        "join" => {
            let items = required_arg_as_array(name, args, 0)?;
            let delimiter = args.get(1).and_then(as_string).unwrap_or_default();
            Ok(Value::String(
                items
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(&delimiter),
            ))
        }
        "replace" => {
            let text = required_arg_as_string(name, args, 0)?;
            let from = required_arg_as_string(name, args, 1)?;
            let to = required_arg_as_string(name, args, 2)?;
            Ok(Value::String(text.replace(&from, &to)))
        }
        "length" => {
            let value = required_arg(name, args, 0)?;
            Ok(number_to_value(match value {
                Value::Array(items) => items.len() as f64,
                Value::Object(map) => map.len() as f64,
                Value::String(text) => text.chars().count() as f64,
                Value::Null => 0.0,
                _ => 1.0,
            }))
        }
        "abs" => one_number_arg(name, args, f64::abs),
        "floor" => one_number_arg(name, args, f64::floor),
        "ceil" => one_number_arg(name, args, f64::ceil),
        "round" => {
            let value = required_arg_as_number(name, args, 0)?;
            let digits = args.get(1).and_then(to_number).unwrap_or(0.0).clamp(0.0, 12.0);
            let scale = 10f64.powi(digits as i32);
            Ok(number_to_value((value * scale).round() / scale))
        }
        "first" => Ok(required_arg_as_array(name, args, 0)?
            .first()
            .cloned()
            .unwrap_or(Value::Null)),
        "last" => Ok(required_arg_as_array(name, args, 0)?
            .last()
            .cloned()
            .unwrap_or(Value::Null)),
        "sum" => {
            let items = required_arg_as_array(name, args, 0)?;
            Ok(number_to_value(items.iter().filter_map(to_number).sum::<f64>()))
        }
        "min" => {
            let items = required_arg_as_array(name, args, 0)?;
            let min = items.iter().filter_map(to_number).reduce(f64::min);
            Ok(min.map(number_to_value).unwrap_or(Value::Null))
        }
        "max" => {
            let items = required_arg_as_array(name, args, 0)?;
            let max = items.iter().filter_map(to_number).reduce(f64::max);
            Ok(max.map(number_to_value).unwrap_or(Value::Null))
        }
        "keys" => {
            let map = required_arg_as_object(name, args, 0)?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        "values" => {
            let map = required_arg_as_object(name, args, 0)?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        "get" => {
            let key = required_arg_as_string(name, args, 1)?;
            let fallback = args.get(2).cloned().unwrap_or(Value::Null);
            Ok(match required_arg(name, args, 0)? {
                Value::Object(map) => map.get(&key).cloned().unwrap_or(fallback),
                Value::Null => fallback,
                other => {
                    return Err(format!(
                        "function 'get' argument 1 must be object, got {}",
                        type_name(other)
                    ))
                }
            })
        }
        "has" => {
            let map = required_arg_as_object(name, args, 0)?;
            let key = required_arg_as_string(name, args, 1)?;
            Ok(Value::Bool(map.contains_key(&key)))
        }
        "to_string" => Ok(Value::String(value_to_string(
            args.first().unwrap_or(&Value::Null),
        ))),
        "to_number" => Ok(args
            .first()
            .and_then(to_number)
            .map(number_to_value)
            .unwrap_or(Value::Null)),
        "type" => Ok(Value::String(
            type_name(args.first().unwrap_or(&Value::Null)).to_owned(),
        )),
        "push" => {
            let mut items = required_arg_as_array(name, args, 0)?.to_vec();
            items.push(required_arg(name, args, 1)?.clone());
            Ok(Value::Array(items))
        }
        _ => Err(format!("unknown function '{name}'")),
    }
}

pub fn regex_match(text: &Value, pattern: &Value) -> Result<bool, String> {
    let text = as_string(text).ok_or("left side of matches must be string")?;
    let pattern = as_string(pattern).ok_or("right side of matches must be regex string")?;
    let regex = Regex::new(&pattern).map_err(|err| format!("invalid regex '{pattern}': {err}"))?;
    Ok(regex.is_match(&text))
}

pub fn contains_value(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
        (Value::Array(items), value) => items.iter().any(|item| item == value),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn required_arg<'a>(fn_name: &str, args: &'a [Value], index: usize) -> Result<&'a Value, String> {
    args.get(index)
        .ok_or_else(|| format!("function '{fn_name}' expects argument {}", index + 1))
}

fn one_string_arg<F>(name: &str, args: &[Value], transform: F) -> Result<Value, String>
where
    F: FnOnce(String) -> Value,
{
    Ok(transform(required_arg_as_string(name, args, 0)?))
}

fn one_number_arg<F>(name: &str, args: &[Value], transform: F) -> Result<Value, String>
where
    F: FnOnce(f64) -> f64,
{
    Ok(number_to_value(transform(required_arg_as_number(
        name, args, 0,
    )?)))
}

fn required_arg_as_array<'a>(
    fn_name: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a [Value], String> {
    required_arg(fn_name, args, index)?
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| format!("function '{fn_name}' argument {} must be array", index + 1))
}

fn required_arg_as_object<'a>(
    fn_name: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a Map<String, Value>, String> {
    required_arg(fn_name, args, index)?
        .as_object()
        .ok_or_else(|| format!("function '{fn_name}' argument {} must be object", index + 1))
}

fn required_arg_as_string(fn_name: &str, args: &[Value], index: usize) -> Result<String, String> {
    as_string(required_arg(fn_name, args, index)?).ok_or_else(|| {
        format!(
            "function '{fn_name}' argument {} must be string-compatible",
            index + 1
        )
    })
}

fn required_arg_as_number(fn_name: &str, args: &[Value], index: usize) -> Result<f64, String> {
    to_number(required_arg(fn_name, args, index)?).ok_or_else(|| {
        format!(
            "function '{fn_name}' argument {} must be number-compatible",
            index + 1
        )
    })
}
