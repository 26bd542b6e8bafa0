//! Placeholder substitution for URL and payload templates.
//!
//! Placeholders are `{name}` tokens. A token whose name is absent from the
//! value map is left verbatim. Nothing here performs I/O or mutates its inputs.

use crate::config::{FieldType, InputField, Values};
use regex::{Captures, Regex};
use serde_json::{Number, Value};
use std::sync::LazyLock;

pub const DATA_FIELDS_TOKEN: &str = "{dataFields}";
pub const VALUES_ARRAY_TOKEN: &str = "{valuesArray}";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern is valid")
});

/// Inputs needed to expand a payload template.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub values: &'a Values,
    pub data_fields: &'a [&'a InputField],
    pub input_values: &'a Values,
}

/// Substitutes placeholders with percent-encoded values.
pub fn resolve_url(template: &str, values: &Values) -> String {
    substitute(template, values, true)
}

/// Substitutes placeholders with raw text values.
pub fn resolve_text(template: &str, values: &Values) -> String {
    substitute(template, values, false)
}

pub fn resolve_payload(template: &Value, context: &PayloadContext<'_>) -> Value {
    match template {
        Value::String(text) if text == DATA_FIELDS_TOKEN => Value::Object(build_data_fields(
            context.data_fields,
            context.input_values,
        )),
        Value::String(text) if text == VALUES_ARRAY_TOKEN => Value::Array(build_values_array(
            context.data_fields,
            context.input_values,
        )),
        Value::String(text) => Value::String(resolve_text(text, context.values)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_payload(item, context))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), resolve_payload(value, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Data-field values that are set and not `""`, coerced by field type.
///
/// `false`, `0` and `null` are sent as-is so an update can clear a field.
pub fn build_data_fields(data_fields: &[&InputField], input_values: &Values) -> Values {
    let mut data = Values::new();
    for field in data_fields {
        match input_values.get(&field.key) {
            None => {}
            Some(Value::String(text)) if text.is_empty() => {}
            Some(value) => {
                data.insert(field.key.clone(), coerce(field.field_type, value));
            }
        }
    }
    data
}

/// One entry per data field in declared order; `""` stands in for missing or
/// `null` values. `false` and `0` are kept.
pub fn build_values_array(data_fields: &[&InputField], input_values: &Values) -> Vec<Value> {
    data_fields
        .iter()
        .map(|field| match input_values.get(&field.key) {
            None | Some(Value::Null) => Value::String(String::new()),
            Some(value) => value.clone(),
        })
        .collect()
}

/// `null`, `""` and `false` count as "not filled in" for required-field checks.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Bool(flag) => !flag,
        _ => false,
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

fn substitute(template: &str, values: &Values, encode: bool) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &Captures<'_>| {
            let whole = captures.get(0).map_or("", |m| m.as_str());
            let name = captures.get(1).map_or("", |m| m.as_str());
            match values.get(name) {
                Some(value) if encode => urlencoding::encode(&value_to_text(value)).into_owned(),
                Some(value) => value_to_text(value),
                None => whole.to_string(),
            }
        })
        .into_owned()
}

fn coerce(field_type: FieldType, value: &Value) -> Value {
    match field_type {
        FieldType::Number => match value {
            Value::String(text) => parse_number(text).unwrap_or_else(|| value.clone()),
            _ => value.clone(),
        },
        FieldType::Json => match value {
            Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.clone()),
            _ => value.clone(),
        },
        FieldType::Text
        | FieldType::Textarea
        | FieldType::Checkbox
        | FieldType::DynamicDropdown
        | FieldType::KeyValue
        | FieldType::Email
        | FieldType::Password
        | FieldType::Date
        | FieldType::Url
        | FieldType::Tel => value.clone(),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Some(Value::from(integer));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
