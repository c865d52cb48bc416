//! Structured-response parsing
//!
//! Providers are asked for JSON but frequently wrap it in prose or answer with
//! `key: value` lines instead. [`parse_structured_response`] tries the first
//! embedded JSON object, then falls back to line-oriented extraction. It never
//! fails; fields that cannot be resolved are left out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Primitive type expected for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Field name to expected type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseSchema {
    fields: BTreeMap<String, FieldType>,
}

impl ResponseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn field(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// One-line description used in prompts
    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|(name, ty)| format!("\"{name}\": {}", type_name(*ty)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn type_name(ty: FieldType) -> &'static str {
    match ty {
        FieldType::String => "string",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::Array => "array",
        FieldType::Object => "object",
    }
}

/// Parse `text` against `schema`
pub fn parse_structured_response(text: &str, schema: &ResponseSchema) -> Map<String, Value> {
    if let Some(object) = first_json_object(text) {
        let resolved = resolve_from_object(&object, schema);
        if !resolved.is_empty() {
            return resolved;
        }
    }
    resolve_from_lines(text, schema)
}

/// Every `{` is tried as the start of a balanced object until one parses
fn first_json_object(text: &str) -> Option<Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(map);
            }
        }
        start = open + 1;
    }

    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn resolve_from_object(object: &Map<String, Value>, schema: &ResponseSchema) -> Map<String, Value> {
    let mut resolved = Map::new();

    for (name, ty) in schema.fields() {
        let value = object.get(name).or_else(|| {
            object
                .iter()
                .find(|(key, _)| normalize_key(key) == normalize_key(name))
                .map(|(_, value)| value)
        });

        if let Some(coerced) = value.and_then(|v| coerce_value(v, ty)) {
            resolved.insert(name.to_string(), coerced);
        }
    }

    resolved
}

fn resolve_from_lines(text: &str, schema: &ResponseSchema) -> Map<String, Value> {
    let mut resolved = Map::new();

    for line in text.lines() {
        let Some((raw_key, raw_value)) = line.split_once(':') else {
            continue;
        };

        let key = normalize_key(raw_key.trim().trim_start_matches(['-', '*', '•', ' ']));
        let Some((name, ty)) = schema
            .fields()
            .find(|(name, _)| normalize_key(name) == key)
        else {
            continue;
        };
        if resolved.contains_key(name) {
            continue;
        }

        let value = raw_value
            .trim()
            .trim_end_matches(',')
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        if let Some(coerced) = coerce_text(value, ty) {
            resolved.insert(name.to_string(), coerced);
        }
    }

    resolved
}

/// Case-insensitive, with spaces and hyphens equivalent to underscores
fn normalize_key(key: &str) -> String {
    key.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn coerce_value(value: &Value, ty: FieldType) -> Option<Value> {
    match (ty, value) {
        (FieldType::String, Value::String(_)) => Some(value.clone()),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Number, Value::Number(_)) => Some(value.clone()),
        (FieldType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Array, Value::Array(_)) => Some(value.clone()),
        (FieldType::Object, Value::Object(_)) => Some(value.clone()),
        (_, Value::String(s)) => coerce_text(s, ty),
        _ => None,
    }
}

fn coerce_text(text: &str, ty: FieldType) -> Option<Value> {
    match ty {
        FieldType::String => (!text.is_empty()).then(|| Value::String(text.to_string())),
        FieldType::Number => parse_number(text),
        FieldType::Boolean => match text.to_lowercase().as_str() {
            "true" | "yes" | "y" => Some(Value::Bool(true)),
            "false" | "no" | "n" => Some(Value::Bool(false)),
            _ => None,
        },
        FieldType::Array => {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                return Some(Value::Array(items));
            }
            let items: Vec<Value> = text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        FieldType::Object => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Some(Value::Object(map)),
            _ => None,
        },
    }
}

fn parse_number(text: &str) -> Option<Value> {
    let cleaned = text.trim().trim_end_matches('%').trim();
    if let Ok(integer) = cleaned.parse::<i64>() {
        return Some(Value::Number(integer.into()));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
