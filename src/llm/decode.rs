use crate::llm::openai::ResponseBody;
use crate::schema::is_schema_valid;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const NESTED_SEARCH_DEPTH: usize = 4;

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fence regex"));

/// What could be recovered from one generation reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded {
    /// Best object found, schema-valid if any candidate was.
    pub candidate: Option<Value>,
    pub raw_text: String,
}

pub fn decode(body: &ResponseBody) -> Decoded {
    match body {
        ResponseBody::Parsed(value) => {
            let raw_text = value.to_string();
            if is_schema_valid(value) {
                return Decoded {
                    candidate: Some(value.clone()),
                    raw_text,
                };
            }
            let candidate = find_nested(value, NESTED_SEARCH_DEPTH)
                .or_else(|| extract_object(&raw_text))
                .or_else(|| value.is_object().then(|| value.clone()));
            Decoded {
                candidate,
                raw_text,
            }
        }
        ResponseBody::Text(text) => Decoded {
            candidate: extract_object(text),
            raw_text: text.clone(),
        },
        ResponseBody::Segments(segments) => {
            let raw_text = segments.iter().map(segment_text).collect::<String>();
            let candidate = segments
                .iter()
                .find_map(|segment| structured_segment(segment).filter(|v| is_schema_valid(v)))
                .or_else(|| extract_object(&raw_text));
            Decoded {
                candidate,
                raw_text,
            }
        }
    }
}

/// Recovers a JSON object from free text: direct parse, fenced blocks, then
/// brace-balanced spans. A schema-valid object wins over the first object seen.
pub fn extract_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut objects = Vec::new();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        objects.push(unwrap_stringified(value));
    }
    for capture in FENCED.captures_iter(trimmed) {
        if let Some(inner) = capture.get(1)
            && let Ok(value) = serde_json::from_str::<Value>(inner.as_str().trim())
        {
            objects.push(unwrap_stringified(value));
        }
    }
    for span in balanced_spans(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            objects.push(value);
        }
    }

    if let Some(valid) = objects.iter().find(|v| is_schema_valid(v)) {
        return Some(valid.clone());
    }
    if let Some(nested) = objects
        .iter()
        .find_map(|v| find_nested(v, NESTED_SEARCH_DEPTH))
    {
        return Some(nested);
    }
    objects.into_iter().find(Value::is_object)
}

/// A JSON string whose content is itself a JSON object.
fn unwrap_stringified(value: Value) -> Value {
    match &value {
        Value::String(inner) => serde_json::from_str::<Value>(inner.trim())
            .ok()
            .filter(Value::is_object)
            .unwrap_or(value),
        _ => value,
    }
}

/// Top-level `{...}` spans, skipping braces inside string literals.
fn balanced_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(begin) = start.take()
                {
                    spans.push(&text[begin..=index]);
                }
            }
            _ => {}
        }
    }
    spans
}

/// Schema-valid object nested under arbitrary keys or array items.
fn find_nested(value: &Value, depth: usize) -> Option<Value> {
    if is_schema_valid(value) {
        return Some(value.clone());
    }
    if depth == 0 {
        return None;
    }
    match value {
        Value::Object(map) => map.values().find_map(|v| find_nested(v, depth - 1)),
        Value::Array(items) => items.iter().find_map(|v| find_nested(v, depth - 1)),
        Value::String(inner) if inner.trim_start().starts_with('{') => {
            serde_json::from_str::<Value>(inner)
                .ok()
                .and_then(|v| find_nested(&v, depth - 1))
        }
        _ => None,
    }
}

fn structured_segment(segment: &Value) -> Option<Value> {
    ["parsed", "json"]
        .iter()
        .find_map(|key| segment.get(*key).filter(|v| v.is_object()).cloned())
}

fn segment_text(segment: &Value) -> String {
    match segment {
        Value::String(text) => text.clone(),
        Value::Object(map) => {
            for key in ["text", "output_text"] {
                if let Some(text) = map.get(key).and_then(Value::as_str) {
                    return text.to_string();
                }
            }
            for key in ["json", "parsed"] {
                if let Some(value) = map.get(key).filter(|v| !v.is_null()) {
                    return value.to_string();
                }
            }
            match map.get("content") {
                Some(Value::Array(inner)) => inner.iter().map(segment_text).collect(),
                Some(Value::String(text)) => text.clone(),
                _ => String::new(),
            }
        }
        _ => String::new(),
    }
}
