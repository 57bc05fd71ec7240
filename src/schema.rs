use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use thiserror::Error;

pub const TITLE_MAX_CHARS: usize = 100;
pub const BULLET_COUNT: usize = 6;
pub const BULLET_MAX_CHARS: usize = 120;
pub const KEYWORD_COUNT: usize = 20;

/// The rewrite handed back to callers. List lengths are fixed by the type;
/// title length and tone are requested of the generator, not re-checked here.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewritePayload {
    pub title: String,
    pub bullets: [String; BULLET_COUNT],
    pub keywords: [String; KEYWORD_COUNT],
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("output is not an object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is not a string")]
    NotAString(&'static str),
    #[error("field `{0}` is not a list")]
    NotAList(&'static str),
    #[error("field `{field}` has {found} items, expected {expected}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("field `{field}` item {index} is not text")]
    InvalidItem { field: &'static str, index: usize },
}

pub fn validate(value: &Value) -> Result<RewritePayload, SchemaViolation> {
    let object = value.as_object().ok_or(SchemaViolation::NotAnObject)?;

    let title = match object.get("title") {
        None | Some(Value::Null) => return Err(SchemaViolation::MissingField("title")),
        Some(Value::String(title)) => title.clone(),
        Some(_) => return Err(SchemaViolation::NotAString("title")),
    };
    let bullets = fixed_list::<BULLET_COUNT>(object.get("bullets"), "bullets")?;
    let keywords = fixed_list::<KEYWORD_COUNT>(object.get("keywords"), "keywords")?;
    let description = object
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RewritePayload {
        title,
        bullets,
        keywords,
        description,
    })
}

pub fn is_schema_valid(value: &Value) -> bool {
    validate(value).is_ok()
}

fn fixed_list<const N: usize>(
    value: Option<&Value>,
    field: &'static str,
) -> Result<[String; N], SchemaViolation> {
    let items = match value {
        None | Some(Value::Null) => return Err(SchemaViolation::MissingField(field)),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(SchemaViolation::NotAList(field)),
    };
    if items.len() != N {
        return Err(SchemaViolation::WrongLength {
            field,
            expected: N,
            found: items.len(),
        });
    }
    let strings = items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(SchemaViolation::InvalidItem { field, index }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    <[String; N]>::try_from(strings).map_err(|rest| SchemaViolation::WrongLength {
        field,
        expected: N,
        found: rest.len(),
    })
}

/// JSON schema sent with the strict declaration level.
pub fn strict_json_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["title", "bullets", "keywords"],
        "properties": {
            "title": {"type": "string", "maxLength": TITLE_MAX_CHARS},
            "bullets": {
                "type": "array",
                "minItems": BULLET_COUNT,
                "maxItems": BULLET_COUNT,
                "items": {"type": "string", "maxLength": BULLET_MAX_CHARS}
            },
            "keywords": {
                "type": "array",
                "minItems": KEYWORD_COUNT,
                "maxItems": KEYWORD_COUNT,
                "items": {"type": "string"}
            }
        }
    })
}

/// Literal shape used in guard and repair instructions.
pub fn shape_hint() -> String {
    let bullets = vec!["…"; BULLET_COUNT];
    let keywords = (1..=KEYWORD_COUNT).map(|i| format!("k{i}")).collect::<Vec<_>>();
    json!({"title": "…", "bullets": bullets, "keywords": keywords}).to_string()
}

#[cfg(test)]
pub(crate) fn sample_payload_value() -> Value {
    json!({
        "title": "Тайская зубная паста Rasyan с гвоздикой",
        "bullets": (1..=BULLET_COUNT).map(|i| format!("Буллит {i}")).collect::<Vec<_>>(),
        "keywords": (1..=KEYWORD_COUNT).map(|i| format!("ключ {i}")).collect::<Vec<_>>(),
    })
}
