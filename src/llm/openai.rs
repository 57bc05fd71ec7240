use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;
const CAPABILITY_MARKERS: &[&str] = &[
    "response_format",
    "json_schema",
    "text.format",
    "structured output",
    "structured_output",
];

/// Generation output as the provider delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Object already parsed by the provider.
    Parsed(Value),
    Text(String),
    /// Heterogeneous content segments, in order.
    Segments(Vec<Value>),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("missing OPENAI_API_KEY")]
    MissingApiKey,
    /// The model refused the requested output declaration.
    #[error("{model} rejected the output declaration: {message}")]
    Capability { model: String, message: String },
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("empty output")]
    EmptyOutput,
}

/// Two call shapes of the generation API. The body is already shaped by
/// the request builder; transports only deliver it.
#[async_trait]
pub trait GenerationTransport: Send + Sync {
    async fn chat(&self, body: &Value, timeout: Duration) -> Result<ResponseBody, TransportError>;
    async fn respond(&self, body: &Value, timeout: Duration)
    -> Result<ResponseBody, TransportError>;
}

pub struct OpenAiTransport {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value, TransportError> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(TransportError::MissingApiKey)?;
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| classify_reqwest(err, timeout))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest(err, timeout))?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(TransportError::InvalidResponse(format!(
                "response too large: {} bytes",
                bytes.len()
            )));
        }
        let text = String::from_utf8_lossy(&bytes);

        if !status.is_success() {
            let message = error_message(&text);
            if is_capability_rejection(status.as_u16(), &message) {
                return Err(TransportError::Capability { model, message });
            }
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|err| TransportError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl GenerationTransport for OpenAiTransport {
    async fn chat(&self, body: &Value, timeout: Duration) -> Result<ResponseBody, TransportError> {
        let payload = self.post("/chat/completions", body, timeout).await?;
        parse_chat(&payload)
    }

    async fn respond(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<ResponseBody, TransportError> {
        let payload = self.post("/responses", body, timeout).await?;
        parse_responses(&payload)
    }
}

fn classify_reqwest(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout.as_millis() as u64)
    } else {
        TransportError::Request(err.to_string())
    }
}

fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| text.chars().take(500).collect())
}

/// A 400/422 naming the output declaration means the model cannot honour it.
pub fn is_capability_rejection(status: u16, message: &str) -> bool {
    if status != 400 && status != 422 {
        return false;
    }
    let lowered = message.to_lowercase();
    CAPABILITY_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn parse_chat(payload: &Value) -> Result<ResponseBody, TransportError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| TransportError::InvalidResponse("missing choices[0].message".into()))?;

    if let Some(parsed) = message.get("parsed").filter(|v| v.is_object()) {
        return Ok(ResponseBody::Parsed(parsed.clone()));
    }
    match message.get("content") {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(ResponseBody::Text(text.clone())),
        Some(Value::Array(parts)) if !parts.is_empty() => Ok(ResponseBody::Segments(parts.clone())),
        _ => match message.get("refusal").and_then(Value::as_str) {
            Some(refusal) => Err(TransportError::InvalidResponse(format!("refusal: {refusal}"))),
            None => Err(TransportError::EmptyOutput),
        },
    }
}

pub fn parse_responses(payload: &Value) -> Result<ResponseBody, TransportError> {
    if let Some(parsed) = payload.get("output_parsed").filter(|v| v.is_object()) {
        return Ok(ResponseBody::Parsed(parsed.clone()));
    }
    if let Some(text) = payload
        .get("output_text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
    {
        return Ok(ResponseBody::Text(text.to_string()));
    }
    let segments = payload
        .get("output")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .flat_map(|item| match item.get("content") {
                    Some(Value::Array(content)) => content.clone(),
                    _ => Vec::new(),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if segments.is_empty() {
        return Err(TransportError::EmptyOutput);
    }
    Ok(ResponseBody::Segments(segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capability_rejection_needs_status_and_marker() {
        assert!(is_capability_rejection(
            400,
            "Invalid parameter: 'response_format' of type 'json_schema' is not supported with this model."
        ));
        assert!(is_capability_rejection(422, "text.format is unsupported"));
        assert!(!is_capability_rejection(500, "response_format"));
        assert!(!is_capability_rejection(400, "context length exceeded"));
    }

    #[test]
    fn chat_prefers_parsed_then_content() {
        let parsed = json!({"choices": [{"message": {"parsed": {"title": "x"}, "content": "{}"}}]});
        assert_eq!(
            parse_chat(&parsed).expect("parsed"),
            ResponseBody::Parsed(json!({"title": "x"}))
        );

        let text = json!({"choices": [{"message": {"content": "{\"title\":\"x\"}"}}]});
        assert_eq!(
            parse_chat(&text).expect("text"),
            ResponseBody::Text("{\"title\":\"x\"}".into())
        );

        let parts = json!({"choices": [{"message": {"content": [{"type": "text", "text": "a"}]}}]});
        assert!(matches!(parse_chat(&parts), Ok(ResponseBody::Segments(s)) if s.len() == 1));
    }

    #[test]
    fn chat_reports_refusal_and_empty() {
        let refusal = json!({"choices": [{"message": {"content": null, "refusal": "no"}}]});
        assert!(matches!(parse_chat(&refusal), Err(TransportError::InvalidResponse(_))));
        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert_eq!(parse_chat(&empty), Err(TransportError::EmptyOutput));
        assert!(parse_chat(&json!({})).is_err());
    }

    #[test]
    fn responses_flatten_output_content() {
        let payload = json!({"output": [
            {"type": "reasoning", "summary": []},
            {"type": "message", "content": [
                {"type": "output_text", "text": "{\"title\":"},
                {"type": "output_text", "text": "\"x\"}"}
            ]}
        ]});
        let ResponseBody::Segments(segments) = parse_responses(&payload).expect("segments") else {
            panic!("expected segments");
        };
        assert_eq!(segments.len(), 2);

        let text = json!({"output_text": "hello"});
        assert_eq!(
            parse_responses(&text).expect("text"),
            ResponseBody::Text("hello".into())
        );
        assert_eq!(
            parse_responses(&json!({"output": []})),
            Err(TransportError::EmptyOutput)
        );
    }

    #[tokio::test]
    async fn missing_key_is_reported_before_any_request() {
        let transport = OpenAiTransport::new("http://127.0.0.1:9", None);
        let err = transport
            .chat(&json!({"model": "gpt-4o-mini"}), Duration::from_secs(1))
            .await
            .expect_err("no key");
        assert_eq!(err, TransportError::MissingApiKey);
    }
}
