use crate::llm::{CallShape, GenerationTransport, ResponseBody, TransportError};
use crate::wb::{ContentSource, ProviderError, SourceReply};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Canned marketplace replies keyed by URL. Unknown URLs fail like an
/// unreachable host; stalled URLs never answer.
#[derive(Default)]
pub struct StaticSource {
    replies: HashMap<String, SourceReply>,
    stalled: HashSet<String>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(self, url: &str, body: Value) -> Self {
        self.reply(url, "application/json; charset=utf-8", &body.to_string())
    }

    pub fn reply(mut self, url: &str, content_type: &str, body: &str) -> Self {
        self.replies.insert(
            url.to_string(),
            SourceReply {
                content_type: Some(content_type.to_string()),
                body: body.to_string(),
            },
        );
        self
    }

    /// The URL hangs and ignores the caller's timeout.
    pub fn stall(mut self, url: &str) -> Self {
        self.stalled.insert(url.to_string());
        self
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .map(|hits| hits.get(url).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<SourceReply, ProviderError> {
        if let Ok(mut hits) = self.hits.lock() {
            *hits.entry(url.to_string()).or_default() += 1;
        }
        if self.stalled.contains(url) {
            std::future::pending::<()>().await;
        }
        self.replies
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::Unreachable(format!("no route to {url}")))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub shape: CallShape,
    pub model: String,
    pub body: Value,
}

impl RecordedCall {
    /// Declared output format of the call, `None` when undeclared.
    pub fn format(&self) -> Option<String> {
        self.body
            .pointer("/response_format/type")
            .or_else(|| self.body.pointer("/text/format/type"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

struct Step {
    delay: Duration,
    reply: Result<ResponseBody, TransportError>,
}

/// Generation transport replaying queued replies in order. An empty queue
/// answers with HTTP 500.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, body: ResponseBody) -> Self {
        self.push(Duration::ZERO, Ok(body))
    }

    /// Answers with `body` only after `delay` has passed.
    pub fn then_ok_after(self, delay: Duration, body: ResponseBody) -> Self {
        self.push(delay, Ok(body))
    }

    pub fn then_text(self, text: &str) -> Self {
        self.push(Duration::ZERO, Ok(ResponseBody::Text(text.to_string())))
    }

    pub fn then_err(self, err: TransportError) -> Self {
        self.push(Duration::ZERO, Err(err))
    }

    fn push(self, delay: Duration, reply: Result<ResponseBody, TransportError>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Step { delay, reply });
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn next(&self, shape: CallShape, body: &Value) -> Result<ResponseBody, TransportError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                shape,
                model: body
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                body: body.clone(),
            });
        }
        let step = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front());
        let Some(step) = step else {
            return Err(TransportError::Http {
                status: 500,
                message: "script exhausted".into(),
            });
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.reply
    }
}

#[async_trait]
impl GenerationTransport for ScriptedTransport {
    async fn chat(&self, body: &Value, _timeout: Duration) -> Result<ResponseBody, TransportError> {
        self.next(CallShape::Chat, body).await
    }

    async fn respond(
        &self,
        body: &Value,
        _timeout: Duration,
    ) -> Result<ResponseBody, TransportError> {
        self.next(CallShape::Responses, body).await
    }
}

pub fn capability_error(model: &str) -> TransportError {
    TransportError::Capability {
        model: model.to_string(),
        message: "Invalid parameter: 'response_format' of type 'json_schema' is not supported".into(),
    }
}
