use crate::http::build_probe_client;
use crate::wb::config::FetchConfig;
use async_trait::async_trait;
use reqwest::{
    Client,
    header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, REFERER},
};
use std::time::Duration;
use thiserror::Error;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// A single provider probe failed. Always recovered by moving on to the next
/// provider; never surfaced on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("unexpected content type `{0}`")]
    NotJson(String),
    #[error("malformed body: {0}")]
    Malformed(String),
    #[error("identifier mismatch: requested {expected}, descriptor carries {found}")]
    IdMismatch { expected: u64, found: u64 },
    #[error("no description field")]
    NoDescription,
    #[error("no record matches the requested product")]
    NoMatchingRecord,
    #[error("{0} records match ambiguously")]
    Ambiguous(usize),
    #[error("description too short: {found} < {required} chars")]
    TooShort { found: usize, required: usize },
    #[error("anti-bot challenge page")]
    Challenge,
}

#[derive(Debug, Clone)]
pub struct SourceReply {
    pub content_type: Option<String>,
    pub body: String,
}

impl SourceReply {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }
}

/// Plain GET transport to marketplace hosts. Implementations return only
/// successful (2xx) replies; everything else is a `ProviderError`.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<SourceReply, ProviderError>;
}

pub struct HttpContentSource {
    http: Client,
    headers: HeaderMap,
}

impl HttpContentSource {
    pub fn new(config: &FetchConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "application/json,text/html,application/xhtml+xml;q=0.9,*/*;q=0.8",
            ),
        );
        if let Ok(value) = HeaderValue::from_str(&config.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        headers.insert(
            REFERER,
            HeaderValue::from_static("https://www.wildberries.ru/"),
        );
        if let Some(cookies) = &config.cookies
            && let Ok(value) = HeaderValue::from_str(cookies)
        {
            headers.insert(COOKIE, value);
        }
        Self {
            http: build_probe_client(&config.user_agent),
            headers,
        }
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn get(&self, url: &str, timeout: Duration) -> Result<SourceReply, ProviderError> {
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout(timeout.as_millis() as u64)
                } else {
                    ProviderError::Unreachable(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let bytes = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout(timeout.as_millis() as u64)
            } else {
                ProviderError::Malformed(err.to_string())
            }
        })?;
        if bytes.len() > MAX_BODY_BYTES {
            return Err(ProviderError::Malformed(format!(
                "body too large: {} bytes",
                bytes.len()
            )));
        }

        Ok(SourceReply {
            content_type,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
