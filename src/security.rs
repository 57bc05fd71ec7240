use crate::http::env_bool;
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const ANONYMOUS_IDENTITY: &str = "anon";
const KEY_HEADER: &str = "X-Rewrite-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
    limiter: Arc<TokenBuckets>,
    allow_anonymous: bool,
}

/// Who a request is billed to. Quota and rate limits are keyed by `identity`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub identity: String,
    pub api_key_id: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            identity: ANONYMOUS_IDENTITY.to_string(),
            api_key_id: None,
        }
    }
}

#[derive(Clone)]
struct KeyRecord {
    identity: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self::with_keys(
            &env::var("REWRITE_API_KEYS").unwrap_or_default(),
            env_bool("ALLOW_ANONYMOUS", true),
        )
    }

    /// `keys` uses the `REWRITE_API_KEYS` format.
    pub fn with_keys(keys: &str, allow_anonymous: bool) -> Self {
        Self {
            records: Arc::new(load_keys(keys)),
            limiter: Arc::new(TokenBuckets::from_env()),
            allow_anonymous,
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            identity: record.identity.clone(),
            api_key_id: Some(record.api_key_id.clone()),
        })
    }

    async fn consume(&self, identity: &str) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(identity).await
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let context = match extract_api_key(request.headers()) {
        Some(presented) => match state.authenticate(&presented) {
            Some(context) => context,
            None => {
                return Ok(unauthorized_response(
                    "invalid_api_key",
                    "Key not recognized",
                ));
            }
        },
        None if state.allow_anonymous => AuthContext::anonymous(),
        None => {
            return Ok(unauthorized_response(
                "missing_api_key",
                "Provide X-Rewrite-Key or Bearer token",
            ));
        }
    };

    match state.consume(&context.identity).await {
        Ok(permit) => {
            debug!(target: "wb.api", identity = %context.identity, "request_authorized");
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|value| !value.is_empty());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

/// Parses `identity:key,identity:key`.
fn load_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let identity = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (identity, key) {
            (Some(identity), Some(secret)) => {
                let record = KeyRecord {
                    identity: identity.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target: "wb.api",
                "ignored malformed REWRITE_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target: "wb.api",
            "REWRITE_API_KEYS produced no keys; only anonymous access is possible"
        );
    } else {
        info!(
            target: "wb.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(2.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after = (deficit / self.rate_per_sec).max(0.0);
            Err(RateExceeded {
                retry_after,
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_number(headers, "X-RateLimit-Remaining", remaining);
        insert_number(headers, "X-RateLimit-Reset", reset);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry));
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        insert_number(headers, "X-RateLimit-Reset", reset);
    }
}

fn insert_number(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_wins_over_custom_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(KEY_HEADER, HeaderValue::from_static("header-key"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("header-key"));
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer bearer-key"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("bearer-key"));
        assert_eq!(extract_api_key(&http::HeaderMap::new()), None);
    }

    #[test]
    fn key_list_maps_secrets_to_identities() {
        let keys = load_keys("shop-1:alpha, broken ,shop-2:beta");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["alpha"].identity, "shop-1");
        assert_eq!(keys["beta"].api_key_id, "key-03");
        assert!(load_keys("").is_empty());
    }

    #[tokio::test]
    async fn bucket_runs_dry_after_capacity() {
        let buckets = TokenBuckets::new(0.001, 2.0);
        assert!(buckets.consume("a").await.is_ok());
        assert!(buckets.consume("a").await.is_ok());
        assert!(buckets.consume("a").await.is_err());
        assert!(buckets.consume("b").await.is_ok());
    }
}
