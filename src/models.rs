use crate::llm::{CallShape, ResponseFormat};
use crate::schema::RewritePayload;
use crate::wb::{ProviderAttempt, ProviderKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteRequest {
    /// Raw product text or a product-page URL.
    pub prompt: String,
    #[serde(default, rename = "supplierId")]
    pub supplier_id: Option<i64>,
    #[serde(default)]
    pub options: RewriteOptions,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RewriteOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub json_mode: JsonMode,
}

/// Declaration level the first generation attempt starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    #[default]
    Strict,
    Loose,
    Off,
}

impl JsonMode {
    pub fn format(self) -> ResponseFormat {
        match self {
            JsonMode::Strict => ResponseFormat::JsonSchema,
            JsonMode::Loose => ResponseFormat::JsonObject,
            JsonMode::Off => ResponseFormat::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptMode {
    Json,
    NoJson,
    Repair,
}

impl AttemptMode {
    pub fn for_format(format: ResponseFormat) -> Self {
        match format {
            ResponseFormat::JsonSchema => AttemptMode::Json,
            ResponseFormat::JsonObject | ResponseFormat::Off => AttemptMode::NoJson,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptMode::Json => "json",
            AttemptMode::NoJson => "nojson",
            AttemptMode::Repair => "repair",
        }
    }
}

/// One generation call, successful or not. The ordered list is `model_flow`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub model: String,
    pub mode: AttemptMode,
    pub format: ResponseFormat,
    pub shape: CallShape,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default)]
    pub decoded: Option<RewritePayload>,
    #[serde(default)]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timings {
    pub fetch_ms: Option<u64>,
    pub gen_ms: u64,
    pub repair_ms: Option<u64>,
    pub total_ms: u64,
}

/// Which provider produced the source text of a URL request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSource {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub product_id: u64,
    pub name: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteResult {
    #[serde(flatten)]
    pub payload: RewritePayload,
    pub model_flow: Vec<GenerationAttempt>,
    pub timings: Timings,
    #[serde(default)]
    pub source: Option<CardSource>,
    #[serde(default)]
    pub remaining_quota: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    #[serde(rename = "WB_FETCH_FAILED")]
    FetchFailed,
    #[serde(rename = "GEN_FAIL")]
    GenerationFailed,
    #[serde(rename = "BAD_JSON")]
    BadJson,
    #[serde(rename = "BAD_JSON_EMPTY")]
    BadJsonEmpty,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::FetchFailed => "WB_FETCH_FAILED",
            FailureCode::GenerationFailed => "GEN_FAIL",
            FailureCode::BadJson => "BAD_JSON",
            FailureCode::BadJsonEmpty => "BAD_JSON_EMPTY",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal per-request failure with everything needed to diagnose it.
#[skip_serializing_none]
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{error}: {detail}")]
pub struct RewriteFailure {
    pub error: FailureCode,
    pub detail: String,
    #[serde(default)]
    pub model_flow: Vec<GenerationAttempt>,
    #[serde(default)]
    pub attempted_models: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub fetch_attempts: Option<Vec<ProviderAttempt>>,
}

impl RewriteFailure {
    pub fn new(error: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            error,
            detail: detail.into(),
            model_flow: Vec::new(),
            attempted_models: Vec::new(),
            errors: Vec::new(),
            fetch_attempts: None,
        }
    }

    pub fn with_flow(mut self, model_flow: Vec<GenerationAttempt>) -> Self {
        self.model_flow = model_flow;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
