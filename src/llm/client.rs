use crate::http::env_u64;
use crate::llm::decode::{Decoded, decode};
use crate::llm::openai::{GenerationTransport, ResponseBody, TransportError};
use crate::llm::protocol::{CallShape, RequestBuilder, ResponseFormat};
use crate::metrics;
use crate::models::{AttemptMode, GenerationAttempt};
use crate::schema::validate;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Declaration levels tried per model before moving on.
const LEVELS_PER_MODEL: usize = 2;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub fallback_model: String,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub call_timeout: Duration,
    /// Wall-clock bound on one `generate` call across all its attempts.
    pub budget: Duration,
    pub reasoning_shape: CallShape,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            fallback_model: "gpt-4.1-mini".into(),
            max_output_tokens: 1200,
            temperature: Some(0.7),
            call_timeout: Duration::from_secs(45),
            budget: Duration::from_secs(150),
            reasoning_shape: CallShape::Responses,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.model),
            fallback_model: std::env::var("OPENAI_FALLBACK_MODEL")
                .unwrap_or(defaults.fallback_model),
            max_output_tokens: env_u64("OPENAI_MAX_OUTPUT_TOKENS", 1200) as u32,
            temperature: std::env::var("OPENAI_TEMPERATURE")
                .ok()
                .and_then(|v| v.trim().parse::<f32>().ok())
                .or(defaults.temperature),
            call_timeout: Duration::from_secs(env_u64("OPENAI_TIMEOUT_SECS", 45).max(1)),
            budget: Duration::from_secs(env_u64("GENERATION_BUDGET_SECS", 150)),
            reasoning_shape: std::env::var("REASONING_CALL_SHAPE")
                .ok()
                .and_then(|v| CallShape::parse(&v))
                .unwrap_or(defaults.reasoning_shape),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation failed for {}: {}", .models.join(", "), .errors.join("; "))]
    Exhausted {
        models: Vec<String>,
        errors: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct GenerationSuccess {
    pub model: String,
    pub format: ResponseFormat,
    pub decoded: Decoded,
}

pub struct GenerationClient {
    transport: Arc<dyn GenerationTransport>,
    config: LlmConfig,
}

impl GenerationClient {
    pub fn new(transport: Arc<dyn GenerationTransport>, config: LlmConfig) -> Self {
        Self { transport, config }
    }

    /// Primary model first, fallback second; a declaration rejection loosens
    /// the declaration on the same model before the model is abandoned.
    /// Every call lands in `flow`.
    pub async fn generate(
        &self,
        system: &str,
        user: &str,
        primary: &str,
        fallback: &str,
        start_format: ResponseFormat,
        flow: &mut Vec<GenerationAttempt>,
    ) -> Result<GenerationSuccess, GenerationError> {
        let deadline = Instant::now() + self.config.budget;
        let mut models = vec![primary.to_string()];
        if fallback != primary {
            models.push(fallback.to_string());
        }

        let mut attempted = Vec::new();
        let mut errors = Vec::new();

        'models: for model in &models {
            let mut format = start_format;
            for level in 1..=LEVELS_PER_MODEL {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(target: "wb.llm", model = model.as_str(), "generation_budget_exhausted");
                    errors.push(format!("{model}: generation budget exhausted"));
                    break 'models;
                }
                if !attempted.contains(model) {
                    attempted.push(model.clone());
                }

                let timeout = remaining.min(self.config.call_timeout);
                let mode = AttemptMode::for_format(format);
                match self.call(model, system, user, format, mode, timeout, flow).await {
                    Ok(decoded) => {
                        return Ok(GenerationSuccess {
                            model: model.clone(),
                            format,
                            decoded,
                        });
                    }
                    Err(TransportError::Capability { message, .. }) => {
                        let next = format.looser().filter(|_| level < LEVELS_PER_MODEL);
                        match next {
                            Some(looser) => {
                                warn!(
                                    target: "wb.llm",
                                    model = model.as_str(),
                                    from = format.as_str(),
                                    to = looser.as_str(),
                                    "declaration_downgrade"
                                );
                                format = looser;
                            }
                            None => {
                                errors.push(format!("{model}: declaration rejected: {message}"));
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        errors.push(format!("{model}: {err}"));
                        break;
                    }
                }
            }
            warn!(target: "wb.llm", model = model.as_str(), "model_abandoned");
        }

        Err(GenerationError::Exhausted {
            models: attempted,
            errors,
        })
    }

    /// One reformatting call at the loose declaration level.
    pub async fn repair(
        &self,
        model: &str,
        system: &str,
        user: &str,
        flow: &mut Vec<GenerationAttempt>,
    ) -> Result<Decoded, TransportError> {
        self.call(
            model,
            system,
            user,
            ResponseFormat::JsonObject,
            AttemptMode::Repair,
            self.config.call_timeout,
            flow,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        model: &str,
        system: &str,
        user: &str,
        format: ResponseFormat,
        mode: AttemptMode,
        timeout: Duration,
        flow: &mut Vec<GenerationAttempt>,
    ) -> Result<Decoded, TransportError> {
        let request = RequestBuilder::new(&self.config).build(model, system, user, format);
        let body = request.body();
        let started = Instant::now();

        let call = async {
            match request.shape {
                CallShape::Chat => self.transport.chat(&body, timeout).await,
                CallShape::Responses => self.transport.respond(&body, timeout).await,
            }
        };
        let result: Result<ResponseBody, TransportError> =
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
            };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = result.map(|body| decode(&body));
        let attempt = GenerationAttempt {
            model: model.to_string(),
            mode,
            format,
            shape: request.shape,
            raw_output: outcome
                .as_ref()
                .map(|decoded| decoded.raw_text.clone())
                .unwrap_or_default(),
            decoded: outcome
                .as_ref()
                .ok()
                .and_then(|decoded| decoded.candidate.as_ref())
                .and_then(|candidate| validate(candidate).ok()),
            error: outcome.as_ref().err().map(|err| err.to_string()),
            elapsed_ms,
            timestamp: Utc::now(),
        };

        metrics::generation_attempt(model, mode.as_str(), outcome.is_ok());
        match &outcome {
            Ok(_) => info!(
                target: "wb.llm",
                model,
                mode = mode.as_str(),
                format = format.as_str(),
                elapsed_ms,
                valid = attempt.decoded.is_some(),
                "generation_attempt"
            ),
            Err(err) => warn!(
                target: "wb.llm",
                model,
                mode = mode.as_str(),
                format = format.as_str(),
                elapsed_ms,
                error = %err,
                "generation_attempt_failed"
            ),
        }
        flow.push(attempt);
        outcome
    }
}
