use crate::llm::client::LlmConfig;
use crate::schema::{shape_hint, strict_json_schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const REASONING_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];
const SCHEMA_NAME: &str = "card_rewrite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Legacy,
    Reasoning,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        let lowered = model.trim().to_lowercase();
        let bare = lowered.rsplit('/').next().unwrap_or(&lowered);
        if REASONING_PREFIXES.iter().any(|prefix| bare.starts_with(prefix)) {
            ModelFamily::Reasoning
        } else {
            ModelFamily::Legacy
        }
    }
}

/// Which endpoint shape carries the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    Chat,
    Responses,
}

impl CallShape {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "chat" | "chat_completions" => Some(CallShape::Chat),
            "responses" => Some(CallShape::Responses),
            _ => None,
        }
    }
}

/// Structured-output declaration, strictest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Off,
    JsonObject,
    JsonSchema,
}

impl ResponseFormat {
    pub fn looser(self) -> Option<Self> {
        match self {
            ResponseFormat::JsonSchema => Some(ResponseFormat::JsonObject),
            ResponseFormat::JsonObject => Some(ResponseFormat::Off),
            ResponseFormat::Off => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Off => "off",
            ResponseFormat::JsonObject => "json_object",
            ResponseFormat::JsonSchema => "json_schema",
        }
    }
}

/// Per-family protocol differences in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyProfile {
    pub shape: CallShape,
    /// `None` when the call shape carries no length limit at all.
    pub token_limit_param: Option<&'static str>,
    pub temperature: bool,
}

pub fn profile(family: ModelFamily, reasoning_shape: CallShape) -> FamilyProfile {
    match (family, reasoning_shape) {
        (ModelFamily::Legacy, _) => FamilyProfile {
            shape: CallShape::Chat,
            token_limit_param: Some("max_tokens"),
            temperature: true,
        },
        (ModelFamily::Reasoning, CallShape::Chat) => FamilyProfile {
            shape: CallShape::Chat,
            token_limit_param: Some("max_completion_tokens"),
            temperature: false,
        },
        (ModelFamily::Reasoning, CallShape::Responses) => FamilyProfile {
            shape: CallShape::Responses,
            token_limit_param: None,
            temperature: false,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub family: ModelFamily,
    pub shape: CallShape,
    pub system_instructions: String,
    pub user_content: String,
    pub format: ResponseFormat,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub temperature_omitted: bool,
    #[serde(skip)]
    token_limit_param: Option<&'static str>,
}

impl GenerationRequest {
    /// Wire body for the request's call shape.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        match self.shape {
            CallShape::Chat => {
                body.insert(
                    "messages".into(),
                    json!([
                        {"role": "system", "content": self.system_instructions},
                        {"role": "user", "content": self.user_content},
                    ]),
                );
                if let (Some(param), Some(limit)) = (self.token_limit_param, self.max_output_tokens) {
                    body.insert(param.into(), json!(limit));
                }
                if let Some(temperature) = self.temperature {
                    body.insert("temperature".into(), json!(temperature));
                }
                match self.format {
                    ResponseFormat::Off => {}
                    ResponseFormat::JsonObject => {
                        body.insert("response_format".into(), json!({"type": "json_object"}));
                    }
                    ResponseFormat::JsonSchema => {
                        body.insert(
                            "response_format".into(),
                            json!({
                                "type": "json_schema",
                                "json_schema": {
                                    "name": SCHEMA_NAME,
                                    "strict": true,
                                    "schema": strict_json_schema(),
                                }
                            }),
                        );
                    }
                }
            }
            CallShape::Responses => {
                body.insert("instructions".into(), json!(self.system_instructions));
                body.insert("input".into(), json!(self.user_content));
                if let (Some(param), Some(limit)) = (self.token_limit_param, self.max_output_tokens) {
                    body.insert(param.into(), json!(limit));
                }
                if let Some(temperature) = self.temperature {
                    body.insert("temperature".into(), json!(temperature));
                }
                match self.format {
                    ResponseFormat::Off => {}
                    ResponseFormat::JsonObject => {
                        body.insert("text".into(), json!({"format": {"type": "json_object"}}));
                    }
                    ResponseFormat::JsonSchema => {
                        body.insert(
                            "text".into(),
                            json!({"format": {
                                "type": "json_schema",
                                "name": SCHEMA_NAME,
                                "strict": true,
                                "schema": strict_json_schema(),
                            }}),
                        );
                    }
                }
            }
        }
        Value::Object(body)
    }
}

pub struct RequestBuilder<'a> {
    config: &'a LlmConfig,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a LlmConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        model: &str,
        system_instructions: &str,
        user_content: &str,
        format: ResponseFormat,
    ) -> GenerationRequest {
        let family = ModelFamily::of(model);
        let profile = profile(family, self.config.reasoning_shape);

        // Without a length-limiting parameter the instructions carry the only bound on output.
        let system_instructions = if profile.token_limit_param.is_none() {
            format!(
                "{}\n\nReturn exactly this JSON shape and nothing else, no prose, no markdown: {}",
                system_instructions.trim_end(),
                shape_hint()
            )
        } else {
            system_instructions.to_string()
        };

        let temperature = if profile.temperature {
            self.config.temperature
        } else {
            None
        };

        GenerationRequest {
            model: model.to_string(),
            family,
            shape: profile.shape,
            system_instructions,
            user_content: user_content.to_string(),
            format,
            max_output_tokens: profile
                .token_limit_param
                .map(|_| self.config.max_output_tokens),
            temperature,
            temperature_omitted: temperature.is_none(),
            token_limit_param: profile.token_limit_param,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig::default()
    }

    #[test]
    fn families_follow_name_prefixes() {
        assert_eq!(ModelFamily::of("gpt-4o-mini"), ModelFamily::Legacy);
        assert_eq!(ModelFamily::of("gpt-4.1-mini"), ModelFamily::Legacy);
        assert_eq!(ModelFamily::of("o3-mini"), ModelFamily::Reasoning);
        assert_eq!(ModelFamily::of("GPT-5-mini"), ModelFamily::Reasoning);
        assert_eq!(ModelFamily::of("openai/o4-mini"), ModelFamily::Reasoning);
    }

    #[test]
    fn legacy_chat_request_carries_limit_temperature_and_schema() {
        let cfg = config();
        let request = RequestBuilder::new(&cfg).build(
            "gpt-4o-mini",
            "system",
            "user",
            ResponseFormat::JsonSchema,
        );
        assert_eq!(request.shape, CallShape::Chat);
        assert!(!request.temperature_omitted);
        let body = request.body();
        assert_eq!(body["max_tokens"], json!(cfg.max_output_tokens));
        assert!(body.get("max_completion_tokens").is_none());
        assert!(body.get("temperature").is_some());
        assert_eq!(body["response_format"]["type"], json!("json_schema"));
        assert_eq!(body["response_format"]["json_schema"]["strict"], json!(true));
        assert_eq!(body["messages"][0]["content"], json!("system"));
    }

    #[test]
    fn loose_and_off_levels_on_chat() {
        let cfg = config();
        let builder = RequestBuilder::new(&cfg);
        let loose = builder
            .build("gpt-4o-mini", "s", "u", ResponseFormat::JsonObject)
            .body();
        assert_eq!(loose["response_format"], json!({"type": "json_object"}));
        let off = builder.build("gpt-4o-mini", "s", "u", ResponseFormat::Off).body();
        assert!(off.get("response_format").is_none());
    }

    #[test]
    fn reasoning_models_use_responses_shape_with_guard() {
        let cfg = config();
        let request =
            RequestBuilder::new(&cfg).build("o3-mini", "system", "user", ResponseFormat::JsonSchema);
        assert_eq!(request.shape, CallShape::Responses);
        assert!(request.temperature_omitted);
        assert!(request.max_output_tokens.is_none());
        assert!(request.system_instructions.contains("Return exactly this JSON shape"));
        let body = request.body();
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(body["input"], json!("user"));
        assert_eq!(body["text"]["format"]["type"], json!("json_schema"));
        assert_eq!(body["text"]["format"]["name"], json!("card_rewrite"));
    }

    #[test]
    fn reasoning_models_on_chat_shape_rename_the_limit() {
        let cfg = LlmConfig {
            reasoning_shape: CallShape::Chat,
            ..config()
        };
        let request =
            RequestBuilder::new(&cfg).build("gpt-5-mini", "system", "user", ResponseFormat::JsonObject);
        assert_eq!(request.shape, CallShape::Chat);
        assert_eq!(request.system_instructions, "system");
        let body = request.body();
        assert_eq!(body["max_completion_tokens"], json!(cfg.max_output_tokens));
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn declaration_levels_loosen_in_order() {
        assert_eq!(ResponseFormat::JsonSchema.looser(), Some(ResponseFormat::JsonObject));
        assert_eq!(ResponseFormat::JsonObject.looser(), Some(ResponseFormat::Off));
        assert_eq!(ResponseFormat::Off.looser(), None);
    }
}
