use crate::llm::{
    Decoded, GenerationClient, GenerationError, GenerationSuccess, LlmConfig, OpenAiTransport,
};
use crate::metrics;
use crate::models::{
    CardSource, FailureCode, GenerationAttempt, RewriteFailure, RewriteRequest, RewriteResult,
    Timings,
};
use crate::quota::{Credit, QuotaLedger};
use crate::schema::{RewritePayload, shape_hint, validate};
use crate::security::AuthContext;
use crate::wb::normalize::char_len;
use crate::wb::{CardFetcher, FetchConfig, FetchError, HttpContentSource, ProductReference};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

pub const SYSTEM_PROMPT: &str = "Ты опытный SEO-копирайтер маркетплейса.
Тебе дают исходный текст карточки товара. Сгенерируй:
1) Новый заголовок не длиннее 100 символов.
2) Ровно 6 буллитов, каждый не длиннее 120 символов.
3) Ровно 20 ключевых фраз, от самых важных к менее важным.
Тон разговорный, без канцелярита, язык русский.
Не упоминай «Wildberries», «скидка», %.
Верни только JSON с полями title, bullets, keywords.";

fn repair_instructions() -> String {
    format!(
        "Ты форматируешь готовый текст. Перенеси содержание из сообщения пользователя в JSON \
         строго такой формы и больше ничего не добавляй: {}. Ровно 6 буллитов и ровно 20 \
         ключевых фраз. Без пояснений и без markdown.",
        shape_hint()
    )
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub model: String,
    pub fallback_model: String,
    /// Shortest text worth sending to the repair pass.
    pub repair_min_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_llm(&LlmConfig::default())
    }
}

impl PipelineConfig {
    pub fn from_llm(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            repair_min_chars: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteState {
    Idle,
    Resolving,
    Fetching,
    Generating,
    Decoding,
    Validating,
    Repairing,
    Validating2,
    Done,
    Failed,
}

impl RewriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteState::Idle => "idle",
            RewriteState::Resolving => "resolving",
            RewriteState::Fetching => "fetching",
            RewriteState::Generating => "generating",
            RewriteState::Decoding => "decoding",
            RewriteState::Validating => "validating",
            RewriteState::Repairing => "repairing",
            RewriteState::Validating2 => "validating2",
            RewriteState::Done => "done",
            RewriteState::Failed => "failed",
        }
    }
}

/// Everything one request accumulates on its way through the states.
struct RewriteContext {
    state: RewriteState,
    model_flow: Vec<GenerationAttempt>,
    repair_attempted: bool,
    started: Instant,
    timings: Timings,
}

impl RewriteContext {
    fn new() -> Self {
        Self {
            state: RewriteState::Idle,
            model_flow: Vec::new(),
            repair_attempted: false,
            started: Instant::now(),
            timings: Timings::default(),
        }
    }

    fn enter(&mut self, next: RewriteState) {
        debug!(
            target: "wb.pipeline",
            from = self.state.as_str(),
            state = next.as_str(),
            "state_transition"
        );
        self.state = next;
    }

    fn fail(mut self, failure: RewriteFailure) -> RewriteFailure {
        self.enter(RewriteState::Failed);
        warn!(
            target: "wb.pipeline",
            error = failure.error.as_str(),
            detail = %failure.detail,
            attempts = self.model_flow.len(),
            repair_attempted = self.repair_attempted,
            "rewrite_failed"
        );
        failure.with_flow(self.model_flow)
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    fetcher: Arc<CardFetcher>,
    generator: Arc<GenerationClient>,
    quota: Arc<dyn QuotaLedger>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: CardFetcher,
        generator: GenerationClient,
        quota: Arc<dyn QuotaLedger>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            generator: Arc::new(generator),
            quota,
        }
    }

    pub fn from_env(quota: Arc<dyn QuotaLedger>) -> Self {
        let fetch_config = FetchConfig::from_env();
        let source = Arc::new(HttpContentSource::new(&fetch_config));
        let llm_config = LlmConfig::from_env();
        if llm_config.api_key.is_none() {
            warn!(
                target: "wb.pipeline",
                "OPENAI_API_KEY not set; every generation attempt will fail"
            );
        }
        let transport = Arc::new(OpenAiTransport::new(
            llm_config.base_url.clone(),
            llm_config.api_key.clone(),
        ));
        Self::new(
            PipelineConfig::from_llm(&llm_config),
            CardFetcher::new(source, fetch_config),
            GenerationClient::new(transport, llm_config),
            quota,
        )
    }

    pub fn quota(&self) -> &Arc<dyn QuotaLedger> {
        &self.quota
    }

    /// Runs one rewrite on a credit reserved at admission. The credit is kept
    /// on `Done` and refunded on any failure.
    pub async fn run(
        &self,
        request: RewriteRequest,
        auth: &AuthContext,
        credit: Credit,
    ) -> Result<RewriteResult, RewriteFailure> {
        match self.rewrite(request, auth).await {
            Ok(mut result) => {
                debug!(
                    target: "wb.quota",
                    identity = credit.identity(),
                    remaining = credit.remaining(),
                    "credit_spent"
                );
                result.remaining_quota = Some(credit.remaining());
                Ok(result)
            }
            Err(failure) => {
                if let Err(err) = self.quota.refund(credit).await {
                    warn!(
                        target: "wb.quota",
                        identity = %auth.identity,
                        error = %err,
                        "quota_refund_failed"
                    );
                }
                Err(failure)
            }
        }
    }

    async fn rewrite(
        &self,
        request: RewriteRequest,
        auth: &AuthContext,
    ) -> Result<RewriteResult, RewriteFailure> {
        let mut ctx = RewriteContext::new();
        let primary = pick_model(request.options.model.as_deref(), &self.config.model);
        let fallback = pick_model(
            request.options.fallback_model.as_deref(),
            &self.config.fallback_model,
        );

        ctx.enter(RewriteState::Resolving);
        let (source_text, source) = match ProductReference::classify(&request.prompt) {
            ProductReference::RawText(text) => (text, None),
            ProductReference::ProductUrl { url, product_id } => {
                ctx.enter(RewriteState::Fetching);
                let started = Instant::now();
                let fetched = self.fetcher.fetch(product_id, &url).await;
                let fetch_ms = started.elapsed().as_millis();
                metrics::stage_elapsed("fetch", fetch_ms);
                ctx.timings.fetch_ms = Some(fetch_ms as u64);
                match fetched {
                    Ok(report) => {
                        let source = CardSource {
                            provider: report.provider,
                            endpoint: report.endpoint,
                            product_id: report.product_id,
                            name: report.card.name.clone(),
                        };
                        (report.card.generation_input(), Some(source))
                    }
                    Err(err) => {
                        let FetchError::Exhausted { attempts, .. } = &err;
                        let mut failure =
                            RewriteFailure::new(FailureCode::FetchFailed, err.to_string());
                        failure.fetch_attempts = Some(attempts.clone());
                        return Err(ctx.fail(failure));
                    }
                }
            }
        };

        ctx.enter(RewriteState::Generating);
        let started = Instant::now();
        let generated = self
            .generator
            .generate(
                SYSTEM_PROMPT,
                &source_text,
                &primary,
                &fallback,
                request.options.json_mode.format(),
                &mut ctx.model_flow,
            )
            .await;
        let gen_ms = started.elapsed().as_millis();
        metrics::stage_elapsed("generate", gen_ms);
        ctx.timings.gen_ms = gen_ms as u64;

        let GenerationSuccess { decoded, .. } = match generated {
            Ok(success) => success,
            Err(err) => {
                let GenerationError::Exhausted { models, errors } = &err;
                let mut failure =
                    RewriteFailure::new(FailureCode::GenerationFailed, err.to_string());
                failure.attempted_models = models.clone();
                failure.errors = errors.clone();
                return Err(ctx.fail(failure));
            }
        };

        ctx.enter(RewriteState::Decoding);
        ctx.enter(RewriteState::Validating);
        let first_problem = match check(&decoded) {
            Ok(payload) => return Ok(finish(ctx, payload, source, auth)),
            Err(problem) => problem,
        };
        debug!(target: "wb.pipeline", problem = %first_problem, "first_pass_invalid");

        let repair_input = if decoded.raw_text.trim().is_empty() {
            source_text.as_str()
        } else {
            decoded.raw_text.as_str()
        };
        let found = char_len(repair_input.trim());
        if found < self.config.repair_min_chars {
            let failure = RewriteFailure::new(
                FailureCode::BadJsonEmpty,
                format!(
                    "repair input too short: {found} < {} chars",
                    self.config.repair_min_chars
                ),
            );
            return Err(ctx.fail(failure));
        }

        ctx.enter(RewriteState::Repairing);
        ctx.repair_attempted = true;
        let started = Instant::now();
        let repaired = self
            .generator
            .repair(
                &fallback,
                &repair_instructions(),
                repair_input,
                &mut ctx.model_flow,
            )
            .await;
        let repair_ms = started.elapsed().as_millis();
        metrics::stage_elapsed("repair", repair_ms);
        ctx.timings.repair_ms = Some(repair_ms as u64);

        ctx.enter(RewriteState::Validating2);
        let problem = match repaired {
            Ok(decoded) => match check(&decoded) {
                Ok(payload) => return Ok(finish(ctx, payload, source, auth)),
                Err(problem) => problem,
            },
            Err(err) => format!("repair call failed: {err}"),
        };
        let mut failure = RewriteFailure::new(FailureCode::BadJson, problem.clone());
        failure.attempted_models = vec![fallback];
        failure.errors = vec![first_problem, problem];
        Err(ctx.fail(failure))
    }

}

fn finish(
    mut ctx: RewriteContext,
    payload: RewritePayload,
    source: Option<CardSource>,
    auth: &AuthContext,
) -> RewriteResult {
    ctx.enter(RewriteState::Done);
    ctx.timings.total_ms = ctx.started.elapsed().as_millis() as u64;
    info!(
        target: "wb.pipeline",
        identity = %auth.identity,
        attempts = ctx.model_flow.len(),
        repaired = ctx.repair_attempted,
        total_ms = ctx.timings.total_ms,
        "rewrite_done"
    );
    RewriteResult {
        payload,
        model_flow: ctx.model_flow,
        timings: ctx.timings,
        source,
        remaining_quota: None,
    }
}

fn pick_model(requested: Option<&str>, configured: &str) -> String {
    requested
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(configured)
        .to_string()
}

fn check(decoded: &Decoded) -> Result<RewritePayload, String> {
    match &decoded.candidate {
        Some(candidate) => validate(candidate).map_err(|violation| violation.to_string()),
        None => Err("no JSON object in output".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallShape, ResponseBody, TransportError};
    use crate::models::{AttemptMode, JsonMode, RewriteOptions};
    use crate::quota::InMemoryQuota;
    use crate::schema::sample_payload_value;
    use crate::testing::{ScriptedTransport, StaticSource, capability_error};
    use crate::wb::ProviderKind;
    use serde_json::json;
    use std::time::Duration;

    const RAW_TEXT: &str = "Зубная паста Rasyan с гвоздикой. Натуральная тайская паста, отбеливает и освежает дыхание.";
    const NM: u64 = 12345678;
    const URL: &str = "https://www.wildberries.ru/catalog/12345678/detail.aspx";

    struct Harness {
        pipeline: Pipeline,
        transport: Arc<ScriptedTransport>,
        quota: Arc<InMemoryQuota>,
        source: Arc<StaticSource>,
    }

    fn fetch_config() -> FetchConfig {
        FetchConfig {
            challenge_pause: Duration::from_millis(0),
            ..FetchConfig::default()
        }
    }

    fn harness(source: StaticSource, transport: ScriptedTransport) -> Harness {
        let source = Arc::new(source);
        let transport = Arc::new(transport);
        let quota = Arc::new(InMemoryQuota::new(3));
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            CardFetcher::new(source.clone(), fetch_config()),
            GenerationClient::new(transport.clone(), LlmConfig::default()),
            quota.clone(),
        );
        Harness {
            pipeline,
            transport,
            quota,
            source,
        }
    }

    impl Harness {
        async fn run(&self, request: RewriteRequest) -> Result<RewriteResult, RewriteFailure> {
            let credit = self
                .quota
                .reserve("anon")
                .await
                .expect("quota")
                .expect("credit");
            self.pipeline.run(request, &auth(), credit).await
        }
    }

    fn request(prompt: &str) -> RewriteRequest {
        RewriteRequest {
            prompt: prompt.to_string(),
            supplier_id: None,
            options: RewriteOptions::default(),
        }
    }

    fn auth() -> AuthContext {
        AuthContext::anonymous()
    }

    fn user_content(body: &serde_json::Value) -> String {
        body.pointer("/messages/1/content")
            .or_else(|| body.get("input"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn raw_text_needs_one_strict_attempt() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new().then_ok(ResponseBody::Parsed(sample_payload_value())),
        );
        let result = h.run(request(RAW_TEXT)).await.expect("done");
        assert_eq!(result.model_flow.len(), 1);
        assert_eq!(result.model_flow[0].mode, AttemptMode::Json);
        assert_eq!(result.payload.bullets.len(), 6);
        assert_eq!(result.payload.keywords.len(), 20);
        assert!(result.source.is_none());
        assert!(result.timings.fetch_ms.is_none());
        assert!(result.timings.repair_ms.is_none());
        assert_eq!(result.remaining_quota, Some(2));
        assert_eq!(user_content(&h.transport.calls()[0].body), RAW_TEXT);
    }

    #[tokio::test]
    async fn url_input_uses_only_the_matching_detail_record() {
        let config = fetch_config();
        let mut source = StaticSource::new();
        for family in &config.mirror_families {
            for n in 1..=config.mirror_count {
                source = source.reply(&family.url(n, NM), "text/html", "<html></html>");
            }
        }
        let source = source.json(
            &config.detail_api_url(NM),
            json!({"data": {"products": [
                {"id": NM + 7, "name": "Чужой товар", "description": "Описание другого товара, которое ни в коем случае не должно попасть в генерацию."},
                {"id": NM, "name": "Паста Rasyan", "description": "Натуральная тайская зубная паста с гвоздикой, бережно очищает и освежает дыхание."},
            ]}}),
        );
        let h = harness(
            source,
            ScriptedTransport::new().then_ok(ResponseBody::Parsed(sample_payload_value())),
        );
        let result = h.run(request(URL)).await.expect("done");
        let source = result.source.expect("card source");
        assert_eq!(source.provider, ProviderKind::DetailApi);
        assert_eq!(source.product_id, NM);
        assert!(result.timings.fetch_ms.is_some());

        let content = user_content(&h.transport.calls()[0].body);
        assert!(content.starts_with("Паста Rasyan\n\nНатуральная тайская"));
        assert!(!content.contains("другого товара"));
        assert_eq!(h.source.hits(&config.detail_api_url(NM)), 1);
    }

    #[tokio::test]
    async fn capability_error_retries_loose_on_the_same_model() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_err(capability_error("gpt-4o-mini"))
                .then_text(&format!("```json\n{}\n```", sample_payload_value())),
        );
        let result = h.run(request(RAW_TEXT)).await.expect("done");
        let flow = &result.model_flow;
        assert_eq!(flow.len(), 2);
        assert_eq!(flow[0].model, flow[1].model);
        assert_eq!(flow[0].mode, AttemptMode::Json);
        assert_eq!(flow[1].mode, AttemptMode::NoJson);
        assert!(flow[0].error.is_some());
        assert!(flow[1].decoded.is_some());
    }

    #[tokio::test]
    async fn both_models_failing_is_gen_fail() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_err(TransportError::Http {
                    status: 503,
                    message: "overloaded".into(),
                })
                .then_err(TransportError::Timeout(45_000)),
        );
        let failure = h.run(request(RAW_TEXT)).await.expect_err("gen fail");
        assert_eq!(failure.error, FailureCode::GenerationFailed);
        assert_eq!(failure.attempted_models, vec!["gpt-4o-mini", "gpt-4.1-mini"]);
        assert_eq!(failure.errors.len(), 2);
        assert_eq!(failure.model_flow.len(), 2);
        assert_eq!(h.quota.remaining("anon").await.expect("quota"), 3);
    }

    #[tokio::test]
    async fn short_unparseable_output_skips_repair() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new().then_text("not json!!"),
        );
        let failure = h.run(request(RAW_TEXT)).await.expect_err("empty");
        assert_eq!(failure.error, FailureCode::BadJsonEmpty);
        assert_eq!(h.transport.calls().len(), 1);
        assert_eq!(failure.model_flow.len(), 1);
        assert_eq!(failure.model_flow[0].raw_output, "not json!!");
    }

    #[tokio::test]
    async fn longer_unparseable_output_is_repaired_by_the_fallback() {
        let raw = "a".repeat(40);
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_text(&raw)
                .then_text(&sample_payload_value().to_string()),
        );
        let result = h.run(request(RAW_TEXT)).await.expect("repaired");
        assert_eq!(result.model_flow.len(), 2);
        let repair = &result.model_flow[1];
        assert_eq!(repair.mode, AttemptMode::Repair);
        assert_eq!(repair.model, "gpt-4.1-mini");
        assert!(result.timings.repair_ms.is_some());

        let calls = h.transport.calls();
        assert_eq!(calls[1].format(), Some("json_object".into()));
        assert_eq!(user_content(&calls[1].body), raw);
        assert_eq!(result.remaining_quota, Some(2));
    }

    #[tokio::test]
    async fn failed_repair_is_bad_json() {
        let mut wrong_shape = sample_payload_value();
        wrong_shape["bullets"] = json!(["one", "two"]);
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_ok(ResponseBody::Parsed(wrong_shape.clone()))
                .then_ok(ResponseBody::Parsed(wrong_shape)),
        );
        let failure = h.run(request(RAW_TEXT)).await.expect_err("bad json");
        assert_eq!(failure.error, FailureCode::BadJson);
        assert_eq!(failure.model_flow.len(), 2);
        assert!(failure.detail.contains("bullets"));
        assert_eq!(h.quota.remaining("anon").await.expect("quota"), 3);
    }

    #[tokio::test]
    async fn blank_output_repairs_from_the_source_text() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_text("   ")
                .then_ok(ResponseBody::Parsed(sample_payload_value())),
        );
        h.run(request(RAW_TEXT)).await.expect("repaired");
        assert_eq!(user_content(&h.transport.calls()[1].body), RAW_TEXT);
    }

    #[tokio::test]
    async fn fetch_failure_never_reaches_generation() {
        let h = harness(StaticSource::new(), ScriptedTransport::new());
        let failure = h.run(request(URL)).await.expect_err("fetch");
        assert_eq!(failure.error, FailureCode::FetchFailed);
        assert!(h.transport.calls().is_empty());
        assert!(failure.model_flow.is_empty());
        assert_eq!(failure.fetch_attempts.map(|a| a.len()), Some(26));
        assert_eq!(h.quota.remaining("anon").await.expect("quota"), 3);
    }

    #[tokio::test]
    async fn request_options_pick_models_and_declaration() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new().then_ok(ResponseBody::Parsed(sample_payload_value())),
        );
        let mut req = request(RAW_TEXT);
        req.options = RewriteOptions {
            model: Some("o3-mini".into()),
            fallback_model: None,
            json_mode: JsonMode::Loose,
        };
        let result = h.run(req).await.expect("done");
        let call = &h.transport.calls()[0];
        assert_eq!(call.shape, CallShape::Responses);
        assert_eq!(call.model, "o3-mini");
        assert_eq!(call.format(), Some("json_object".into()));
        assert_eq!(result.model_flow[0].mode, AttemptMode::NoJson);
    }

    #[tokio::test]
    async fn quota_is_spent_once_per_done() {
        let h = harness(
            StaticSource::new(),
            ScriptedTransport::new()
                .then_ok(ResponseBody::Parsed(sample_payload_value()))
                .then_ok(ResponseBody::Parsed(sample_payload_value())),
        );
        h.run(request(RAW_TEXT)).await.expect("first");
        let second = h.run(request(RAW_TEXT)).await.expect("second");
        assert_eq!(second.remaining_quota, Some(1));
    }
}
