mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod quota;
mod schema;
mod security;
#[cfg(test)]
mod testing;
mod wb;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use eyre::{Result, WrapErr, eyre};
use idempotency::IdempotencyStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, FailureCode, RewriteFailure, RewriteRequest, RewriteResult};
use pipeline::Pipeline;
use quota::{Credit, QuotaError};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use wb::ProductReference;

const OPENAPI_YAML: &str = include_str!("../docs/openapi.yaml");

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target: "wb.api", "server crashed: {err:?}");
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let redis = match std::env::var("REDIS_URL") {
        Ok(url) if !url.trim().is_empty() => {
            Some(redis::Client::open(url).wrap_err("invalid REDIS_URL")?)
        }
        _ => None,
    };
    let quota = quota::ledger_from_env(redis.as_ref());
    let pipeline = Pipeline::from_env(quota);
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre!("prometheus recorder: {err}"))?;

    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyStore::from_env(redis),
        prometheus_handle,
    };
    let app = router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target: "wb.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<Value>,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/rewrite", post(rewrite))
        .route("/quota", get(get_quota))
        .nest(
            "/jobs",
            Router::new()
                .route("/rewrite", post(enqueue_rewrite_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> Value {
    serde_yaml::from_str(OPENAPI_YAML).unwrap_or_else(|err| {
        error!(target: "wb.api", error = %err, "openapi document is not valid YAML");
        json!({"openapi": "3.0.3"})
    })
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "wb-rewrite-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs key required".into()));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>WB Rewrite API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Rewrite one product card.
///
/// - Method: `POST`
/// - Path: `/rewrite`
/// - Auth: `Authorization: Bearer <key>`, `X-Rewrite-Key: <key>`, or anonymous when allowed
/// - Body: `RewriteRequest`
/// - Response: `RewriteResult`, or a `RewriteFailure` with its diagnostics
///
/// An `Idempotency-Key` header replays an earlier result for the same caller
/// without spending quota again.
async fn rewrite(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<RewriteRequest>,
) -> Result<Json<RewriteResult>, AppError> {
    metrics::inc_requests("/rewrite");
    check_request(&payload)?;
    info!(
        target: "wb.api",
        identity = %context.identity,
        api_key = context.api_key_id.as_deref().unwrap_or("-"),
        supplier_id = payload.supplier_id,
        url = ProductReference::classify(&payload.prompt).is_url(),
        "rewrite invoked",
    );

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.get(&context.identity, key).await
    {
        info!(target: "wb.api", identity = %context.identity, "idempotent replay");
        return Ok(Json(existing));
    }

    let credit = reserve_credit(&state, &context).await?;
    let result = state.pipeline.run(payload, &context, credit).await?;
    if let Some(key) = &idempotency_key {
        state.idempotency.put(&context.identity, key, &result).await;
    }
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_rewrite_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<RewriteRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/jobs/rewrite");
    check_request(&payload)?;
    let credit = reserve_credit(&state, &context).await?;
    let id = state
        .queue
        .enqueue(payload, context, credit)
        .await
        .map_err(AppError::Queue)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidInput("invalid_job_id".into()));
    };
    state
        .queue
        .get(uuid, &context.identity)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))
}

fn check_request(request: &RewriteRequest) -> Result<(), AppError> {
    if request.prompt.trim().is_empty() {
        return Err(AppError::InvalidInput("prompt must not be empty".into()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    identity: String,
    remaining: i64,
}

async fn get_quota(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<QuotaResponse>, AppError> {
    let remaining = state.pipeline.quota().remaining(&context.identity).await?;
    Ok(Json(QuotaResponse {
        identity: context.identity,
        remaining,
    }))
}

/// Takes the caller's credit before any work starts, so concurrent or queued
/// requests cannot spend more than the balance.
async fn reserve_credit(state: &AppState, context: &AuthContext) -> Result<Credit, AppError> {
    state
        .pipeline
        .quota()
        .reserve(&context.identity)
        .await?
        .ok_or(AppError::NoCredits)
}

#[derive(Debug)]
enum AppError {
    InvalidInput(String),
    Unauthorized(String),
    NotFound(String),
    NoCredits,
    Quota(QuotaError),
    Queue(ApiError),
    Rewrite(RewriteFailure),
}

impl From<RewriteFailure> for AppError {
    fn from(value: RewriteFailure) -> Self {
        Self::Rewrite(value)
    }
}

impl From<QuotaError> for AppError {
    fn from(value: QuotaError) -> Self {
        Self::Quota(value)
    }
}

fn failure_status(code: FailureCode) -> StatusCode {
    match code {
        FailureCode::FetchFailed | FailureCode::BadJson | FailureCode::BadJsonEmpty => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        FailureCode::GenerationFailed => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Rewrite(failure) => {
                return (failure_status(failure.error), Json(failure)).into_response();
            }
            AppError::Queue(err) => return (StatusCode::SERVICE_UNAVAILABLE, Json(err)).into_response(),
            AppError::InvalidInput(detail) => (StatusCode::BAD_REQUEST, "invalid_input", detail),
            AppError::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, "unauthorized", detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found", detail),
            AppError::NoCredits => (
                StatusCode::PAYMENT_REQUIRED,
                "NO_CREDITS",
                "free rewrites are used up".to_string(),
            ),
            AppError::Quota(err) => {
                error!(target: "wb.quota", error = %err, "quota_check_failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "quota_unavailable", err.to_string())
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
