mod artifacts;
mod batch;
mod cache;
mod discovery;
mod evaluate;
mod events;
mod jobs;
mod llm;
mod metrics;
mod models;
mod recipe;
mod refine;
mod sandbox;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use artifacts::ArtifactStore;
use batch::{BatchConfig, BatchScheduler};
use cache::CacheStore;
use discovery::Extractor;
use evaluate::{EvalConfig, Evaluator};
use jobs::{JobEntry, JobError, JobPhase, JobRegistry};
use llm::{GatewayClient, LlmService};
use models::{
    ApiError, CacheEntry, DataModel, ProductRecord, Recipe, ReuseMode, StyleProfile,
};
use refine::{RefineConfig, RefineController, RefineStatus};
use sandbox::{Sandbox, SandboxConfig};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "listwright.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let llm: Arc<dyn LlmService> = Arc::new(GatewayClient::from_env()?);
    let state = AppState {
        registry: JobRegistry::new(),
        store: ArtifactStore::from_env(),
        cache: CacheStore::from_env(),
        llm,
        sandbox: Sandbox::new(SandboxConfig::from_env()),
        eval_config: EvalConfig::from_env(),
        refine_config: RefineConfig::from_env(),
        batch_config: BatchConfig::from_env(),
        extraction_max_attempts: Extractor::max_attempts_from_env(),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}/extract", post(extract_products))
        .route("/jobs/{id}/reuse", post(reuse_from_cache))
        .route("/jobs/{id}/refine", post(start_refine))
        .route("/jobs/{id}/approve", post(approve_recipe))
        .route("/jobs/{id}/execute", post(start_batch))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/events", get(job_events))
        .route("/cache/{fingerprint}", get(cache_lookup))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "listwright.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    registry: JobRegistry,
    store: ArtifactStore,
    cache: CacheStore,
    llm: Arc<dyn LlmService>,
    sandbox: Sandbox,
    eval_config: EvalConfig,
    refine_config: RefineConfig,
    batch_config: BatchConfig,
    extraction_max_attempts: u32,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    fn evaluator(&self) -> Evaluator {
        Evaluator::new(
            Arc::clone(&self.llm),
            self.sandbox.clone(),
            self.eval_config.clone(),
        )
    }

    async fn entry(&self, id: &str) -> Result<Arc<JobEntry>, AppError> {
        let uuid = Uuid::parse_str(id)
            .map_err(|_| AppError::BadRequest("invalid job id".to_string()))?;
        Ok(self.registry.get(uuid).await?)
    }
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<JobError> for AppError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound => AppError::NotFound("job not found".to_string()),
            JobError::Busy => AppError::Conflict(value.to_string()),
        }
    }
}

impl From<artifacts::ArtifactError> for AppError {
    fn from(value: artifacts::ArtifactError) -> Self {
        AppError::Internal(value.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid_input", detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found", detail),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "conflict", detail),
            AppError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", detail),
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listwright-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(2 * 1024 * 1024)
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    style_profile: StyleProfile,
    /// Pre-structured records, for callers that skip raw extraction.
    #[serde(default)]
    records: Option<Vec<ProductRecord>>,
}

#[derive(Debug, Serialize)]
struct CacheHitSummary {
    fingerprint: String,
    fields: Vec<String>,
    product_count: usize,
    platform: String,
    recipe_version: u32,
    created_at: DateTime<Utc>,
    source_job_id: String,
}

impl CacheHitSummary {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint.clone(),
            fields: entry.fields.clone(),
            product_count: entry.product_count,
            platform: entry.platform.clone(),
            recipe_version: entry.recipe.version,
            created_at: entry.created_at,
            source_job_id: entry.source_job_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_hit: Option<CacheHitSummary>,
}

/// Open a job around a style profile, optionally with records already in
/// hand. When records are given the response reports whether this upload
/// shape has been seen before, so the caller can offer reuse.
async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, AppError> {
    crate::metrics::inc_requests("/jobs");
    let entry = state.registry.create().await;
    let job_id = entry.context.id;
    state
        .store
        .save_style_profile(job_id, &payload.style_profile)
        .await?;

    let mut fingerprint = None;
    let mut cache_hit = None;
    if let Some(records) = payload.records {
        if records.is_empty() {
            return Err(AppError::BadRequest("records must not be empty".to_string()));
        }
        let fp = cache::fingerprint(&records);
        cache_hit = state
            .cache
            .lookup(&fp)
            .await
            .as_ref()
            .map(CacheHitSummary::from_entry);
        fingerprint = Some(fp);

        let model = DataModel {
            fields_discovered: cache::fingerprint_fields(&records),
            products: records,
            extraction_attempts: 0,
        };
        state.store.save_data_model(job_id, &model).await?;
        entry.set_phase(JobPhase::Discovering).await;
    }

    Ok(Json(CreateJobResponse {
        job_id: job_id.to_string(),
        fingerprint,
        cache_hit,
    }))
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    raw_data: String,
    #[serde(default)]
    image_names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExtractResponse {
    product_count: usize,
    fields_discovered: Vec<String>,
    attempts: u32,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_hit: Option<CacheHitSummary>,
}

/// Run discovery extraction over a raw upload. Synchronous: extraction is
/// bounded by the attempt budget, and the caller needs the outcome before
/// deciding what to do next.
async fn extract_products(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/extract");
    let entry = state.entry(&id).await?;
    if payload.raw_data.trim().is_empty() {
        return Err(AppError::BadRequest("raw_data is empty".to_string()));
    }

    entry.set_phase(JobPhase::Discovering).await;
    let extractor = Extractor::new(
        Arc::clone(&state.llm),
        state.sandbox.clone(),
        state.extraction_max_attempts,
    );
    let outcome = extractor
        .extract(&payload.raw_data, &payload.image_names)
        .await
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    let model = outcome.data_model;
    state.store.save_data_model(entry.context.id, &model).await?;
    state
        .store
        .save_extraction_script(entry.context.id, &outcome.script)
        .await?;
    entry.bus.emit(
        &entry.context.id.to_string(),
        events::EventKind::ExtractionFinished {
            attempts: model.extraction_attempts,
            product_count: model.products.len(),
        },
    );

    let fingerprint = cache::fingerprint(&model.products);
    let cache_hit = state
        .cache
        .lookup(&fingerprint)
        .await
        .as_ref()
        .map(CacheHitSummary::from_entry);

    Ok(Json(ExtractResponse {
        product_count: model.products.len(),
        fields_discovered: model.fields_discovered,
        attempts: model.extraction_attempts,
        fingerprint,
        cache_hit,
    }))
}

#[derive(Debug, Deserialize)]
struct ReuseRequest {
    fingerprint: String,
    mode: ReuseMode,
}

#[derive(Debug, Serialize)]
struct ReuseResponse {
    mode: ReuseMode,
    reused_recipe: bool,
    reused_style_profile: bool,
}

/// Apply a cache entry to this job under a caller-chosen mode. Full reuse
/// installs the cached profile and an approved recipe, making the job ready
/// for batch immediately.
async fn reuse_from_cache(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ReuseRequest>,
) -> Result<Json<ReuseResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/reuse");
    let entry = state.entry(&id).await?;
    let cached = state
        .cache
        .lookup(&payload.fingerprint)
        .await
        .ok_or_else(|| AppError::NotFound("no cache entry for fingerprint".to_string()))?;

    let reused = cache::apply_entry(&cached, payload.mode);
    let reused_recipe = reused.recipe.is_some();
    let reused_style_profile = reused.style_profile.is_some();

    if let Some(profile) = &reused.style_profile {
        state.store.save_style_profile(entry.context.id, profile).await?;
    }
    if let Some(recipe) = &reused.recipe {
        state.store.save_recipe(entry.context.id, recipe).await?;
        entry.set_phase(JobPhase::Approved).await;
    }

    info!(
        target = "listwright.api",
        job_id = %entry.context.id,
        fingerprint = %payload.fingerprint,
        mode = ?payload.mode,
        reused_recipe,
        "cache entry applied"
    );
    Ok(Json(ReuseResponse {
        mode: payload.mode,
        reused_recipe,
        reused_style_profile,
    }))
}

#[derive(Debug, Serialize)]
struct TaskStartedResponse {
    job_id: String,
    status: &'static str,
}

/// Kick off the auto-refine loop in the background. Progress arrives on the
/// job's event stream; a second refine or execute while one is running gets
/// a conflict.
async fn start_refine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStartedResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/refine");
    let entry = state.entry(&id).await?;
    let job_id = entry.context.id;

    let style = state
        .store
        .load_style_profile(job_id)
        .await?
        .unwrap_or_default();
    let model = state.store.load_data_model(job_id).await?.ok_or_else(|| {
        AppError::BadRequest("job has no data model; extract or supply records first".to_string())
    })?;
    if model.products.is_empty() {
        return Err(AppError::BadRequest("data model has no products".to_string()));
    }

    let guard = state.registry.try_begin(&entry)?;
    let task_state = state.clone();
    let task_entry = Arc::clone(&entry);
    tokio::spawn(async move {
        let _guard = guard;
        task_entry.set_phase(JobPhase::Refining).await;
        let controller = RefineController::new(
            Arc::clone(&task_state.llm),
            task_state.evaluator(),
            task_state.refine_config.clone(),
        );
        let outcome = controller
            .run(&task_entry.context, &task_entry.bus, &style, &model.products)
            .await;

        if let Err(err) = task_state.store.save_recipe(job_id, &outcome.recipe).await {
            warn!(target = "listwright.api", job_id = %job_id, error = %err, "failed to persist recipe");
        }
        if let Err(err) = task_state
            .store
            .save_test_results(job_id, &outcome.test_results)
            .await
        {
            warn!(target = "listwright.api", job_id = %job_id, error = %err, "failed to persist test results");
        }
        let phase = match outcome.status {
            RefineStatus::Done => JobPhase::AwaitingApproval,
            RefineStatus::Stuck => JobPhase::NeedsReview,
        };
        task_entry.set_phase(phase).await;
    });

    Ok(Json(TaskStartedResponse {
        job_id: job_id.to_string(),
        status: "started",
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ApproveRequest {
    /// Approve even without test results, e.g. after manual recipe edits.
    #[serde(default)]
    r#override: bool,
}

#[derive(Debug, Serialize)]
struct ApproveResponse {
    recipe_version: u32,
    approved: bool,
    cached_fingerprint: Option<String>,
}

/// Explicit human approval gate. On approval the recipe and profile are
/// published to the pipeline cache keyed by the upload's fingerprint.
async fn approve_recipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<ApproveResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/approve");
    let entry = state.entry(&id).await?;
    let job_id = entry.context.id;

    let mut recipe = state
        .store
        .load_recipe(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound("job has no recipe to approve".to_string()))?;
    let test_results = state
        .store
        .load_test_results(job_id)
        .await?
        .unwrap_or_default();
    if test_results.is_empty() && !request.r#override {
        return Err(AppError::Conflict(
            "recipe has never been tested; set override to approve anyway".to_string(),
        ));
    }

    recipe.approved = true;
    state.store.save_recipe(job_id, &recipe).await?;
    entry.set_phase(JobPhase::Approved).await;

    let mut cached_fingerprint = None;
    if let Some(model) = state.store.load_data_model(job_id).await? {
        let style = state
            .store
            .load_style_profile(job_id)
            .await?
            .unwrap_or_default();
        let fingerprint = cache::fingerprint(&model.products);
        let cache_entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            fields: model.fields_discovered.clone(),
            product_count: model.products.len(),
            platform: style.platform.clone(),
            style_profile: style,
            recipe: recipe.clone(),
            created_at: Utc::now(),
            source_job_id: job_id.to_string(),
        };
        state.cache.store(cache_entry).await;
        cached_fingerprint = Some(fingerprint);
    }

    info!(
        target = "listwright.api",
        job_id = %job_id,
        recipe_version = recipe.version,
        cached = cached_fingerprint.is_some(),
        "recipe approved"
    );
    Ok(Json(ApproveResponse {
        recipe_version: recipe.version,
        approved: true,
        cached_fingerprint,
    }))
}

/// Apply the approved recipe to every product in the background.
async fn start_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStartedResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/execute");
    let entry = state.entry(&id).await?;
    let job_id = entry.context.id;

    let recipe = state
        .store
        .load_recipe(job_id)
        .await?
        .ok_or_else(|| AppError::BadRequest("job has no recipe".to_string()))?;
    if !recipe.approved {
        return Err(AppError::Conflict(
            "recipe is not approved; approve or reuse one first".to_string(),
        ));
    }
    let style = state
        .store
        .load_style_profile(job_id)
        .await?
        .unwrap_or_default();
    let model = state
        .store
        .load_data_model(job_id)
        .await?
        .ok_or_else(|| AppError::BadRequest("job has no data model".to_string()))?;

    let guard = state.registry.try_begin(&entry)?;
    let task_state = state.clone();
    let task_entry = Arc::clone(&entry);
    tokio::spawn(async move {
        let _guard = guard;
        task_entry.set_phase(JobPhase::Executing).await;
        let scheduler = BatchScheduler::new(
            Arc::clone(&task_state.llm),
            task_state.evaluator(),
            task_state.batch_config.clone(),
        );
        let (report, results) = scheduler
            .execute(
                &task_entry.context,
                &task_entry.bus,
                &recipe,
                &style,
                &model.products,
            )
            .await;

        for result in &results {
            if let Err(err) = task_state.store.save_listing(job_id, result).await {
                warn!(target = "listwright.api", job_id = %job_id, product_id = %result.product_id, error = %err, "failed to persist listing");
            }
        }
        if let Err(err) = task_state.store.save_report(job_id, &report).await {
            warn!(target = "listwright.api", job_id = %job_id, error = %err, "failed to persist batch report");
        }
        crate::metrics::batch_finished(report.succeeded, report.failed, report.retried);
        task_entry.set_phase(JobPhase::Complete).await;
    });

    Ok(Json(TaskStartedResponse {
        job_id: job_id.to_string(),
        status: "started",
    }))
}

/// Request cancellation. Advisory: the running refine or batch task notices
/// between steps and winds down with every item in a terminal state.
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/jobs/cancel");
    let entry = state.entry(&id).await?;
    entry.context.cancel();
    info!(target = "listwright.api", job_id = %entry.context.id, "cancellation requested");
    Ok(Json(json!({ "job_id": id, "status": "cancelling" })))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    phase: JobPhase,
    created_at: DateTime<Utc>,
    cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipe_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipe_approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<models::BatchReport>,
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let entry = state.entry(&id).await?;
    let job_id = entry.context.id;

    let model = state.store.load_data_model(job_id).await?;
    let recipe: Option<Recipe> = state.store.load_recipe(job_id).await?;
    let report = state.store.load_report(job_id).await?;

    Ok(Json(JobStatusResponse {
        job_id: job_id.to_string(),
        phase: entry.phase().await,
        created_at: entry.created_at,
        cancelled: entry.context.cancelled(),
        product_count: model.map(|m| m.products.len()),
        recipe_version: recipe.as_ref().map(|r| r.version),
        recipe_approved: recipe.as_ref().map(|r| r.approved),
        report,
    }))
}

/// Server-sent progress stream for one job. Subscribers joining mid-run see
/// events from that point on; a lagging consumer drops old events rather
/// than stalling the producer.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let entry = state.entry(&id).await?;
    let stream = BroadcastStream::new(entry.bus.subscribe()).filter_map(|received| {
        let event = received.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default().event("progress").data(data),
        ))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cache_lookup(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<CacheHitSummary>, AppError> {
    crate::metrics::inc_requests("/cache");
    let entry = state
        .cache
        .lookup(&fingerprint)
        .await
        .ok_or_else(|| AppError::NotFound("no cache entry for fingerprint".to_string()))?;
    Ok(Json(CacheHitSummary::from_entry(&entry)))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
