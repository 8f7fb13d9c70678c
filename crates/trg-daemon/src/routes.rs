//! Axum router and all HTTP handlers for trg-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;

use trg_schemas::{AgentStatus, Job, JobStatus};
use trg_store::CoreError;

use crate::api_types::{
    HealthResponse, HeartbeatRequest, JobMetricsResponse, ListJobsQuery, ListJobsResponse,
    MessageResponse, RegisterAgentRequest, RegisterAgentResponse, SubmitBatchResponse,
    SubmitRequest, UpdateStatusRequest, UpdateStatusResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_jobs).get(list_jobs))
        .route("/api/jobs/:id", get(get_job).delete(cancel_job))
        .route("/api/jobs/:id/status", put(update_job_status))
        .route("/api/jobs/:id/metrics", get(job_metrics))
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents/:id/heartbeat", post(agent_heartbeat))
        .route("/api/agents/:id", get(get_agent))
        .route("/api/agents", get(list_agents))
        .route("/api/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /api/jobs
// ---------------------------------------------------------------------------

/// Accepts a single `JobSpec` (answers the created `Job`) or
/// `{jobs: [JobSpec]}` (answers `{job_ids}`). Specs are validated before
/// anything is written, so a batch is all-or-nothing.
pub(crate) async fn submit_jobs(
    State(st): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<Response> {
    let now = Utc::now();
    match req {
        SubmitRequest::Single(spec) => {
            spec.validate().map_err(CoreError::Validation)?;
            let job = Job::from_spec(spec, now);
            st.store.create_jobs(std::slice::from_ref(&job)).await?;
            tracing::info!(job = %job.id, org = %job.org_id, "job submitted");
            Ok((StatusCode::CREATED, Json(job)).into_response())
        }
        SubmitRequest::Batch { jobs: specs } => {
            if specs.is_empty() {
                return Err(ApiError(CoreError::Validation(
                    "jobs must not be empty".to_string(),
                )));
            }
            for spec in &specs {
                spec.validate().map_err(CoreError::Validation)?;
            }
            let jobs: Vec<Job> = specs
                .into_iter()
                .map(|spec| Job::from_spec(spec, now))
                .collect();
            st.store.create_jobs(&jobs).await?;
            let job_ids: Vec<String> = jobs.into_iter().map(|j| j.id).collect();
            tracing::info!(count = job_ids.len(), "job batch submitted");
            Ok((StatusCode::CREATED, Json(SubmitBatchResponse { job_ids })).into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/jobs
// ---------------------------------------------------------------------------

pub(crate) async fn list_jobs(
    State(st): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<ListJobsResponse>> {
    let status = match &query.status {
        None => None,
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| CoreError::Validation(format!("unknown status: {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(0);
    let offset = query.offset.unwrap_or(0).max(0);

    let page = st
        .store
        .list_jobs(query.org_id.as_deref(), status, limit, offset)
        .await?;
    let has_more = (offset as u64) + (page.jobs.len() as u64) < page.total;
    Ok(Json(ListJobsResponse {
        jobs: page.jobs,
        total: page.total,
        has_more,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/jobs/:id
// ---------------------------------------------------------------------------

pub(crate) async fn get_job(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = st
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::not_found("job", &id))?;
    Ok(Json(job))
}

// ---------------------------------------------------------------------------
// PUT /api/jobs/:id/status
// ---------------------------------------------------------------------------

pub(crate) async fn update_job_status(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<Json<UpdateStatusResponse>> {
    let job = st
        .lifecycle
        .update_status(&id, &req.status, req.error_message, req.result)
        .await?;
    Ok(Json(UpdateStatusResponse { job }))
}

// ---------------------------------------------------------------------------
// DELETE /api/jobs/:id
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_job(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<crate::api_types::CancelRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let reason = body.and_then(|Json(req)| req.reason);
    let job = st.lifecycle.cancel(&id, reason).await?;
    Ok(Json(MessageResponse {
        message: format!("job {} cancelled", job.id),
    }))
}

// ---------------------------------------------------------------------------
// GET /api/jobs/:id/metrics
// ---------------------------------------------------------------------------

pub(crate) async fn job_metrics(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobMetricsResponse>> {
    let job = st
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::not_found("job", &id))?;

    let duration_ms = match (job.started_at, job.completed_at) {
        (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
        _ => None,
    };
    let queue_end = job.started_at.unwrap_or_else(Utc::now);
    let queue_time_ms = (queue_end - job.created_at).num_milliseconds();

    Ok(Json(JobMetricsResponse {
        id: job.id,
        status: job.status,
        priority: job.priority,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        duration_ms,
        queue_time_ms,
        retry_count: job.retry_count,
        result: job.result,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/agents/register
// ---------------------------------------------------------------------------

pub(crate) async fn register_agent(
    State(st): State<Arc<AppState>>,
    Json(req): Json<RegisterAgentRequest>,
) -> ApiResult<Json<RegisterAgentResponse>> {
    let agent = st
        .lifecycle
        .register_agent(&req.id, req.name, req.capabilities, req.max_concurrent_jobs)
        .await?;
    Ok(Json(RegisterAgentResponse { agent_id: agent.id }))
}

// ---------------------------------------------------------------------------
// POST /api/agents/:id/heartbeat
// ---------------------------------------------------------------------------

pub(crate) async fn agent_heartbeat(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<trg_schemas::Agent>> {
    let status = AgentStatus::parse(&req.status)
        .ok_or_else(|| CoreError::Validation(format!("unknown agent status: {}", req.status)))?;
    let agent = st
        .lifecycle
        .heartbeat(&id, status, req.current_jobs)
        .await?;
    Ok(Json(agent))
}

// ---------------------------------------------------------------------------
// GET /api/agents/:id  /  GET /api/agents
// ---------------------------------------------------------------------------

pub(crate) async fn get_agent(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<trg_schemas::Agent>> {
    let agent = st
        .store
        .get_agent(&id)
        .await?
        .ok_or_else(|| CoreError::not_found("agent", &id))?;
    Ok(Json(agent))
}

pub(crate) async fn list_agents(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<trg_schemas::Agent>>> {
    Ok(Json(st.store.list_agents().await?))
}

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Response {
    let store_ok = st.store.healthcheck().await.is_ok();
    let broker_ok = st.broker.healthcheck().await.is_ok();
    let ok = store_ok && broker_ok;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ok,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            store_ok,
            broker_ok,
        }),
    )
        .into_response()
}
