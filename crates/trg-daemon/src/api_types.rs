//! Request and response types for all trg-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trg_schemas::{Capability, Job, JobResult, JobSpec, JobStatus};

// ---------------------------------------------------------------------------
// POST /api/jobs
// ---------------------------------------------------------------------------

/// A submission is either one spec or a batch under `jobs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubmitRequest {
    Batch { jobs: Vec<JobSpec> },
    Single(JobSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchResponse {
    pub job_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// GET /api/jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ListJobsQuery {
    pub org_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// PUT /api/jobs/:id/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    /// Raw status string; unknown values answer 400 illegal_transition.
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub job: Job,
}

// ---------------------------------------------------------------------------
// DELETE /api/jobs/:id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ---------------------------------------------------------------------------
// GET /api/jobs/:id/metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetricsResponse {
    pub id: String,
    pub status: JobStatus,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at − started_at`, null until both exist.
    pub duration_ms: Option<i64>,
    /// `(started_at ?? now) − created_at`.
    pub queue_time_ms: i64,
    pub retry_count: u32,
    pub result: Option<JobResult>,
}

// ---------------------------------------------------------------------------
// /api/agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentResponse {
    pub agent_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    /// Raw agent status string; unknown values answer 400 validation.
    pub status: String,
    #[serde(default)]
    pub current_jobs: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub store_ok: bool,
    pub broker_ok: bool,
}
