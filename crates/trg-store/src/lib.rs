//! Contracts between the orchestration engine and its two external
//! collaborators: the state store (authoritative, durable) and the queue
//! broker (transient routing only).
//!
//! The engine never talks to Postgres or Redis directly; it holds
//! `Arc<dyn StateStore>` / `Arc<dyn QueueBroker>` and every backend —
//! including the deterministic in-memory pair used by tests and the
//! daemon's memory mode — implements these traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use trg_schemas::{
    Agent, AgentStatus, CoalesceKey, Group, GroupStatus, Job, JobResult, JobStatus, TestTarget,
};

pub mod keys;

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// The error taxonomy surfaced to callers. Request handlers map kinds to
/// HTTP statuses; periodic tasks log and continue.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already terminal: {0}")]
    AlreadyTerminal(String),
    #[error("illegal status value: {0}")]
    IllegalTransition(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wrap a store/broker driver error.
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        CoreError::Upstream(err.to_string())
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        CoreError::NotFound(format!("{entity} {id}"))
    }

    /// Stable kind tag used in error response bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyTerminal(_) => "already_terminal",
            CoreError::IllegalTransition(_) => "illegal_transition",
            CoreError::Conflict(_) => "conflict",
            CoreError::Upstream(_) => "upstream",
            CoreError::Internal(_) => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// Patch — tri-state partial-update field
// ---------------------------------------------------------------------------

/// A partial-update slot where "write NULL" is distinct from "leave alone".
/// The retry monitor needs this: it clears `error_message` rather than
/// keeping or overwriting it.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Clear,
}

// Manual impl: the derive would demand `T: Default`, which the timestamp
// fields cannot provide.
impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T: Clone> Patch<T> {
    pub fn apply(&self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Set(v) => *slot = Some(v.clone()),
            Patch::Clear => *slot = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// Partial update for a job. `status` is intentionally absent: status moves
/// only through [`StateStore::transition_job`] so the FSM guard cannot be
/// bypassed. Every applied patch bumps `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub assigned_agent: Patch<String>,
    pub error_message: Patch<String>,
    pub result: Option<JobResult>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Patch<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentPatch {
    pub status: Option<AgentStatus>,
    pub capabilities: Option<Vec<trg_schemas::Capability>>,
    pub max_concurrent_jobs: Option<u32>,
    pub current_jobs: Option<Vec<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupPatch {
    pub status: Option<GroupStatus>,
    pub assigned_agent: Patch<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// JobPage
// ---------------------------------------------------------------------------

/// One page of a filtered job listing plus the unpaged total.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Authoritative persistence for jobs, groups, and agents.
///
/// Every operation is single-statement atomic against the backend. Listing
/// order is always `priority DESC, created_at ASC, id ASC` (stable).
/// Backend failures surface as [`CoreError::Upstream`]; nothing is silently
/// dropped.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Jobs
    async fn create_jobs(&self, jobs: &[Job]) -> Result<(), CoreError>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>, CoreError>;
    async fn list_jobs(
        &self,
        org_id: Option<&str>,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<JobPage, CoreError>;
    /// Scheduler feed: jobs with `status = pending`, standard ordering.
    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, CoreError>;
    /// Group membership lookup: `status ∈ {pending, queued}` for the key.
    async fn jobs_by_app_version(
        &self,
        app_version_id: &str,
        target: TestTarget,
    ) -> Result<Vec<Job>, CoreError>;
    /// Orphan-sweep input: `status = running ∧ assigned_agent = agent_id`.
    async fn jobs_running_on_agent(&self, agent_id: &str) -> Result<Vec<Job>, CoreError>;
    /// Retry-monitor feed: jobs with `status = failed`, oldest update first.
    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, CoreError>;
    async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, CoreError>;
    /// Status write guarded by the job FSM: the edge `current → to` must be
    /// in [`JobStatus::can_transition_to`], otherwise [`CoreError::Conflict`].
    /// The patch is applied in the same atomic write.
    async fn transition_job(
        &self,
        id: &str,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, CoreError>;

    // Groups
    async fn create_group(&self, group: &Group) -> Result<(), CoreError>;
    async fn get_group(&self, id: &str) -> Result<Option<Group>, CoreError>;
    async fn update_group(&self, id: &str, patch: GroupPatch) -> Result<Group, CoreError>;
    /// Only used to discard the fresh loser of a group-creation race.
    async fn delete_group(&self, id: &str) -> Result<(), CoreError>;
    async fn find_active_group(&self, key: &CoalesceKey) -> Result<Option<Group>, CoreError>;
    async fn groups_by_status(&self, status: GroupStatus) -> Result<Vec<Group>, CoreError>;

    // Agents
    /// Upsert by id.
    async fn register_agent(&self, agent: &Agent) -> Result<(), CoreError>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, CoreError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, CoreError>;
    async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<Agent, CoreError>;
    /// Agents satisfying the dispatch-eligibility predicate, optionally
    /// narrowed to a capability target.
    async fn available_agents(&self, target: Option<TestTarget>) -> Result<Vec<Agent>, CoreError>;

    /// Cheap connectivity probe for the health endpoint.
    async fn healthcheck(&self) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// QueueBroker
// ---------------------------------------------------------------------------

/// Transient routing fabric: queues, score-ordered sets, TTL keys, pub/sub,
/// and ancillary set/hash indices.
///
/// Nothing authoritative lives here. On broker loss the scheduler rebuilds
/// its queues from the state store; pub/sub is at-most-once to currently
/// subscribed consumers.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    // FIFO list queues (push head, pop tail)
    async fn push_work(&self, queue: &str, payload: &Value) -> Result<(), CoreError>;
    async fn pop_work(&self, queue: &str) -> Result<Option<Value>, CoreError>;
    /// Blocking pop, bounded by `timeout`. The only long wait in the system;
    /// used by agent work consumers, never by the engine loops.
    async fn pop_work_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, CoreError>;

    // Score-ordered set
    async fn priority_add(&self, name: &str, member: &str, score: f64) -> Result<(), CoreError>;
    async fn priority_pop_max(&self, name: &str) -> Result<Option<String>, CoreError>;
    async fn priority_len(&self, name: &str) -> Result<u64, CoreError>;

    // Short-lived TTL values (set-if-absent doubles as a lock primitive)
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CoreError>;
    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn delete_value(&self, key: &str) -> Result<(), CoreError>;

    // Pub/sub, at-most-once to current subscribers
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), CoreError>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>, CoreError>;

    // Ancillary indices
    async fn set_add(&self, set: &str, member: &str) -> Result<(), CoreError>;
    async fn set_remove(&self, set: &str, member: &str) -> Result<(), CoreError>;
    async fn set_members(&self, set: &str) -> Result<Vec<String>, CoreError>;
    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), CoreError>;
    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, CoreError>;
    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), CoreError>;

    async fn healthcheck(&self) -> Result<(), CoreError>;
}
