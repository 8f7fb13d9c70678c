//! Shared entity and wire types for TestRig. No I/O, no business logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TestTarget
// ---------------------------------------------------------------------------

/// Execution environment class for a test job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestTarget {
    Emulator,
    Device,
    Cloud,
}

impl TestTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestTarget::Emulator => "emulator",
            TestTarget::Device => "device",
            TestTarget::Cloud => "cloud",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "emulator" => Some(TestTarget::Emulator),
            "device" => Some(TestTarget::Device),
            "cloud" => Some(TestTarget::Cloud),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses carry `completed_at`. `failed` is terminal but may
    /// still re-enter `pending` through the retry monitor.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edge table of the job state machine:
    ///
    /// ```text
    /// pending → queued | cancelled
    /// queued  → running | cancelled
    /// running → completed | failed | cancelled
    /// failed  → pending            (retry)
    /// completed, cancelled → ∅
    /// ```
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

// ---------------------------------------------------------------------------
// GroupStatus / AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Pending,
    Assigned,
    Running,
    Completed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Assigned => "assigned",
            GroupStatus::Running => "running",
            GroupStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GroupStatus::Pending),
            "assigned" => Some(GroupStatus::Assigned),
            "running" => Some(GroupStatus::Running),
            "completed" => Some(GroupStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Offline,
    Online,
    Busy,
    Maintenance,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "offline",
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(AgentStatus::Offline),
            "online" => Some(AgentStatus::Online),
            "busy" => Some(AgentStatus::Busy),
            "maintenance" => Some(AgentStatus::Maintenance),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// One execution environment an agent can serve. `platform`, `os_version`
/// and `device_name` narrow the match when a dispatch carries those
/// constraints; absent fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub target: TestTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl Capability {
    pub fn matches_target(&self, target: TestTarget) -> bool {
        self.target == target
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    pub target: TestTarget,
    /// Declared scheduling priority, 1..=10 (10 = highest).
    pub priority: u8,
    pub status: JobStatus,
    pub retry_count: u32,
    pub assigned_agent: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<JobResult>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a validated spec into a fresh pending job.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: new_job_id(),
            org_id: spec.org_id,
            app_version_id: spec.app_version_id,
            test_path: spec.test_path,
            target: spec.target,
            priority: spec.priority,
            status: JobStatus::Pending,
            retry_count: 0,
            assigned_agent: None,
            error_message: None,
            result: None,
            metadata: spec.metadata.unwrap_or_else(|| Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn coalesce_key(&self) -> CoalesceKey {
        CoalesceKey {
            org_id: self.org_id.clone(),
            app_version_id: self.app_version_id.clone(),
            target: self.target,
        }
    }
}

/// Aggregate test report attached to a job at terminal success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Value>,
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// Client-submitted job description. Validated before a job is coined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    pub target: TestTarget,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl JobSpec {
    /// Field-level validation; returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.org_id.trim().is_empty() {
            return Err("org_id must not be empty".to_string());
        }
        if self.app_version_id.trim().is_empty() {
            return Err("app_version_id must not be empty".to_string());
        }
        if self.test_path.trim().is_empty() {
            return Err("test_path must not be empty".to_string());
        }
        if !(1..=10).contains(&self.priority) {
            return Err(format!(
                "priority must be in 1..=10, got {}",
                self.priority
            ));
        }
        if let Some(meta) = &self.metadata {
            if !meta.is_object() {
                return Err("metadata must be a JSON object".to_string());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CoalesceKey
// ---------------------------------------------------------------------------

/// The grouping key: jobs sharing it coalesce into one unit of dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub org_id: String,
    pub app_version_id: String,
    pub target: TestTarget,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// An active coalescence of non-terminal jobs sharing a [`CoalesceKey`].
/// Membership is implicit: the member jobs are looked up by key in the
/// state store, never stored on the group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub org_id: String,
    pub app_version_id: String,
    pub target: TestTarget,
    pub status: GroupStatus,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(key: CoalesceKey, now: DateTime<Utc>) -> Self {
        Self {
            id: new_group_id(),
            org_id: key.org_id,
            app_version_id: key.app_version_id,
            target: key.target,
            status: GroupStatus::Pending,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    pub max_concurrent_jobs: u32,
    /// In-flight work ids. The dispatcher appends group ids at assignment;
    /// heartbeats overwrite the list with the agent's own report.
    pub current_jobs: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn has_capacity(&self) -> bool {
        (self.current_jobs.len() as u32) < self.max_concurrent_jobs
    }

    pub fn serves_target(&self, target: TestTarget) -> bool {
        self.capabilities.iter().any(|c| c.matches_target(target))
    }

    /// Dispatch-eligible: online or busy, spare capacity, capability match.
    pub fn is_dispatch_eligible(&self, target: TestTarget) -> bool {
        matches!(self.status, AgentStatus::Online | AgentStatus::Busy)
            && self.has_capacity()
            && self.serves_target(target)
    }
}

// ---------------------------------------------------------------------------
// Broker payloads
// ---------------------------------------------------------------------------

/// Entry stored in the `groups:descriptors` hash and scored into the
/// `groups:scheduling` priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group_id: String,
    pub app_version_id: String,
    pub target: TestTarget,
    pub job_count: usize,
    pub priority_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Item pushed onto an agent's work queue when a group is assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub group_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub assigned_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn job_group(group_id: String, assigned_at: DateTime<Utc>) -> Self {
        Self {
            group_id,
            kind: "job_group".to_string(),
            assigned_at,
        }
    }
}

/// Cancellation notice published to `agent:{id}:cancel`. Field names are
/// camelCase on the wire; agents treat delivery as best-effort and the
/// notice itself as idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelNotice {
    pub job_id: String,
    pub reason: String,
}

/// Published to `job:status:updated` after every status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEvent {
    pub job_id: String,
    pub new_status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

/// Published to `job:completed` when a result report lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub success: bool,
    pub duration: Option<i64>,
}

// ---------------------------------------------------------------------------
// Id coining
// ---------------------------------------------------------------------------

pub fn new_job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

pub fn new_group_id() -> String {
    format!("grp-{}", Uuid::new_v4())
}
