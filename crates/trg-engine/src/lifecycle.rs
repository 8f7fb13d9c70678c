//! Job and agent lifecycle: heartbeat ingest with orphan detection, the
//! retry monitor, cancellation, and result reporting.
//!
//! Request-driven entry points (`heartbeat`, `cancel`, `record_result`,
//! `update_status`, `register_agent`) are called synchronously by the HTTP
//! surface; `retry_tick`/`sweep_stale_agents` run on the retry interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use trg_config::CoreConfig;
use trg_schemas::{
    Agent, AgentStatus, CancelNotice, Capability, Group, GroupStatus, Job, JobCompletedEvent,
    JobResult, JobStatus, JobStatusEvent,
};
use trg_store::{keys, AgentPatch, CoreError, GroupPatch, JobPatch, Patch, QueueBroker, StateStore};

/// Stable message written to orphaned jobs so the retry monitor picks them
/// up deterministically.
pub const ORPHAN_ERROR_MESSAGE: &str = "Job lost connection with agent";

const DEFAULT_CANCEL_REASON: &str = "Job cancelled by user";
const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 3;

/// Max failed jobs considered per retry tick.
const RETRY_BATCH: i64 = 50;

pub struct Lifecycle {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn QueueBroker>,
    cfg: CoreConfig,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn QueueBroker>,
        cfg: CoreConfig,
    ) -> Self {
        Self { store, broker, cfg }
    }

    /// Spawn the retry/staleness loop; tick errors are logged and swallowed.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        crate::loops::spawn_periodic("lifecycle", interval, move || {
            let this = Arc::clone(&self);
            async move {
                this.retry_tick().await?;
                this.sweep_stale_agents().await?;
                Ok(())
            }
        })
    }

    // -----------------------------------------------------------------------
    // Agent registration & heartbeat
    // -----------------------------------------------------------------------

    /// Register (or re-register) an agent. Fresh agents come up `offline`
    /// with empty in-flight work; a heartbeat brings them online.
    pub async fn register_agent(
        &self,
        id: &str,
        name: Option<String>,
        capabilities: Vec<Capability>,
        max_concurrent_jobs: Option<u32>,
    ) -> Result<Agent, CoreError> {
        if id.trim().is_empty() {
            return Err(CoreError::Validation("agent id must not be empty".into()));
        }
        let max = max_concurrent_jobs.unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
        if max == 0 {
            return Err(CoreError::Validation(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        let now = Utc::now();
        let agent = Agent {
            id: id.to_string(),
            name: name.unwrap_or_else(|| id.to_string()),
            capabilities,
            status: AgentStatus::Offline,
            max_concurrent_jobs: max,
            current_jobs: Vec::new(),
            last_heartbeat: now,
            registered_at: now,
        };
        self.store.register_agent(&agent).await?;
        self.broker
            .set_add(keys::AGENTS_REGISTERED, &agent.id)
            .await?;
        info!(agent = %agent.id, capabilities = agent.capabilities.len(), "agent registered");
        Ok(agent)
    }

    /// Ingest a heartbeat: update the agent row, then sweep for orphans —
    /// running jobs the store attributes to this agent that the agent no
    /// longer reports. Identical consecutive heartbeats are idempotent; an
    /// orphaned job is already `failed` on the second pass and the sweep
    /// skips it.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_jobs: Option<Vec<String>>,
    ) -> Result<Agent, CoreError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::not_found("agent", agent_id))?;

        let reported = current_jobs.unwrap_or_else(|| agent.current_jobs.clone());
        let agent = self
            .store
            .update_agent(
                agent_id,
                AgentPatch {
                    status: Some(status),
                    current_jobs: Some(reported.clone()),
                    last_heartbeat: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        let running = self.store.jobs_running_on_agent(agent_id).await?;
        for job in running
            .into_iter()
            .filter(|j| !reported.iter().any(|r| r == &j.id))
        {
            warn!(job = %job.id, agent = %agent_id, "running job no longer reported; marking failed");
            let failed = self
                .store
                .transition_job(
                    &job.id,
                    JobStatus::Failed,
                    JobPatch {
                        error_message: Patch::Set(ORPHAN_ERROR_MESSAGE.to_string()),
                        completed_at: Patch::Set(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.maybe_finish_group(&failed).await?;
        }
        Ok(agent)
    }

    /// Mark agents silent past the heartbeat horizon offline and fail the
    /// running jobs attributed to them — a dead agent never sends the empty
    /// heartbeat that would orphan its jobs otherwise.
    pub async fn sweep_stale_agents(&self) -> Result<usize, CoreError> {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.cfg.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut swept = 0;
        for agent in self.store.list_agents().await? {
            if agent.status == AgentStatus::Offline || agent.last_heartbeat >= horizon {
                continue;
            }
            warn!(agent = %agent.id, last_heartbeat = %agent.last_heartbeat, "agent went silent; marking offline");
            self.store
                .update_agent(
                    &agent.id,
                    AgentPatch {
                        status: Some(AgentStatus::Offline),
                        current_jobs: Some(Vec::new()),
                        ..Default::default()
                    },
                )
                .await?;
            for job in self.store.jobs_running_on_agent(&agent.id).await? {
                let failed = self
                    .store
                    .transition_job(
                        &job.id,
                        JobStatus::Failed,
                        JobPatch {
                            error_message: Patch::Set(ORPHAN_ERROR_MESSAGE.to_string()),
                            completed_at: Patch::Set(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.maybe_finish_group(&failed).await?;
            }
            swept += 1;
        }
        Ok(swept)
    }

    // -----------------------------------------------------------------------
    // Retry monitor
    // -----------------------------------------------------------------------

    /// Promote aged-out failures back to `pending`. The scheduler then
    /// regroups them like any fresh submission.
    pub async fn retry_tick(&self) -> Result<usize, CoreError> {
        let now = Utc::now();
        let delay =
            chrono::Duration::from_std(self.cfg.retry_delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut retried = 0;
        for job in self.store.failed_jobs(RETRY_BATCH).await? {
            if job.retry_count >= self.cfg.max_retries {
                continue;
            }
            if now - job.updated_at < delay {
                continue;
            }
            // error_message and completed_at are cleared, not kept: the job
            // is no longer terminal and carries no failure.
            self.store
                .transition_job(
                    &job.id,
                    JobStatus::Pending,
                    JobPatch {
                        retry_count: Some(job.retry_count + 1),
                        error_message: Patch::Clear,
                        completed_at: Patch::Clear,
                        ..Default::default()
                    },
                )
                .await?;
            info!(job = %job.id, retry = job.retry_count + 1, "failed job requeued for retry");
            retried += 1;
        }
        Ok(retried)
    }

    // -----------------------------------------------------------------------
    // Cancellation & results
    // -----------------------------------------------------------------------

    /// Cancel takes effect on the server immediately; a running job's agent
    /// learns asynchronously over its cancel channel and treats the notice
    /// as idempotent.
    pub async fn cancel(&self, job_id: &str, reason: Option<String>) -> Result<Job, CoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        if job.status.is_terminal() {
            return Err(CoreError::AlreadyTerminal(format!(
                "job {job_id} is already {}",
                job.status.as_str()
            )));
        }

        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        let was_running = job.status == JobStatus::Running;
        let cancelled = self
            .store
            .transition_job(
                job_id,
                JobStatus::Cancelled,
                JobPatch {
                    error_message: Patch::Set(reason.clone()),
                    completed_at: Patch::Set(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if was_running {
            if let Some(agent_id) = &cancelled.assigned_agent {
                let notice = CancelNotice {
                    job_id: job_id.to_string(),
                    reason,
                };
                let payload = serde_json::to_value(&notice)
                    .map_err(|e| CoreError::Internal(format!("cancel notice: {e}")))?;
                self.broker
                    .publish(&keys::agent_cancel_channel(agent_id), &payload)
                    .await?;
            }
        }

        info!(job = %job_id, "job cancelled");
        self.maybe_finish_group(&cancelled).await?;
        Ok(cancelled)
    }

    /// Consume an agent's result report. Duplicate reports for a job that
    /// already reached the same terminal state are absorbed.
    pub async fn record_result(
        &self,
        job_id: &str,
        report: JobResult,
    ) -> Result<Job, CoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        let to = if report.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if job.status == to {
            debug!(job = %job_id, status = to.as_str(), "duplicate result report absorbed");
            return Ok(job);
        }

        let updated = self
            .store
            .transition_job(
                job_id,
                to,
                JobPatch {
                    result: Some(report.clone()),
                    completed_at: Patch::Set(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        let event = JobCompletedEvent {
            job_id: job_id.to_string(),
            status: to,
            success: report.success,
            duration: Some(report.duration_ms),
        };
        let payload = serde_json::to_value(&event)
            .map_err(|e| CoreError::Internal(format!("completion event: {e}")))?;
        self.broker
            .publish(keys::CHANNEL_JOB_COMPLETED, &payload)
            .await?;

        info!(job = %job_id, status = to.as_str(), tests = report.tests_run, "result recorded");
        self.maybe_finish_group(&updated).await?;
        Ok(updated)
    }

    /// Agent-facing status update. The raw status string is parsed here so
    /// an unknown value surfaces as `IllegalTransition` rather than a
    /// deserialization failure; an edge the FSM refuses surfaces as
    /// `Conflict` from the store. Reporting the status a job already has is
    /// a no-op (at-least-once delivery).
    pub async fn update_status(
        &self,
        job_id: &str,
        status_raw: &str,
        error_message: Option<String>,
        result: Option<JobResult>,
    ) -> Result<Job, CoreError> {
        let to = JobStatus::parse(status_raw)
            .ok_or_else(|| CoreError::IllegalTransition(status_raw.to_string()))?;
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        if job.status == to {
            return Ok(job);
        }

        let now = Utc::now();
        let mut patch = JobPatch::default();
        if to == JobStatus::Running {
            patch.started_at = Some(now);
        }
        if to.is_terminal() {
            patch.completed_at = Patch::Set(now);
        }
        if let Some(msg) = error_message {
            patch.error_message = Patch::Set(msg);
        }
        if let Some(report) = result {
            patch.result = Some(report);
        }

        let updated = self.store.transition_job(job_id, to, patch).await?;

        let event = JobStatusEvent {
            job_id: job_id.to_string(),
            new_status: to,
            timestamp: now,
        };
        let payload = serde_json::to_value(&event)
            .map_err(|e| CoreError::Internal(format!("status event: {e}")))?;
        self.broker
            .publish(keys::CHANNEL_JOB_STATUS_UPDATED, &payload)
            .await?;

        if to == JobStatus::Running {
            self.note_group_running(&updated).await?;
        }
        if to.is_terminal() {
            self.maybe_finish_group(&updated).await?;
        }
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Group closure
    // -----------------------------------------------------------------------

    /// First member to report `running` promotes its assigned group.
    async fn note_group_running(&self, job: &Job) -> Result<(), CoreError> {
        let Some(group) = self.store.find_active_group(&job.coalesce_key()).await? else {
            return Ok(());
        };
        if group.status == GroupStatus::Assigned {
            self.store
                .update_group(
                    &group.id,
                    GroupPatch {
                        status: Some(GroupStatus::Running),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Close out the active group once its last member reached a terminal
    /// status: mark it completed, release the agent's capacity slot, and
    /// drop the coalescing key so the next submission coins a fresh group.
    async fn maybe_finish_group(&self, job: &Job) -> Result<(), CoreError> {
        let key = job.coalesce_key();
        let Some(group) = self.store.find_active_group(&key).await? else {
            return Ok(());
        };

        let waiting = self.waiting_members(&group).await?;
        if !waiting.is_empty() {
            return Ok(());
        }
        if let Some(agent_id) = &group.assigned_agent {
            let still_running = self
                .store
                .jobs_running_on_agent(agent_id)
                .await?
                .into_iter()
                .any(|j| j.coalesce_key() == key);
            if still_running {
                return Ok(());
            }
        }

        self.store
            .update_group(
                &group.id,
                GroupPatch {
                    status: Some(GroupStatus::Completed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(agent_id) = &group.assigned_agent {
            if let Some(agent) = self.store.get_agent(agent_id).await? {
                // The in-flight list may hold the group id (stamped at
                // dispatch) or member job ids (reported by heartbeats);
                // both are spent now.
                let members = self
                    .store
                    .list_jobs(Some(&group.org_id), None, 1000, 0)
                    .await?;
                let member_ids: std::collections::HashSet<&str> = members
                    .jobs
                    .iter()
                    .filter(|j| {
                        j.app_version_id == group.app_version_id && j.target == group.target
                    })
                    .map(|j| j.id.as_str())
                    .collect();
                let remaining: Vec<String> = agent
                    .current_jobs
                    .into_iter()
                    .filter(|id| id != &group.id && !member_ids.contains(id.as_str()))
                    .collect();
                self.store
                    .update_agent(
                        agent_id,
                        AgentPatch {
                            current_jobs: Some(remaining),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        self.broker.delete_value(&keys::group_key(&key)).await?;
        self.broker
            .hash_delete(keys::GROUPS_DESCRIPTORS, &group.id)
            .await?;
        info!(group = %group.id, "group completed");
        Ok(())
    }

    async fn waiting_members(&self, group: &Group) -> Result<Vec<Job>, CoreError> {
        let members = self
            .store
            .jobs_by_app_version(&group.app_version_id, group.target)
            .await?;
        Ok(members
            .into_iter()
            .filter(|j| j.org_id == group.org_id)
            .collect())
    }
}
