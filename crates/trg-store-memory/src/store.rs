//! In-memory `StateStore`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use trg_schemas::{Agent, AgentStatus, CoalesceKey, Group, GroupStatus, Job, JobStatus, TestTarget};
use trg_store::{AgentPatch, CoreError, GroupPatch, JobPage, JobPatch, StateStore};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, Job>,
    groups: BTreeMap<String, Group>,
    agents: BTreeMap<String, Agent>,
}

/// BTreeMap-backed store. The mutex is held only across synchronous map
/// operations, never across an await point.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stable listing order: `priority DESC, created_at ASC, id ASC`.
fn job_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

fn apply_job_patch(job: &mut Job, patch: &JobPatch) {
    patch.assigned_agent.apply(&mut job.assigned_agent);
    patch.error_message.apply(&mut job.error_message);
    if let Some(result) = &patch.result {
        job.result = Some(result.clone());
    }
    if let Some(rc) = patch.retry_count {
        job.retry_count = rc;
    }
    if let Some(ts) = patch.started_at {
        job.started_at = Some(ts);
    }
    patch.completed_at.apply(&mut job.completed_at);
    job.updated_at = Utc::now();
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_jobs(&self, jobs: &[Job]) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        for job in jobs {
            if inner.jobs.contains_key(&job.id) {
                return Err(CoreError::Conflict(format!("job {} already exists", job.id)));
            }
            inner.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn list_jobs(
        &self,
        org_id: Option<&str>,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<JobPage, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| org_id.map_or(true, |o| j.org_id == o))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(job_order);
        let total = jobs.len() as u64;
        let page = jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(JobPage { jobs: page, total })
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let page = self
            .list_jobs(None, Some(JobStatus::Pending), limit, 0)
            .await?;
        Ok(page.jobs)
    }

    async fn jobs_by_app_version(
        &self,
        app_version_id: &str,
        target: TestTarget,
    ) -> Result<Vec<Job>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.app_version_id == app_version_id && j.target == target)
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Queued))
            .cloned()
            .collect();
        jobs.sort_by(job_order);
        Ok(jobs)
    }

    async fn jobs_running_on_agent(&self, agent_id: &str) -> Result<Vec<Job>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.assigned_agent.as_deref() == Some(agent_id)
            })
            .cloned()
            .collect();
        jobs.sort_by(job_order);
        Ok(jobs)
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        // Oldest update first so long-waiting failures retry first.
        jobs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("job", id))?;
        apply_job_patch(job, &patch);
        Ok(job.clone())
    }

    async fn transition_job(
        &self,
        id: &str,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("job", id))?;
        if !job.status.can_transition_to(to) {
            return Err(CoreError::Conflict(format!(
                "job {id}: cannot transition {} -> {}",
                job.status.as_str(),
                to.as_str()
            )));
        }
        job.status = to;
        apply_job_patch(job, &patch);
        Ok(job.clone())
    }

    async fn create_group(&self, group: &Group) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        if inner.groups.contains_key(&group.id) {
            return Err(CoreError::Conflict(format!(
                "group {} already exists",
                group.id
            )));
        }
        inner.groups.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner.groups.get(id).cloned())
    }

    async fn update_group(&self, id: &str, patch: GroupPatch) -> Result<Group, CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        let group = inner
            .groups
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("group", id))?;
        if let Some(status) = patch.status {
            group.status = status;
        }
        patch.assigned_agent.apply(&mut group.assigned_agent);
        if let Some(ts) = patch.started_at {
            group.started_at = Some(ts);
        }
        if let Some(ts) = patch.completed_at {
            group.completed_at = Some(ts);
        }
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    async fn delete_group(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        inner.groups.remove(id);
        Ok(())
    }

    async fn find_active_group(&self, key: &CoalesceKey) -> Result<Option<Group>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner
            .groups
            .values()
            .find(|g| {
                g.org_id == key.org_id
                    && g.app_version_id == key.app_version_id
                    && g.target == key.target
                    && g.status != GroupStatus::Completed
            })
            .cloned())
    }

    async fn groups_by_status(&self, status: GroupStatus) -> Result<Vec<Group>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner
            .groups
            .values()
            .filter(|g| g.status == status)
            .cloned()
            .collect())
    }

    async fn register_agent(&self, agent: &Agent) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        let mut agent = agent.clone();
        // Re-registration keeps the original registration instant.
        if let Some(existing) = inner.agents.get(&agent.id) {
            agent.registered_at = existing.registered_at;
        }
        inner.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner.agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner.agents.values().cloned().collect())
    }

    async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<Agent, CoreError> {
        let mut inner = self.inner.lock().map_err(CoreError::upstream)?;
        let agent = inner
            .agents
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("agent", id))?;
        if let Some(status) = patch.status {
            agent.status = status;
        }
        if let Some(caps) = patch.capabilities {
            agent.capabilities = caps;
        }
        if let Some(max) = patch.max_concurrent_jobs {
            agent.max_concurrent_jobs = max;
        }
        if let Some(jobs) = patch.current_jobs {
            agent.current_jobs = jobs;
        }
        if let Some(hb) = patch.last_heartbeat {
            agent.last_heartbeat = hb;
        }
        Ok(agent.clone())
    }

    async fn available_agents(&self, target: Option<TestTarget>) -> Result<Vec<Agent>, CoreError> {
        let inner = self.inner.lock().map_err(CoreError::upstream)?;
        Ok(inner
            .agents
            .values()
            .filter(|a| {
                matches!(a.status, AgentStatus::Online | AgentStatus::Busy)
                    && a.has_capacity()
                    && target.map_or(true, |t| a.serves_target(t))
            })
            .cloned()
            .collect())
    }

    async fn healthcheck(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
