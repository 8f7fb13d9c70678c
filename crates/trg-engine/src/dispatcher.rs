//! The group dispatcher (periodic).
//!
//! Each tick pops the highest-scored group, walks eligible agents in
//! `(load ASC, id ASC)` order, and assigns the group to the first agent it
//! can lock. The per-agent broker lock serializes the mutation path across
//! dispatcher replicas; the lock is TTL-bounded so a crashed holder cannot
//! wedge an agent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use trg_config::CoreConfig;
use trg_schemas::{Group, GroupDescriptor, GroupStatus, JobStatus, WorkItem};
use trg_store::{keys, AgentPatch, CoreError, GroupPatch, JobPatch, Patch, QueueBroker, StateStore};

use crate::priority::priority_score;
use crate::scheduler::enqueue_descriptor;

/// Score decrement applied when a pop finds no placeable agent, so the
/// descriptor yields to equal-priority peers the dispatcher has not tried.
const REQUEUE_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queue was empty.
    Idle,
    /// Popped a descriptor for a vanished or already-closed group.
    Dropped { group_id: String },
    /// No eligible agent could take the group; descriptor re-enqueued.
    NoCandidate { group_id: String },
    Assigned { group_id: String, agent_id: String },
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn QueueBroker>,
    cfg: CoreConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn QueueBroker>,
        cfg: CoreConfig,
    ) -> Self {
        Self { store, broker, cfg }
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        crate::loops::spawn_periodic("dispatcher", interval, move || {
            let this = Arc::clone(&self);
            async move { this.tick().await.map(|_| ()) }
        })
    }

    pub async fn tick(&self) -> Result<DispatchOutcome, CoreError> {
        let Some(group_id) = self.broker.priority_pop_max(keys::GROUPS_SCHEDULING).await? else {
            return Ok(DispatchOutcome::Idle);
        };

        let Some(group) = self.store.get_group(&group_id).await? else {
            self.discard_descriptor(&group_id).await?;
            warn!(group = %group_id, "dropped descriptor for missing group");
            return Ok(DispatchOutcome::Dropped { group_id });
        };
        if group.status != GroupStatus::Pending {
            // Already assigned by a peer, or closed out since scheduling.
            self.discard_descriptor(&group_id).await?;
            debug!(group = %group_id, status = group.status.as_str(), "dropped stale descriptor");
            return Ok(DispatchOutcome::Dropped { group_id });
        }

        let mut candidates = self.store.available_agents(Some(group.target)).await?;
        candidates.retain(|a| a.is_dispatch_eligible(group.target));
        candidates.sort_by(|a, b| {
            a.current_jobs
                .len()
                .cmp(&b.current_jobs.len())
                .then(a.id.cmp(&b.id))
        });

        for candidate in &candidates {
            let lock_key = keys::agent_lock_key(&candidate.id);
            if !self
                .broker
                .set_nx_ttl(&lock_key, &group.id, self.cfg.lock_ttl)
                .await?
            {
                // Another dispatcher holds this agent; try the next one.
                continue;
            }
            let assigned = self.assign(&group, &candidate.id).await;
            self.broker.delete_value(&lock_key).await?;
            match assigned {
                Ok(true) => {
                    self.broker
                        .hash_delete(keys::GROUPS_DESCRIPTORS, &group.id)
                        .await?;
                    info!(group = %group.id, agent = %candidate.id, "group assigned");
                    return Ok(DispatchOutcome::Assigned {
                        group_id: group.id.clone(),
                        agent_id: candidate.id.clone(),
                    });
                }
                // Stale candidate snapshot (filled up or went away under
                // the lock); keep walking.
                Ok(false) => continue,
                Err(err) => return Err(err),
            }
        }

        self.requeue(&group).await?;
        debug!(group = %group.id, target = group.target.as_str(), "no placeable agent");
        Ok(DispatchOutcome::NoCandidate { group_id })
    }

    /// Mutation path, entered only under the agent lock. Re-reads the agent
    /// so capacity reflects writes that beat us to the lock; answers
    /// `Ok(false)` when this candidate is no longer placeable.
    async fn assign(&self, group: &Group, agent_id: &str) -> Result<bool, CoreError> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(false);
        };
        if !agent.is_dispatch_eligible(group.target) {
            return Ok(false);
        }

        let now = Utc::now();

        let mut current_jobs = agent.current_jobs.clone();
        current_jobs.push(group.id.clone());
        self.store
            .update_agent(
                agent_id,
                AgentPatch {
                    current_jobs: Some(current_jobs),
                    ..Default::default()
                },
            )
            .await?;

        self.store
            .update_group(
                &group.id,
                GroupPatch {
                    status: Some(GroupStatus::Assigned),
                    assigned_agent: Patch::Set(agent_id.to_string()),
                    started_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        // Stamp the assignment on every queued member job.
        let members = self
            .store
            .jobs_by_app_version(&group.app_version_id, group.target)
            .await?;
        for job in members
            .iter()
            .filter(|j| j.org_id == group.org_id && j.status == JobStatus::Queued)
        {
            self.store
                .update_job(
                    &job.id,
                    JobPatch {
                        assigned_agent: Patch::Set(agent_id.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let item = WorkItem::job_group(group.id.clone(), now);
        let payload = serde_json::to_value(&item)
            .map_err(|e| CoreError::Internal(format!("work item serialization: {e}")))?;
        self.broker
            .push_work(&keys::agent_work_queue(agent_id), &payload)
            .await?;
        Ok(true)
    }

    /// Put the group back with a slightly lower score. The stored
    /// descriptor is reused when present; otherwise it is recomputed from
    /// the group's queued members.
    async fn requeue(&self, group: &Group) -> Result<(), CoreError> {
        let mut descriptor = match self.stored_descriptor(&group.id).await? {
            Some(d) => d,
            None => self.synthesize_descriptor(group).await?,
        };
        descriptor.priority_score -= REQUEUE_EPSILON;
        enqueue_descriptor(self.broker.as_ref(), &descriptor).await
    }

    async fn stored_descriptor(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupDescriptor>, CoreError> {
        let Some(raw) = self
            .broker
            .hash_get(keys::GROUPS_DESCRIPTORS, group_id)
            .await?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(d) => Ok(Some(d)),
            Err(err) => {
                warn!(group = %group_id, %err, "discarding unreadable descriptor");
                Ok(None)
            }
        }
    }

    async fn synthesize_descriptor(&self, group: &Group) -> Result<GroupDescriptor, CoreError> {
        let now = Utc::now();
        let members: Vec<_> = self
            .store
            .jobs_by_app_version(&group.app_version_id, group.target)
            .await?
            .into_iter()
            .filter(|j| j.org_id == group.org_id)
            .collect();
        let avg = if members.is_empty() {
            1.0
        } else {
            members.iter().map(|j| j.priority as f64).sum::<f64>() / members.len() as f64
        };
        let oldest = members.iter().map(|j| j.created_at).min().unwrap_or(now);
        Ok(GroupDescriptor {
            group_id: group.id.clone(),
            app_version_id: group.app_version_id.clone(),
            target: group.target,
            job_count: members.len(),
            priority_score: priority_score(avg, oldest, now),
            created_at: oldest,
        })
    }

    async fn discard_descriptor(&self, group_id: &str) -> Result<(), CoreError> {
        self.broker
            .hash_delete(keys::GROUPS_DESCRIPTORS, group_id)
            .await
    }
}
