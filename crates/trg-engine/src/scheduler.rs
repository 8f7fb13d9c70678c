//! The grouping scheduler (periodic).
//!
//! Each tick drains a batch of pending jobs, coalesces them into groups by
//! `(org_id, app_version_id, target)`, moves them to `queued`, and scores
//! pending groups into the dispatch queue. Group identity is coordinated
//! across replicas through a TTL'd set-if-absent key in the broker; the
//! store remains authoritative, so `rebuild()` can repopulate the queue
//! from scratch after broker loss.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use trg_config::CoreConfig;
use trg_schemas::{CoalesceKey, Group, GroupDescriptor, GroupStatus, Job, JobStatus};
use trg_store::{keys, CoreError, JobPatch, QueueBroker, StateStore};

use crate::priority::priority_score;

/// Max pending jobs considered per tick.
const SCHEDULE_BATCH: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scanned: usize,
    pub groups_touched: usize,
    pub groups_created: usize,
    pub jobs_queued: usize,
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn QueueBroker>,
    cfg: CoreConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn QueueBroker>,
        cfg: CoreConfig,
    ) -> Self {
        Self { store, broker, cfg }
    }

    /// Spawn the periodic loop; tick errors are logged and swallowed.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        crate::loops::spawn_periodic("scheduler", interval, move || {
            let this = Arc::clone(&self);
            async move { this.tick().await.map(|_| ()) }
        })
    }

    pub async fn tick(&self) -> Result<SchedulerStats, CoreError> {
        let pending = self.store.pending_jobs(SCHEDULE_BATCH).await?;
        let mut stats = SchedulerStats {
            scanned: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(stats);
        }

        for (key, jobs) in partition_by_key(pending) {
            let (group, created) = self.resolve_group(&key).await?;
            stats.groups_touched += 1;
            if created {
                stats.groups_created += 1;
            }

            for job in &jobs {
                match self
                    .store
                    .transition_job(&job.id, JobStatus::Queued, JobPatch::default())
                    .await
                {
                    Ok(_) => stats.jobs_queued += 1,
                    // The job moved under us (e.g. cancelled between the
                    // batch read and this write). Leave it alone.
                    Err(CoreError::Conflict(msg)) => {
                        debug!(job = %job.id, %msg, "skipping job during grouping")
                    }
                    Err(err) => return Err(err),
                }
            }

            // A pending group gets (re-)scored into the dispatch queue. The
            // queue member is the group id, so re-adding is an idempotent
            // score refresh, never a duplicate entry.
            if group.status == GroupStatus::Pending {
                let descriptor = descriptor_for(&group, &jobs);
                enqueue_descriptor(self.broker.as_ref(), &descriptor).await?;
                debug!(
                    group = %group.id,
                    jobs = descriptor.job_count,
                    score = descriptor.priority_score,
                    "group scheduled"
                );
            }
        }

        if stats.jobs_queued > 0 {
            info!(
                scanned = stats.scanned,
                queued = stats.jobs_queued,
                groups = stats.groups_touched,
                "scheduler tick"
            );
        }
        Ok(stats)
    }

    /// Re-enqueue every pending group from the store. Called at daemon
    /// startup: the broker is not durable, the store is.
    pub async fn rebuild(&self) -> Result<usize, CoreError> {
        let groups = self.store.groups_by_status(GroupStatus::Pending).await?;
        let mut restored = 0;
        for group in groups {
            let members: Vec<Job> = self
                .member_jobs(&group)
                .await?
                .into_iter()
                .filter(|j| j.status == JobStatus::Queued)
                .collect();
            if members.is_empty() {
                continue;
            }
            let descriptor = descriptor_for(&group, &members);
            enqueue_descriptor(self.broker.as_ref(), &descriptor).await?;
            let _ = self
                .broker
                .set_nx_ttl(
                    &keys::group_key(&group_key_of(&group)),
                    &group.id,
                    self.cfg.group_key_ttl,
                )
                .await?;
            restored += 1;
        }
        if restored > 0 {
            info!(groups = restored, "rebuilt scheduling queue from store");
        }
        Ok(restored)
    }

    async fn member_jobs(&self, group: &Group) -> Result<Vec<Job>, CoreError> {
        let jobs = self
            .store
            .jobs_by_app_version(&group.app_version_id, group.target)
            .await?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.org_id == group.org_id)
            .collect())
    }

    /// Find or coin the active group for a coalescing key. Creation is
    /// serialized across replicas by the set-if-absent TTL key; the loser
    /// of a race discards its fresh row and adopts the winner.
    async fn resolve_group(&self, key: &CoalesceKey) -> Result<(Group, bool), CoreError> {
        let broker_key = keys::group_key(key);

        if let Some(id) = self.broker.get_value(&broker_key).await? {
            match self.store.get_group(&id).await? {
                Some(group) if group.status != GroupStatus::Completed => {
                    return Ok((group, false));
                }
                // Stale mapping: group gone or already closed out.
                _ => self.broker.delete_value(&broker_key).await?,
            }
        }

        // The broker may have lost the key while the group row survived.
        if let Some(group) = self.store.find_active_group(key).await? {
            let _ = self
                .broker
                .set_nx_ttl(&broker_key, &group.id, self.cfg.group_key_ttl)
                .await?;
            return Ok((group, false));
        }

        let group = Group::new(key.clone(), Utc::now());
        self.store.create_group(&group).await?;
        if self
            .broker
            .set_nx_ttl(&broker_key, &group.id, self.cfg.group_key_ttl)
            .await?
        {
            return Ok((group, true));
        }

        // Lost the coining race to a peer replica.
        self.store.delete_group(&group.id).await?;
        let winner_id = self.broker.get_value(&broker_key).await?.ok_or_else(|| {
            CoreError::Internal(format!("group key {broker_key} vanished during coining race"))
        })?;
        let winner = self
            .store
            .get_group(&winner_id)
            .await?
            .ok_or_else(|| CoreError::not_found("group", &winner_id))?;
        warn!(key = %broker_key, winner = %winner.id, "lost group coining race");
        Ok((winner, false))
    }
}

fn group_key_of(group: &Group) -> CoalesceKey {
    CoalesceKey {
        org_id: group.org_id.clone(),
        app_version_id: group.app_version_id.clone(),
        target: group.target,
    }
}

/// Stable partition of a batch by coalescing key, preserving the batch's
/// priority ordering inside each partition.
fn partition_by_key(jobs: Vec<Job>) -> Vec<(CoalesceKey, Vec<Job>)> {
    let mut order: Vec<CoalesceKey> = Vec::new();
    let mut buckets: std::collections::HashMap<CoalesceKey, Vec<Job>> =
        std::collections::HashMap::new();
    for job in jobs {
        let key = job.coalesce_key();
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(job);
    }
    order
        .into_iter()
        .map(|k| {
            let jobs = buckets.remove(&k).unwrap_or_default();
            (k, jobs)
        })
        .collect()
}

fn descriptor_for(group: &Group, jobs: &[Job]) -> GroupDescriptor {
    let now = Utc::now();
    let avg = if jobs.is_empty() {
        1.0
    } else {
        jobs.iter().map(|j| j.priority as f64).sum::<f64>() / jobs.len() as f64
    };
    let oldest = jobs.iter().map(|j| j.created_at).min().unwrap_or(now);
    GroupDescriptor {
        group_id: group.id.clone(),
        app_version_id: group.app_version_id.clone(),
        target: group.target,
        job_count: jobs.len(),
        priority_score: priority_score(avg, oldest, now),
        created_at: oldest,
    }
}

/// Write the descriptor payload to the hash and score its id into the
/// priority queue.
pub(crate) async fn enqueue_descriptor(
    broker: &dyn QueueBroker,
    descriptor: &GroupDescriptor,
) -> Result<(), CoreError> {
    let payload = serde_json::to_string(descriptor)
        .map_err(|e| CoreError::Internal(format!("descriptor serialization: {e}")))?;
    broker
        .hash_set(keys::GROUPS_DESCRIPTORS, &descriptor.group_id, &payload)
        .await?;
    broker
        .priority_add(
            keys::GROUPS_SCHEDULING,
            &descriptor.group_id,
            descriptor.priority_score,
        )
        .await?;
    Ok(())
}
