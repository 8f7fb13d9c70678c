//! PostgreSQL state store.
//!
//! Plain `sqlx::query` with runtime binds throughout; no compile-time
//! checked macros, so the crate builds without a live database. Status
//! transitions are a single conditional UPDATE — the CAS predicate that
//! keeps terminal states absorbing even when writers race.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use trg_schemas::{
    Agent, AgentStatus, Capability, CoalesceKey, Group, GroupStatus, Job, JobStatus, TestTarget,
};
use trg_store::{AgentPatch, CoreError, GroupPatch, JobPage, JobPatch, Patch, StateStore};

pub const ENV_DB_URL: &str = "TRG_DATABASE_URL";

/// Connect to Postgres using TRG_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn upstream(err: sqlx::Error) -> CoreError {
    CoreError::upstream(err)
}

fn parse_target(raw: &str) -> Result<TestTarget, CoreError> {
    TestTarget::parse(raw)
        .ok_or_else(|| CoreError::Internal(format!("stored target is invalid: {raw}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, CoreError> {
    let target: String = row.try_get("target").map_err(upstream)?;
    let status: String = row.try_get("status").map_err(upstream)?;
    let result: Option<Value> = row.try_get("result").map_err(upstream)?;
    let result = match result {
        None => None,
        Some(v) => Some(
            serde_json::from_value(v)
                .map_err(|e| CoreError::Internal(format!("stored result is invalid: {e}")))?,
        ),
    };
    Ok(Job {
        id: row.try_get("id").map_err(upstream)?,
        org_id: row.try_get("org_id").map_err(upstream)?,
        app_version_id: row.try_get("app_version_id").map_err(upstream)?,
        test_path: row.try_get("test_path").map_err(upstream)?,
        target: parse_target(&target)?,
        priority: row.try_get::<i32, _>("priority").map_err(upstream)? as u8,
        status: JobStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("stored status is invalid: {status}")))?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(upstream)? as u32,
        assigned_agent: row.try_get("assigned_agent").map_err(upstream)?,
        error_message: row.try_get("error_message").map_err(upstream)?,
        result,
        metadata: row.try_get("metadata").map_err(upstream)?,
        created_at: row.try_get("created_at").map_err(upstream)?,
        updated_at: row.try_get("updated_at").map_err(upstream)?,
        started_at: row.try_get("started_at").map_err(upstream)?,
        completed_at: row.try_get("completed_at").map_err(upstream)?,
    })
}

fn group_from_row(row: &PgRow) -> Result<Group, CoreError> {
    let target: String = row.try_get("target").map_err(upstream)?;
    let status: String = row.try_get("status").map_err(upstream)?;
    Ok(Group {
        id: row.try_get("id").map_err(upstream)?,
        org_id: row.try_get("org_id").map_err(upstream)?,
        app_version_id: row.try_get("app_version_id").map_err(upstream)?,
        target: parse_target(&target)?,
        status: GroupStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("stored status is invalid: {status}")))?,
        assigned_agent: row.try_get("assigned_agent").map_err(upstream)?,
        created_at: row.try_get("created_at").map_err(upstream)?,
        updated_at: row.try_get("updated_at").map_err(upstream)?,
        started_at: row.try_get("started_at").map_err(upstream)?,
        completed_at: row.try_get("completed_at").map_err(upstream)?,
    })
}

fn agent_from_row(row: &PgRow) -> Result<Agent, CoreError> {
    let status: String = row.try_get("status").map_err(upstream)?;
    let capabilities: Value = row.try_get("capabilities").map_err(upstream)?;
    let capabilities: Vec<Capability> = serde_json::from_value(capabilities)
        .map_err(|e| CoreError::Internal(format!("stored capabilities are invalid: {e}")))?;
    let current_jobs: Value = row.try_get("current_jobs").map_err(upstream)?;
    let current_jobs: Vec<String> = serde_json::from_value(current_jobs)
        .map_err(|e| CoreError::Internal(format!("stored current_jobs is invalid: {e}")))?;
    Ok(Agent {
        id: row.try_get("id").map_err(upstream)?,
        name: row.try_get("name").map_err(upstream)?,
        capabilities,
        status: AgentStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("stored status is invalid: {status}")))?,
        max_concurrent_jobs: row
            .try_get::<i32, _>("max_concurrent_jobs")
            .map_err(upstream)? as u32,
        current_jobs,
        last_heartbeat: row.try_get("last_heartbeat").map_err(upstream)?,
        registered_at: row.try_get("registered_at").map_err(upstream)?,
    })
}

/// Decompose a tri-state patch field into (apply, value) binds for a
/// `case when $n then $m else <column> end` slot.
fn tri<T: Clone>(patch: &Patch<T>) -> (bool, Option<T>) {
    match patch {
        Patch::Keep => (false, None),
        Patch::Set(v) => (true, Some(v.clone())),
        Patch::Clear => (true, None),
    }
}

const JOB_COLUMNS: &str = "id, org_id, app_version_id, test_path, target, priority, status, \
     retry_count, assigned_agent, error_message, result, metadata, \
     created_at, updated_at, started_at, completed_at";

const GROUP_COLUMNS: &str =
    "id, org_id, app_version_id, target, status, assigned_agent, \
     created_at, updated_at, started_at, completed_at";

const AGENT_COLUMNS: &str = "id, name, capabilities, status, max_concurrent_jobs, current_jobs, \
     last_heartbeat, registered_at";

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Shared UPDATE for `update_job` / `transition_job`. When `to` is set
    /// the write is guarded by the FSM edge table: the row is touched only
    /// if its current status is one that admits the transition.
    async fn write_job(
        &self,
        id: &str,
        to: Option<JobStatus>,
        patch: &JobPatch,
    ) -> Result<Option<Job>, CoreError> {
        let admissible: Vec<String> = match to {
            None => Vec::new(),
            Some(to) => [
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ]
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.as_str().to_string())
            .collect(),
        };

        let (agent_apply, agent_val) = tri(&patch.assigned_agent);
        let (err_apply, err_val) = tri(&patch.error_message);
        let (done_apply, done_val) = tri(&patch.completed_at);
        let result_val = match &patch.result {
            None => None,
            Some(r) => Some(
                serde_json::to_value(r)
                    .map_err(|e| CoreError::Internal(format!("result serialization: {e}")))?,
            ),
        };

        let sql = format!(
            r#"
            update jobs set
                updated_at     = now(),
                status         = coalesce($2, status),
                assigned_agent = case when $4  then $5  else assigned_agent end,
                error_message  = case when $6  then $7  else error_message end,
                result         = case when $8  then $9  else result end,
                retry_count    = case when $10 then $11 else retry_count end,
                started_at     = case when $12 then $13 else started_at end,
                completed_at   = case when $14 then $15 else completed_at end
            where id = $1
              and ($2 is null or status = any($3))
            returning {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(to.map(|s| s.as_str()))
            .bind(&admissible)
            .bind(agent_apply)
            .bind(agent_val)
            .bind(err_apply)
            .bind(err_val)
            .bind(result_val.is_some())
            .bind(result_val)
            .bind(patch.retry_count.is_some())
            .bind(patch.retry_count.map(|n| n as i32))
            .bind(patch.started_at.is_some())
            .bind(patch.started_at)
            .bind(done_apply)
            .bind(done_val)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;

        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn create_jobs(&self, jobs: &[Job]) -> Result<(), CoreError> {
        for job in jobs {
            sqlx::query(
                r#"
                insert into jobs (
                    id, org_id, app_version_id, test_path, target, priority, status,
                    retry_count, assigned_agent, error_message, result, metadata,
                    created_at, updated_at, started_at, completed_at
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(&job.id)
            .bind(&job.org_id)
            .bind(&job.app_version_id)
            .bind(&job.test_path)
            .bind(job.target.as_str())
            .bind(job.priority as i32)
            .bind(job.status.as_str())
            .bind(job.retry_count as i32)
            .bind(&job.assigned_agent)
            .bind(&job.error_message)
            .bind(
                job.result
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()
                    .map_err(|e| CoreError::Internal(format!("result serialization: {e}")))?,
            )
            .bind(&job.metadata)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&self.pool)
            .await
            .map_err(upstream)?;
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, CoreError> {
        let sql = format!("select {JOB_COLUMNS} from jobs where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        org_id: Option<&str>,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<JobPage, CoreError> {
        let status = status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(
            r#"
            select count(*) from jobs
            where ($1::text is null or org_id = $1)
              and ($2::text is null or status = $2)
            "#,
        )
        .bind(org_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(upstream)?;

        let sql = format!(
            r#"
            select {JOB_COLUMNS} from jobs
            where ($1::text is null or org_id = $1)
              and ($2::text is null or status = $2)
            order by priority desc, created_at asc, id asc
            limit $3 offset $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(org_id)
            .bind(status)
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;

        let jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage {
            jobs,
            total: total as u64,
        })
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
        let sql = format!(
            r#"
            select {JOB_COLUMNS} from jobs
            where app_version_id = $1
              and target = $2
              and status in ('pending', 'queued')
            order by priority desc, created_at asc, id asc
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(app_version_id)
            .bind(target.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_running_on_agent(&self, agent_id: &str) -> Result<Vec<Job>, CoreError> {
        let sql = format!(
            r#"
            select {JOB_COLUMNS} from jobs
            where status = 'running' and assigned_agent = $1
            order by priority desc, created_at asc, id asc
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let sql = format!(
            r#"
            select {JOB_COLUMNS} from jobs
            where status = 'failed'
            order by updated_at asc, id asc
            limit $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, CoreError> {
        self.write_job(id, None, &patch)
            .await?
            .ok_or_else(|| CoreError::not_found("job", id))
    }

    async fn transition_job(
        &self,
        id: &str,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, CoreError> {
        match self.write_job(id, Some(to), &patch).await? {
            Some(job) => Ok(job),
            // Zero rows: either the job is missing or the CAS predicate
            // refused the edge. Re-read to report which.
            None => match self.get_job(id).await? {
                None => Err(CoreError::not_found("job", id)),
                Some(job) => Err(CoreError::Conflict(format!(
                    "job {id}: cannot transition {} -> {}",
                    job.status.as_str(),
                    to.as_str()
                ))),
            },
        }
    }

    async fn create_group(&self, group: &Group) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            insert into job_groups (
                id, org_id, app_version_id, target, status, assigned_agent,
                created_at, updated_at, started_at, completed_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&group.id)
        .bind(&group.org_id)
        .bind(&group.app_version_id)
        .bind(group.target.as_str())
        .bind(group.status.as_str())
        .bind(&group.assigned_agent)
        .bind(group.created_at)
        .bind(group.updated_at)
        .bind(group.started_at)
        .bind(group.completed_at)
        .execute(&self.pool)
        .await
        .map_err(upstream)?;
        Ok(())
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>, CoreError> {
        let sql = format!("select {GROUP_COLUMNS} from job_groups where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn update_group(&self, id: &str, patch: GroupPatch) -> Result<Group, CoreError> {
        let (agent_apply, agent_val) = tri(&patch.assigned_agent);
        let sql = format!(
            r#"
            update job_groups set
                updated_at     = now(),
                status         = coalesce($2, status),
                assigned_agent = case when $3 then $4 else assigned_agent end,
                started_at     = coalesce($5, started_at),
                completed_at   = coalesce($6, completed_at)
            where id = $1
            returning {GROUP_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(agent_apply)
            .bind(agent_val)
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref()
            .map(group_from_row)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("group", id))
    }

    async fn delete_group(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("delete from job_groups where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(upstream)?;
        Ok(())
    }

    async fn find_active_group(&self, key: &CoalesceKey) -> Result<Option<Group>, CoreError> {
        let sql = format!(
            r#"
            select {GROUP_COLUMNS} from job_groups
            where org_id = $1 and app_version_id = $2 and target = $3
              and status != 'completed'
            order by created_at asc
            limit 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&key.org_id)
            .bind(&key.app_version_id)
            .bind(key.target.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn groups_by_status(&self, status: GroupStatus) -> Result<Vec<Group>, CoreError> {
        let sql = format!(
            "select {GROUP_COLUMNS} from job_groups where status = $1 order by created_at asc"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(group_from_row).collect()
    }

    async fn register_agent(&self, agent: &Agent) -> Result<(), CoreError> {
        let capabilities = serde_json::to_value(&agent.capabilities)
            .map_err(|e| CoreError::Internal(format!("capabilities serialization: {e}")))?;
        let current_jobs = serde_json::to_value(&agent.current_jobs)
            .map_err(|e| CoreError::Internal(format!("current_jobs serialization: {e}")))?;
        sqlx::query(
            r#"
            insert into agents (
                id, name, capabilities, status, max_concurrent_jobs, current_jobs,
                last_heartbeat, registered_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (id) do update set
                name                = excluded.name,
                capabilities        = excluded.capabilities,
                status              = excluded.status,
                max_concurrent_jobs = excluded.max_concurrent_jobs,
                current_jobs        = excluded.current_jobs,
                last_heartbeat      = excluded.last_heartbeat
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(capabilities)
        .bind(agent.status.as_str())
        .bind(agent.max_concurrent_jobs as i32)
        .bind(current_jobs)
        .bind(agent.last_heartbeat)
        .bind(agent.registered_at)
        .execute(&self.pool)
        .await
        .map_err(upstream)?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, CoreError> {
        let sql = format!("select {AGENT_COLUMNS} from agents where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, CoreError> {
        let sql = format!("select {AGENT_COLUMNS} from agents order by id asc");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn update_agent(&self, id: &str, patch: AgentPatch) -> Result<Agent, CoreError> {
        let capabilities = patch
            .capabilities
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::Internal(format!("capabilities serialization: {e}")))?;
        let current_jobs = patch
            .current_jobs
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::Internal(format!("current_jobs serialization: {e}")))?;
        let sql = format!(
            r#"
            update agents set
                status              = coalesce($2, status),
                capabilities        = coalesce($3, capabilities),
                max_concurrent_jobs = coalesce($4, max_concurrent_jobs),
                current_jobs        = coalesce($5, current_jobs),
                last_heartbeat      = coalesce($6, last_heartbeat)
            where id = $1
            returning {AGENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(capabilities)
            .bind(patch.max_concurrent_jobs.map(|n| n as i32))
            .bind(current_jobs)
            .bind(patch.last_heartbeat)
            .fetch_optional(&self.pool)
            .await
            .map_err(upstream)?;
        row.as_ref()
            .map(agent_from_row)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("agent", id))
    }

    async fn available_agents(&self, target: Option<TestTarget>) -> Result<Vec<Agent>, CoreError> {
        let sql = format!(
            r#"
            select {AGENT_COLUMNS} from agents
            where status in ('online', 'busy')
              and jsonb_array_length(current_jobs) < max_concurrent_jobs
              and ($1::text is null or exists (
                  select 1 from jsonb_array_elements(capabilities) cap
                  where cap->>'target' = $1
              ))
            order by id asc
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(target.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(upstream)?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn healthcheck(&self) -> Result<(), CoreError> {
        let (one,): (i32,) = sqlx::query_as("select 1")
            .fetch_one(&self.pool)
            .await
            .map_err(upstream)?;
        if one != 1 {
            return Err(CoreError::Upstream("connectivity probe failed".to_string()));
        }
        Ok(())
    }
}
