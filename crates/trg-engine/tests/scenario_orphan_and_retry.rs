//! Orphan detection and the retry monitor: a heartbeat that stops reporting
//! a running job fails it with a stable message; the retry monitor promotes
//! aged-out failures back to `pending` until the retry ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use trg_config::{Backend, CoreConfig};
use trg_engine::{DispatchOutcome, Dispatcher, Lifecycle, Scheduler, ORPHAN_ERROR_MESSAGE};
use trg_schemas::{AgentStatus, Capability, Job, JobSpec, JobStatus, TestTarget};
use trg_store::{QueueBroker, StateStore};
use trg_store_memory::{MemoryBroker, MemoryStore};

struct Harness {
    store: Arc<dyn StateStore>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    lifecycle: Lifecycle,
}

fn harness_with(tune: impl FnOnce(&mut CoreConfig)) -> Harness {
    let mut cfg = CoreConfig::defaults();
    cfg.backend = Backend::Memory;
    cfg.retry_delay = Duration::from_secs(0);
    tune(&mut cfg);
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    Harness {
        scheduler: Scheduler::new(Arc::clone(&store), Arc::clone(&broker), cfg.clone()),
        dispatcher: Dispatcher::new(Arc::clone(&store), Arc::clone(&broker), cfg.clone()),
        lifecycle: Lifecycle::new(Arc::clone(&store), Arc::clone(&broker), cfg),
        store,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

async fn submit(store: &dyn StateStore, app: &str, priority: u8) -> Job {
    let job = Job::from_spec(
        JobSpec {
            org_id: "o1".to_string(),
            app_version_id: app.to_string(),
            test_path: "tests/smoke".to_string(),
            target: TestTarget::Emulator,
            priority,
            metadata: None,
        },
        Utc::now(),
    );
    store.create_jobs(std::slice::from_ref(&job)).await.unwrap();
    job
}

/// Submit → group → dispatch → report running; returns the job id.
async fn running_job_on(h: &Harness, agent_id: &str) -> String {
    h.lifecycle
        .register_agent(
            agent_id,
            None,
            vec![Capability {
                target: TestTarget::Emulator,
                platform: None,
                os_version: None,
                device_name: None,
            }],
            Some(3),
        )
        .await
        .unwrap();
    h.lifecycle
        .heartbeat(agent_id, AgentStatus::Online, Some(vec![]))
        .await
        .unwrap();

    let job = submit(h.store.as_ref(), "v1.0", 5).await;
    h.scheduler.tick().await.unwrap();
    let outcome = h.dispatcher.tick().await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Assigned { .. }));

    h.lifecycle
        .update_status(&job.id, "running", None, None)
        .await
        .unwrap();
    job.id
}

#[tokio::test]
async fn heartbeat_without_the_job_orphans_it() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    // Agent comes back reporting nothing in flight.
    h.lifecycle
        .heartbeat("a1", AgentStatus::Online, Some(vec![]))
        .await
        .unwrap();

    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(ORPHAN_ERROR_MESSAGE));
    assert!(job.completed_at.is_some());

    // Retry (delay 0): back to pending with the counter bumped and the
    // failure fields cleared.
    let retried = h.lifecycle.retry_tick().await.unwrap();
    assert_eq!(retried, 1);
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.error_message.is_none());
    assert!(job.completed_at.is_none());
}

#[tokio::test]
async fn identical_heartbeats_do_not_sweep_twice() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    h.lifecycle
        .heartbeat("a1", AgentStatus::Online, Some(vec![]))
        .await
        .unwrap();
    let first = h.store.get_job(&job_id).await.unwrap().unwrap();

    // Same heartbeat again: the job is already failed, nothing changes.
    h.lifecycle
        .heartbeat("a1", AgentStatus::Online, Some(vec![]))
        .await
        .unwrap();
    let second = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Failed);
    assert_eq!(second.updated_at, first.updated_at);
}

#[tokio::test]
async fn heartbeat_reporting_the_job_keeps_it_running() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    h.lifecycle
        .heartbeat("a1", AgentStatus::Busy, Some(vec![job_id.clone()]))
        .await
        .unwrap();

    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
}

#[tokio::test]
async fn retry_waits_for_the_configured_delay() {
    let h = harness_with(|cfg| cfg.retry_delay = Duration::from_secs(3600));
    let job_id = running_job_on(&h, "a1").await;
    h.lifecycle
        .heartbeat("a1", AgentStatus::Online, Some(vec![]))
        .await
        .unwrap();

    // Failure is seconds old, delay is an hour: not promoted yet.
    assert_eq!(h.lifecycle.retry_tick().await.unwrap(), 0);
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn retry_stops_at_the_ceiling() {
    let h = harness();

    // Walk one job through fail → retry cycles without agents in the way.
    let job = submit(h.store.as_ref(), "v9", 5).await;
    for round in 0..3u32 {
        let j = h.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.retry_count, round);
        h.store
            .transition_job(&job.id, JobStatus::Queued, Default::default())
            .await
            .unwrap();
        h.store
            .transition_job(&job.id, JobStatus::Running, Default::default())
            .await
            .unwrap();
        h.store
            .transition_job(&job.id, JobStatus::Failed, Default::default())
            .await
            .unwrap();
        assert_eq!(h.lifecycle.retry_tick().await.unwrap(), 1);
    }

    // Fourth failure: retry_count == MAX_RETRIES, stays failed for good.
    h.store
        .transition_job(&job.id, JobStatus::Queued, Default::default())
        .await
        .unwrap();
    h.store
        .transition_job(&job.id, JobStatus::Running, Default::default())
        .await
        .unwrap();
    h.store
        .transition_job(&job.id, JobStatus::Failed, Default::default())
        .await
        .unwrap();
    assert_eq!(h.lifecycle.retry_tick().await.unwrap(), 0);
    let j = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(j.status, JobStatus::Failed);
    assert_eq!(j.retry_count, 3);
}

#[tokio::test]
async fn silent_agent_goes_offline_and_loses_its_jobs() {
    let h = harness_with(|cfg| cfg.heartbeat_timeout = Duration::from_secs(0));
    let job_id = running_job_on(&h, "a1").await;

    // Horizon zero: any agent whose heartbeat is in the past is stale.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let swept = h.lifecycle.sweep_stale_agents().await.unwrap();
    assert_eq!(swept, 1);

    let agent = h.store.get_agent("a1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Offline);
    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(ORPHAN_ERROR_MESSAGE));
}
