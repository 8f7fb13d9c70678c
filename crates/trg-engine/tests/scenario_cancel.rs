//! Cancellation: immediate on the server, asynchronous to the agent over
//! its cancel channel, and strictly once per job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use trg_config::{Backend, CoreConfig};
use trg_engine::{DispatchOutcome, Dispatcher, Lifecycle, Scheduler};
use trg_schemas::{AgentStatus, Capability, Job, JobSpec, JobStatus, TestTarget};
use trg_store::{keys, CoreError, QueueBroker, StateStore};
use trg_store_memory::{MemoryBroker, MemoryStore};

struct Harness {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn QueueBroker>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    lifecycle: Lifecycle,
}

fn harness() -> Harness {
    let mut cfg = CoreConfig::defaults();
    cfg.backend = Backend::Memory;
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    Harness {
        scheduler: Scheduler::new(Arc::clone(&store), Arc::clone(&broker), cfg.clone()),
        dispatcher: Dispatcher::new(Arc::clone(&store), Arc::clone(&broker), cfg.clone()),
        lifecycle: Lifecycle::new(Arc::clone(&store), Arc::clone(&broker), cfg),
        store,
        broker,
    }
}

async fn submit(store: &dyn StateStore) -> Job {
    let job = Job::from_spec(
        JobSpec {
            org_id: "o1".to_string(),
            app_version_id: "v1.0".to_string(),
            test_path: "tests/smoke".to_string(),
            target: TestTarget::Emulator,
            priority: 5,
            metadata: None,
        },
        Utc::now(),
    );
    store.create_jobs(std::slice::from_ref(&job)).await.unwrap();
    job
}

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
    let job = submit(h.store.as_ref()).await;
    h.scheduler.tick().await.unwrap();
    assert!(matches!(
        h.dispatcher.tick().await.unwrap(),
        DispatchOutcome::Assigned { .. }
    ));
    h.lifecycle
        .update_status(&job.id, "running", None, None)
        .await
        .unwrap();
    job.id
}

#[tokio::test]
async fn cancelling_a_running_job_notifies_the_agent() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    // Subscribe the way the agent would, before the cancel lands.
    let mut cancels = h
        .broker
        .subscribe(&keys::agent_cancel_channel("a1"))
        .await
        .unwrap();

    let cancelled = h
        .lifecycle
        .cancel(&job_id, Some("device reserved".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some("device reserved"));
    assert!(cancelled.completed_at.is_some());

    let notice = tokio::time::timeout(Duration::from_secs(1), cancels.recv())
        .await
        .expect("cancel notice not published")
        .expect("channel closed");
    assert_eq!(notice["jobId"], job_id.as_str());
    assert_eq!(notice["reason"], "device reserved");
}

#[tokio::test]
async fn second_cancel_is_already_terminal() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    h.lifecycle.cancel(&job_id, None).await.unwrap();
    let before = h.store.get_job(&job_id).await.unwrap().unwrap();

    let err = h.lifecycle.cancel(&job_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyTerminal(_)), "got {err:?}");

    // The persisted row is unchanged by the refused cancel.
    let after = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.error_message, before.error_message);
}

#[tokio::test]
async fn cancelling_a_pending_job_needs_no_agent() {
    let h = harness();
    let job = submit(h.store.as_ref()).await;

    let cancelled = h.lifecycle.cancel(&job.id, None).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some("Job cancelled by user")
    );
}

#[tokio::test]
async fn cancelling_the_last_member_completes_the_group_and_frees_the_agent() {
    let h = harness();
    let job_id = running_job_on(&h, "a1").await;

    let agent = h.store.get_agent("a1").await.unwrap().unwrap();
    assert_eq!(agent.current_jobs.len(), 1);
    let group_id = agent.current_jobs[0].clone();

    h.lifecycle.cancel(&job_id, None).await.unwrap();

    let group = h.store.get_group(&group_id).await.unwrap().unwrap();
    assert_eq!(group.status, trg_schemas::GroupStatus::Completed);
    assert!(group.completed_at.is_some());
    let agent = h.store.get_agent("a1").await.unwrap().unwrap();
    assert!(agent.current_jobs.is_empty(), "capacity slot released");
}

#[tokio::test]
async fn cancelling_a_missing_job_is_not_found() {
    let h = harness();
    let err = h.lifecycle.cancel("job-missing", None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}
