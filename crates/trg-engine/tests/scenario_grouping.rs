//! Grouping scenarios: one scheduler tick coalesces same-key pending jobs
//! into a single group, moves them to `queued`, and scores the group into
//! the dispatch queue.

use std::sync::Arc;

use chrono::Utc;
use trg_config::{Backend, CoreConfig};
use trg_engine::Scheduler;
use trg_schemas::{Job, JobSpec, JobStatus, TestTarget};
use trg_store::{keys, QueueBroker, StateStore};
use trg_store_memory::{MemoryBroker, MemoryStore};

fn test_config() -> CoreConfig {
    let mut cfg = CoreConfig::defaults();
    cfg.backend = Backend::Memory;
    cfg
}

fn spec(org: &str, app: &str, target: TestTarget, priority: u8) -> JobSpec {
    JobSpec {
        org_id: org.to_string(),
        app_version_id: app.to_string(),
        test_path: "tests/smoke".to_string(),
        target,
        priority,
        metadata: None,
    }
}

async fn submit(store: &dyn StateStore, spec: JobSpec) -> Job {
    let job = Job::from_spec(spec, Utc::now());
    store.create_jobs(std::slice::from_ref(&job)).await.unwrap();
    job
}

#[tokio::test]
async fn same_key_jobs_coalesce_into_one_group() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&broker), test_config());

    let j1 = submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 5)).await;
    let j2 = submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 5)).await;
    let j3 = submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 8)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.groups_created, 1);
    assert_eq!(stats.jobs_queued, 3);

    for id in [&j1.id, &j2.id, &j3.id] {
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.assigned_agent.is_none(), "no agent before dispatch");
    }

    // Exactly one entry in the dispatch queue, scored from avg priority 6
    // with (near-zero) age boost.
    assert_eq!(broker.priority_len(keys::GROUPS_SCHEDULING).await.unwrap(), 1);
    let group_id = broker
        .priority_pop_max(keys::GROUPS_SCHEDULING)
        .await
        .unwrap()
        .unwrap();
    let raw = broker
        .hash_get(keys::GROUPS_DESCRIPTORS, &group_id)
        .await
        .unwrap()
        .unwrap();
    let descriptor: trg_schemas::GroupDescriptor = serde_json::from_str(&raw).unwrap();
    assert_eq!(descriptor.job_count, 3);
    assert!((descriptor.priority_score - 6.0).abs() < 0.2);
}

#[tokio::test]
async fn distinct_keys_make_distinct_groups() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&broker), test_config());

    submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 5)).await;
    submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Device, 5)).await;
    submit(store.as_ref(), spec("o2", "v1.0", TestTarget::Emulator, 5)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.groups_created, 3);
    assert_eq!(broker.priority_len(keys::GROUPS_SCHEDULING).await.unwrap(), 3);
}

#[tokio::test]
async fn later_submission_joins_the_active_group() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&broker), test_config());

    submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 5)).await;
    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.groups_created, 1);

    // New job with the same key while the group is still pending: reuse,
    // do not coin a second group.
    submit(store.as_ref(), spec("o1", "v1.0", TestTarget::Emulator, 7)).await;
    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.groups_created, 0);
    assert_eq!(second.jobs_queued, 1);

    // Queue member is the group id, so the re-score did not duplicate it.
    assert_eq!(broker.priority_len(keys::GROUPS_SCHEDULING).await.unwrap(), 1);
}

#[tokio::test]
async fn submitting_same_spec_yields_distinct_jobs() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let s = spec("o1", "v1.0", TestTarget::Cloud, 5);
    let a = submit(store.as_ref(), s.clone()).await;
    let b = submit(store.as_ref(), s).await;
    assert_ne!(a.id, b.id);
    assert_eq!(store.list_jobs(None, None, 50, 0).await.unwrap().total, 2);
}
