//! Store contract: listing order and pagination, the FSM transition guard,
//! tri-state patches, and the dispatch-eligibility query.

use chrono::{Duration, Utc};
use trg_schemas::{
    Agent, AgentStatus, Capability, Job, JobSpec, JobStatus, TestTarget,
};
use trg_store::{AgentPatch, CoreError, JobPatch, Patch, StateStore};
use trg_store_memory::MemoryStore;

fn job(org: &str, priority: u8, age_secs: i64) -> Job {
    let mut j = Job::from_spec(
        JobSpec {
            org_id: org.to_string(),
            app_version_id: "v1".to_string(),
            test_path: "tests/all".to_string(),
            target: TestTarget::Emulator,
            priority,
            metadata: None,
        },
        Utc::now() - Duration::seconds(age_secs),
    );
    j.updated_at = j.created_at;
    j
}

fn agent(id: &str, status: AgentStatus, target: TestTarget, max: u32, load: usize) -> Agent {
    Agent {
        id: id.to_string(),
        name: id.to_string(),
        capabilities: vec![Capability {
            target,
            platform: None,
            os_version: None,
            device_name: None,
        }],
        status,
        max_concurrent_jobs: max,
        current_jobs: (0..load).map(|n| format!("grp-{n}")).collect(),
        last_heartbeat: Utc::now(),
        registered_at: Utc::now(),
    }
}

#[tokio::test]
async fn listing_orders_by_priority_then_age() {
    let store = MemoryStore::new();
    let old_low = job("o1", 2, 300);
    let young_high = job("o1", 9, 10);
    let old_high = job("o1", 9, 600);
    store
        .create_jobs(&[old_low.clone(), young_high.clone(), old_high.clone()])
        .await
        .unwrap();

    let page = store.list_jobs(None, None, 50, 0).await.unwrap();
    let ids: Vec<&str> = page.jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec![old_high.id.as_str(), young_high.id.as_str(), old_low.id.as_str()]);
}

#[tokio::test]
async fn pagination_boundaries() {
    let store = MemoryStore::new();
    for n in 0..5 {
        store.create_jobs(&[job("o1", 5, n)]).await.unwrap();
    }

    // limit 0: empty page, real total.
    let page = store.list_jobs(None, None, 0, 0).await.unwrap();
    assert!(page.jobs.is_empty());
    assert_eq!(page.total, 5);

    // offset beyond the total: empty page.
    let page = store.list_jobs(None, None, 50, 99).await.unwrap();
    assert!(page.jobs.is_empty());
    assert_eq!(page.total, 5);

    // a middle slice
    let page = store.list_jobs(None, None, 2, 2).await.unwrap();
    assert_eq!(page.jobs.len(), 2);
}

#[tokio::test]
async fn filters_compose() {
    let store = MemoryStore::new();
    store.create_jobs(&[job("o1", 5, 0), job("o2", 5, 0)]).await.unwrap();
    let page = store
        .list_jobs(Some("o1"), Some(JobStatus::Pending), 50, 0)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].org_id, "o1");

    let none = store
        .list_jobs(Some("o1"), Some(JobStatus::Running), 50, 0)
        .await
        .unwrap();
    assert_eq!(none.total, 0);
}

#[tokio::test]
async fn fsm_guard_refuses_off_graph_edges() {
    let store = MemoryStore::new();
    let j = job("o1", 5, 0);
    store.create_jobs(std::slice::from_ref(&j)).await.unwrap();

    // pending → completed is not an edge.
    let err = store
        .transition_job(&j.id, JobStatus::Completed, JobPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Walk the happy path, then verify terminal is absorbing.
    store
        .transition_job(&j.id, JobStatus::Queued, JobPatch::default())
        .await
        .unwrap();
    store
        .transition_job(&j.id, JobStatus::Running, JobPatch::default())
        .await
        .unwrap();
    store
        .transition_job(&j.id, JobStatus::Completed, JobPatch::default())
        .await
        .unwrap();
    for to in [JobStatus::Pending, JobStatus::Running, JobStatus::Cancelled] {
        let err = store
            .transition_job(&j.id, to, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)), "edge to {to:?}");
    }
}

#[tokio::test]
async fn failed_reenters_pending_only() {
    let store = MemoryStore::new();
    let j = job("o1", 5, 0);
    store.create_jobs(std::slice::from_ref(&j)).await.unwrap();
    for to in [JobStatus::Queued, JobStatus::Running, JobStatus::Failed] {
        store.transition_job(&j.id, to, JobPatch::default()).await.unwrap();
    }

    let err = store
        .transition_job(&j.id, JobStatus::Running, JobPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let back = store
        .transition_job(&j.id, JobStatus::Pending, JobPatch::default())
        .await
        .unwrap();
    assert_eq!(back.status, JobStatus::Pending);
}

#[tokio::test]
async fn tristate_patch_distinguishes_clear_from_keep() {
    let store = MemoryStore::new();
    let j = job("o1", 5, 0);
    store.create_jobs(std::slice::from_ref(&j)).await.unwrap();

    let with_error = store
        .update_job(
            &j.id,
            JobPatch {
                error_message: Patch::Set("boom".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(with_error.error_message.as_deref(), Some("boom"));

    // Keep leaves the message alone.
    let kept = store
        .update_job(
            &j.id,
            JobPatch {
                retry_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(kept.error_message.as_deref(), Some("boom"));

    // Clear writes the unset value.
    let cleared = store
        .update_job(
            &j.id,
            JobPatch {
                error_message: Patch::Clear,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(cleared.error_message.is_none());
}

#[tokio::test]
async fn update_bumps_updated_at() {
    let store = MemoryStore::new();
    let j = job("o1", 5, 60);
    store.create_jobs(std::slice::from_ref(&j)).await.unwrap();
    let before = store.get_job(&j.id).await.unwrap().unwrap().updated_at;
    let after = store
        .update_job(
            &j.id,
            JobPatch {
                retry_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(after.updated_at > before);
}

#[tokio::test]
async fn available_agents_applies_the_eligibility_predicate() {
    let store = MemoryStore::new();
    for a in [
        agent("a-online", AgentStatus::Online, TestTarget::Emulator, 3, 0),
        agent("a-busy-spare", AgentStatus::Busy, TestTarget::Emulator, 3, 2),
        agent("a-full", AgentStatus::Online, TestTarget::Emulator, 2, 2),
        agent("a-offline", AgentStatus::Offline, TestTarget::Emulator, 3, 0),
        agent("a-maint", AgentStatus::Maintenance, TestTarget::Emulator, 3, 0),
        agent("a-device", AgentStatus::Online, TestTarget::Device, 3, 0),
    ] {
        store.register_agent(&a).await.unwrap();
    }

    let mut ids: Vec<String> = store
        .available_agents(Some(TestTarget::Emulator))
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a-busy-spare", "a-online"]);

    // Without a target filter the device agent qualifies too.
    let all = store.available_agents(None).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn jobs_running_on_agent_is_scoped() {
    let store = MemoryStore::new();
    let mut a = job("o1", 5, 0);
    let mut b = job("o1", 5, 0);
    store
        .create_jobs(&[a.clone(), b.clone()])
        .await
        .unwrap();
    for j in [&mut a, &mut b] {
        store
            .transition_job(&j.id, JobStatus::Queued, JobPatch::default())
            .await
            .unwrap();
    }
    store
        .transition_job(
            &a.id,
            JobStatus::Running,
            JobPatch {
                assigned_agent: Patch::Set("agent-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .transition_job(
            &b.id,
            JobStatus::Running,
            JobPatch {
                assigned_agent: Patch::Set("agent-2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let on_one = store.jobs_running_on_agent("agent-1").await.unwrap();
    assert_eq!(on_one.len(), 1);
    assert_eq!(on_one[0].id, a.id);
}

#[tokio::test]
async fn agent_patch_is_partial() {
    let store = MemoryStore::new();
    let a = agent("a1", AgentStatus::Online, TestTarget::Emulator, 3, 1);
    store.register_agent(&a).await.unwrap();

    let updated = store
        .update_agent(
            "a1",
            AgentPatch {
                status: Some(AgentStatus::Busy),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, AgentStatus::Busy);
    assert_eq!(updated.current_jobs.len(), 1, "untouched fields survive");
    assert_eq!(updated.max_concurrent_jobs, 3);
}
