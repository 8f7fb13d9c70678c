//! Broker key, queue, and channel naming. Every name the engine and the
//! agents share is built here so the two sides cannot drift.

use trg_schemas::CoalesceKey;

/// Priority queue of group ids awaiting dispatch.
pub const GROUPS_SCHEDULING: &str = "groups:scheduling";

/// Hash of group id → serialized `GroupDescriptor`. The priority queue holds
/// bare ids; the payload lives here.
pub const GROUPS_DESCRIPTORS: &str = "groups:descriptors";

/// Set of agent ids that have registered at least once.
pub const AGENTS_REGISTERED: &str = "agents:registered";

pub const CHANNEL_JOB_STATUS_UPDATED: &str = "job:status:updated";
pub const CHANNEL_JOB_COMPLETED: &str = "job:completed";

/// Per-agent FIFO work queue, consumed by the agent with a blocking pop.
pub fn agent_work_queue(agent_id: &str) -> String {
    format!("agent:{agent_id}:work")
}

/// Per-agent cancellation channel.
pub fn agent_cancel_channel(agent_id: &str) -> String {
    format!("agent:{agent_id}:cancel")
}

/// Per-agent assignment lock. Serializes the dispatch mutation path across
/// dispatcher replicas; TTL-bounded so a crashed holder cannot wedge the
/// agent.
pub fn agent_lock_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:lock")
}

/// Coalescing-key → group-id mapping, TTL-bounded (default 3600 s).
pub fn group_key(key: &CoalesceKey) -> String {
    format!(
        "group:{}:{}:{}",
        key.org_id,
        key.app_version_id,
        key.target.as_str()
    )
}
