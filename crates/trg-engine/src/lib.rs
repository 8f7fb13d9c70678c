//! The orchestration engine: grouping scheduler, priority dispatcher, and
//! job/agent lifecycle monitor.
//!
//! Each component is constructed with `Arc<dyn StateStore>` /
//! `Arc<dyn QueueBroker>` handles plus the tuning config, exposes a
//! deterministic `tick()` (or request-driven methods) that tests call
//! directly, and a `spawn()` that drives the tick on an interval where a
//! failed tick is logged and the loop continues.

pub mod dispatcher;
pub mod lifecycle;
pub mod loops;
pub mod priority;
pub mod scheduler;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use lifecycle::{Lifecycle, ORPHAN_ERROR_MESSAGE};
pub use priority::priority_score;
pub use scheduler::{Scheduler, SchedulerStats};
