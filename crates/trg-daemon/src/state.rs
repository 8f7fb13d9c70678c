//! Shared runtime state for trg-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The state owns trait
//! handles to the store and broker plus the lifecycle facade; it never
//! knows which backend is wired behind them.

use std::sync::Arc;

use trg_config::CoreConfig;
use trg_engine::Lifecycle;
use trg_store::{QueueBroker, StateStore};
use trg_store_memory::{MemoryBroker, MemoryStore};

/// Static build metadata included in health responses.
#[derive(Clone, Copy, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub build: BuildInfo,
    pub store: Arc<dyn StateStore>,
    pub broker: Arc<dyn QueueBroker>,
    pub lifecycle: Arc<Lifecycle>,
    pub cfg: CoreConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn QueueBroker>,
        cfg: CoreConfig,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            cfg.clone(),
        ));
        Self {
            build: BuildInfo {
                service: "trg-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            store,
            broker,
            lifecycle,
            cfg,
        }
    }

    /// Fully in-memory state: the memory backend mode, and what every
    /// scenario test runs against.
    pub fn in_memory(cfg: CoreConfig) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
        Self::new(store, broker, cfg)
    }
}
