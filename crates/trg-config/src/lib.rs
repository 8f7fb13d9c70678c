//! Environment-sourced configuration for the orchestrator daemon.
//!
//! Every knob has a documented default; only the backend connection strings
//! are required, and only when the postgres backend is selected. Parsing is
//! driven through an injected lookup function so tests never touch process
//! environment.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const ENV_DATABASE_URL: &str = "TRG_DATABASE_URL";
pub const ENV_REDIS_URL: &str = "TRG_REDIS_URL";
pub const ENV_BACKEND: &str = "TRG_BACKEND";
pub const ENV_DAEMON_ADDR: &str = "TRG_DAEMON_ADDR";
pub const ENV_SCHEDULER_TICK_SECS: &str = "TRG_SCHEDULER_TICK_SECS";
pub const ENV_DISPATCHER_TICK_SECS: &str = "TRG_DISPATCHER_TICK_SECS";
pub const ENV_RETRY_TICK_SECS: &str = "TRG_RETRY_TICK_SECS";
pub const ENV_MAX_RETRIES: &str = "TRG_MAX_RETRIES";
pub const ENV_RETRY_DELAY_SECS: &str = "TRG_RETRY_DELAY_SECS";
pub const ENV_HEARTBEAT_TIMEOUT_SECS: &str = "TRG_HEARTBEAT_TIMEOUT_SECS";
pub const ENV_LOCK_TTL_SECS: &str = "TRG_LOCK_TTL_SECS";
pub const ENV_GROUP_KEY_TTL_SECS: &str = "TRG_GROUP_KEY_TTL_SECS";

/// Which store/broker pair the daemon wires at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// PostgreSQL state store + Redis queue broker (production).
    Postgres,
    /// In-memory store and broker in one process (local development).
    Memory,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub backend: Backend,
    /// Required for the postgres backend.
    pub database_url: Option<String>,
    /// Required for the postgres backend.
    pub redis_url: Option<String>,
    /// HTTP bind address. Default `127.0.0.1:8899`.
    pub daemon_addr: SocketAddr,
    /// Scheduler tick interval. Default 5 s.
    pub scheduler_tick: Duration,
    /// Dispatcher tick interval. Default 2 s.
    pub dispatcher_tick: Duration,
    /// Retry-monitor tick interval. Default 30 s.
    pub retry_tick: Duration,
    /// Retry ceiling per job. Default 3.
    pub max_retries: u32,
    /// Minimum age of a failure before it is retried. Default 60 s.
    pub retry_delay: Duration,
    /// Agents silent longer than this are marked offline. Default 90 s.
    pub heartbeat_timeout: Duration,
    /// Per-agent dispatch lock TTL. Default 10 s.
    pub lock_ttl: Duration,
    /// Coalescing-key TTL. Default 3600 s.
    pub group_key_ttl: Duration,
}

impl CoreConfig {
    pub fn defaults() -> Self {
        Self {
            backend: Backend::Postgres,
            database_url: None,
            redis_url: None,
            daemon_addr: SocketAddr::from(([127, 0, 0, 1], 8899)),
            scheduler_tick: Duration::from_secs(5),
            dispatcher_tick: Duration::from_secs(2),
            retry_tick: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(90),
            lock_ttl: Duration::from_secs(10),
            group_key_ttl: Duration::from_secs(3600),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::defaults();

        if let Some(raw) = lookup(ENV_BACKEND) {
            cfg.backend = match raw.as_str() {
                "postgres" => Backend::Postgres,
                "memory" => Backend::Memory,
                other => {
                    return Err(anyhow!(
                        "{ENV_BACKEND} must be 'postgres' or 'memory', got '{other}'"
                    ))
                }
            };
        }

        cfg.database_url = lookup(ENV_DATABASE_URL);
        cfg.redis_url = lookup(ENV_REDIS_URL);

        if let Some(raw) = lookup(ENV_DAEMON_ADDR) {
            cfg.daemon_addr = raw
                .parse()
                .with_context(|| format!("{ENV_DAEMON_ADDR} is not a socket address: {raw}"))?;
        }

        cfg.scheduler_tick = secs(&lookup, ENV_SCHEDULER_TICK_SECS, cfg.scheduler_tick)?;
        cfg.dispatcher_tick = secs(&lookup, ENV_DISPATCHER_TICK_SECS, cfg.dispatcher_tick)?;
        cfg.retry_tick = secs(&lookup, ENV_RETRY_TICK_SECS, cfg.retry_tick)?;
        cfg.retry_delay = secs(&lookup, ENV_RETRY_DELAY_SECS, cfg.retry_delay)?;
        cfg.heartbeat_timeout = secs(&lookup, ENV_HEARTBEAT_TIMEOUT_SECS, cfg.heartbeat_timeout)?;
        cfg.lock_ttl = secs(&lookup, ENV_LOCK_TTL_SECS, cfg.lock_ttl)?;
        cfg.group_key_ttl = secs(&lookup, ENV_GROUP_KEY_TTL_SECS, cfg.group_key_ttl)?;

        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            cfg.max_retries = raw
                .parse()
                .with_context(|| format!("{ENV_MAX_RETRIES} is not an integer: {raw}"))?;
        }

        if cfg.backend == Backend::Postgres {
            if cfg.database_url.is_none() {
                return Err(anyhow!("missing env var {ENV_DATABASE_URL}"));
            }
            if cfg.redis_url.is_none() {
                return Err(anyhow!("missing env var {ENV_REDIS_URL}"));
            }
        }

        Ok(cfg)
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => {
            let n: u64 = raw
                .parse()
                .with_context(|| format!("{key} is not a number of seconds: {raw}"))?;
            Ok(Duration::from_secs(n))
        }
    }
}
