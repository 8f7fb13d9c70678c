//! trg-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, wires the selected
//! backend pair, rebuilds the scheduling queue from the store, spawns the
//! engine loops, and starts the HTTP server. All route handlers live in
//! `routes.rs`; all shared state types live in `state.rs`.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use trg_config::{Backend, CoreConfig};
use trg_daemon::{routes, state::AppState};
use trg_engine::{Dispatcher, Scheduler};
use trg_store::{QueueBroker, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = CoreConfig::from_env()?;

    let (store, broker): (Arc<dyn StateStore>, Arc<dyn QueueBroker>) = match cfg.backend {
        Backend::Postgres => {
            let url = cfg
                .database_url
                .as_deref()
                .context("postgres backend needs TRG_DATABASE_URL")?;
            let pool = trg_db::connect(url).await?;
            trg_db::migrate(&pool).await?;
            let redis_url = cfg
                .redis_url
                .as_deref()
                .context("postgres backend needs TRG_REDIS_URL")?;
            let broker = trg_broker_redis::RedisBroker::connect(redis_url).await?;
            (Arc::new(trg_db::PgStore::new(pool)), Arc::new(broker))
        }
        Backend::Memory => {
            info!("memory backend selected; state will not survive restart");
            (
                Arc::new(trg_store_memory::MemoryStore::new()),
                Arc::new(trg_store_memory::MemoryBroker::new()),
            )
        }
    };

    let shared = Arc::new(AppState::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        cfg.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        cfg.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        cfg.clone(),
    ));

    // The broker is not durable; reseed the dispatch queue from the store
    // before the loops start.
    let restored = scheduler.rebuild().await?;
    if restored > 0 {
        info!(groups = restored, "scheduling queue restored");
    }

    Arc::clone(&scheduler).spawn(cfg.scheduler_tick);
    Arc::clone(&dispatcher).spawn(cfg.dispatcher_tick);
    Arc::clone(&shared.lifecycle).spawn(cfg.retry_tick);

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = cfg.daemon_addr;
    info!("trg-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

/// CORS: allow only localhost origins (the dashboard dev servers).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
