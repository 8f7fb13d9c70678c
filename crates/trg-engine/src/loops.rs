//! Periodic task driver shared by the engine loops.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use trg_store::CoreError;

/// Run `tick` on an interval forever. A failed tick is logged with context
/// and the loop continues; the next tick is the retry.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), CoreError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = tick().await {
                warn!(task = name, error = %err, kind = err.kind(), "tick failed");
            }
        }
    })
}
