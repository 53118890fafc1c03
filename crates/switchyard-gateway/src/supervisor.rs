use crate::router::MessageRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodic background pass over the control plane: liveness sweep,
/// deadline enforcement, starvation, dispatch, and retention purge.
///
/// Returns the [`tokio::task::JoinHandle`] so the caller can abort or await
/// it. The loop ends by itself once the control plane shuts down.
pub fn spawn_supervisor(
    router: Arc<MessageRouter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Supervisor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if router.plane().is_shutting_down() {
                break;
            }
            let out = router.plane().tick();
            if !out.is_empty() {
                debug!(effects = out.len(), "Supervisor pass");
                router.deliver(out).await;
            }
        }
        info!("Supervisor stopped");
    })
}
