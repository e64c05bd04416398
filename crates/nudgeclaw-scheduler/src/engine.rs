//! Internal dispatch loop for single-node deployments.
//! Uses tokio::interval, so the process sleeps between cycles. Equivalent to
//! an external cron hitting the trigger endpoint every `tick_secs`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatch::Dispatcher;

/// Spawn a background task running one cycle per tick.
///
/// A `tick_secs` of 0 means cycles only come from the external trigger, so
/// no loop is spawned.
pub fn spawn_dispatch_loop(
    dispatcher: Dispatcher,
    tick_secs: u64,
    max_batch: usize,
) -> Option<JoinHandle<()>> {
    if tick_secs == 0 {
        tracing::info!("⏰ Dispatch loop disabled (tick_secs = 0), waiting for external triggers");
        return None;
    }
    Some(tokio::spawn(async move {
        tracing::info!("⏰ Dispatch loop started (every {}s, batch {})", tick_secs, max_batch);
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        // A slow cycle should not trigger a burst of catch-up cycles.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match dispatcher.run_cycle(max_batch).await {
                Ok(report) if report.failed > 0 => {
                    for failure in &report.failures {
                        tracing::debug!(
                            "📣 [{}] {} failed: {}",
                            failure.kind,
                            failure.task_id,
                            failure.message
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!("❌ Dispatch cycle aborted: {e}"),
            }
        }
    }))
}
