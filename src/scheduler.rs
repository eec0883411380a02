use crate::lifecycle::Lifecycle;
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Spawn the recurring reversion sweep. Runs for the life of the process,
/// independent of any request; the first sweep fires at startup so stale
/// reset requests accumulated during downtime are caught up immediately.
pub fn spawn(lifecycle: Lifecycle) -> JoinHandle<()> {
    let period = sweep_interval_from_env();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match lifecycle.revert_stale_resets(Utc::now()).await {
                Ok(reverted) => {
                    crate::metrics::sweep_reverted(reverted);
                    info!(
                        target = "courier.sweep",
                        reverted = reverted,
                        grace_days = lifecycle.config.grace_days,
                        "reversion sweep finished"
                    );
                }
                Err(err) => {
                    error!(target = "courier.sweep", error = %err, "reversion sweep failed");
                }
            }
        }
    })
}

fn sweep_interval_from_env() -> Duration {
    let secs = std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(86_400);
    Duration::from_secs(secs)
}
