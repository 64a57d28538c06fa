use std::time::Duration;

use chrono::Utc;
use evintake_ledger::EvidenceLedger;
use tokio::task::JoinHandle;

use crate::config::MAX_WINDOW_DAYS;

/// Spawns the idempotency-cache sweeper. An interval of zero disables it.
pub fn spawn_idempotency_sweep(
    ledger: EvidenceLedger,
    retention_days: u64,
    interval_secs: u64,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("idempotency.sweep disabled");
        return None;
    }

    let retention = retention_window(retention_days);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match ledger.sweep_idempotency(Utc::now() - retention).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "idempotency.sweep"),
                Err(err) => tracing::warn!(error = %err, "idempotency.sweep_failed"),
            }
        }
    }))
}

fn retention_window(retention_days: u64) -> chrono::Duration {
    let days = retention_days.clamp(1, MAX_WINDOW_DAYS) as i64;
    chrono::Duration::days(days)
}
