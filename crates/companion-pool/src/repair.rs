//! Background pool maintenance
//!
//! Spawns a periodic task that evicts dead and expired bundles and tops the
//! pool back up through `ensure_capacity`. Polling also triggers repair on
//! auth rejection; this task covers quiet periods where bundles simply age
//! out between polls.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::{CredentialPool, RepairTrigger};

/// Spawn the maintenance loop. Runs every `interval` until `cancel` fires.
pub fn spawn_maintenance_task(
    pool: Arc<CredentialPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pool maintenance stopped");
                    return;
                }
                _ = ticker.tick() => {
                    maintenance_cycle(&pool).await;
                }
            }
        }
    })
}

/// Run one cycle: evict, then request capacity.
async fn maintenance_cycle(pool: &Arc<CredentialPool>) -> RepairTrigger {
    let evicted = pool.evict().await;
    let trigger = pool.ensure_capacity().await;
    debug!(evicted, ?trigger, "pool maintenance cycle");
    trigger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use crate::pool::tests::{CountingMinter, bundle, bundle_expiring, pool_with};

    #[tokio::test(start_paused = true)]
    async fn cycle_evicts_and_repairs() {
        let minter = Arc::new(CountingMinter::new(Duration::ZERO));
        let pool = pool_with(PoolSettings::default(), Arc::clone(&minter));
        pool.insert(bundle("a")).await.unwrap();
        pool.insert(bundle_expiring("stale", 2)).await.unwrap();

        let trigger = maintenance_cycle(&pool).await;
        assert_eq!(trigger, RepairTrigger::Started);
        while pool.repair_in_flight() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let ids: Vec<String> = pool.snapshot().await.into_iter().map(|b| b.id).collect();
        assert_eq!(ids, ["a", "minted_0"]);
        assert_eq!(maintenance_cycle(&pool).await, RepairTrigger::NotNeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn task_fills_pool_across_cooldowns_and_stops_on_cancel() {
        let minter = Arc::new(CountingMinter::new(Duration::ZERO));
        let settings = PoolSettings {
            min_pool_size: 3,
            refresh_cooldown: Duration::from_secs(10),
            failure_threshold: 3,
        };
        let pool = pool_with(settings, Arc::clone(&minter));
        let cancel = CancellationToken::new();

        let handle = spawn_maintenance_task(Arc::clone(&pool), Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(minter.calls(), 3, "one mint per cooldown window");
        assert_eq!(pool.healthy_count().await, 3);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task exits after cancel")
            .unwrap();
    }
}
