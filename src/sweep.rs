//! Periodic sweep of overdue warm slots.
//!
//! A single loop per manager wakes on a fixed interval, expires every active
//! slot past its TTL, and releases the provider resources of ready ones.
//! Shutdown is cooperative: a cancellation signal stops the loop after the
//! pass in progress completes.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::WarmingManager;
use crate::store::SlotStore;

/// Background sweep task. Constructed and spawned by
/// [`WarmingManager::start`].
pub struct Sweeper<S: SlotStore> {
    manager: Arc<WarmingManager<S>>,
    interval_ms: u64,
    shutdown: CancellationToken,
}

impl<S: SlotStore + 'static> Sweeper<S> {
    pub fn new(
        manager: Arc<WarmingManager<S>>,
        interval_ms: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            interval_ms,
            shutdown,
        }
    }

    /// Run the sweep loop until the shutdown token fires.
    ///
    /// A pass that overruns the interval is not stacked up behind itself;
    /// the next tick is simply skipped.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(self.interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval_ms = self.interval_ms, "Sweep loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Sweep loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.manager.sweep_expired().await {
                        // Transient store errors; the next tick retries.
                        tracing::error!(error = %e, "Sweep pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::manager::{WarmingConfig, WarmingManager};
    use crate::provisioner::{MockProvisioner, ProvisionerRegistry};
    use crate::slot::{Preparing, ProviderKind, Slot, SlotData, SlotStatus};
    use crate::store::in_memory::InMemorySlotStore;
    use crate::store::SlotStore;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sweep_loop_expires_and_stops_cleanly() {
        let store = Arc::new(InMemorySlotStore::new());
        let mock = MockProvisioner::new();
        let registry = ProvisionerRegistry::new().with(ProviderKind::Verda, Arc::new(mock));
        let config = WarmingConfig {
            sweep_interval_ms: 10,
            ..WarmingConfig::default()
        };
        let manager = Arc::new(WarmingManager::new(Arc::clone(&store), registry, config));

        let slot = Slot {
            state: Preparing {},
            data: SlotData {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                template_id: "ollama".to_string(),
                provider: ProviderKind::Verda,
                created_at: Utc::now(),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            },
        };
        let id = slot.data.id;
        store.insert(slot).await.unwrap();

        manager.start();

        // Give the loop a couple of ticks to pick up the overdue slot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);

        // Graceful stop: shutdown returns once the loop has exited.
        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
