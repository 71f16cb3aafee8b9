//! Warming manager: the orchestration core of the predictive warming system.
//!
//! The manager races user intent signals against background provisioning:
//! a trigger durably records a `preparing` slot and returns immediately,
//! while a spawned warm task provisions the instance and flips the slot to
//! `ready`. Deployment creation then claims ready slots to skip cold-start
//! latency. A periodic sweep expires overdue slots and releases their
//! resources.
//!
//! Managers are constructed explicitly with their store and provisioner
//! registry injected; process lifetime is driven by the host application's
//! startup/shutdown hooks via [`WarmingManager::start`] and
//! [`WarmingManager::shutdown`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{Result, WarmingError};
use crate::provisioner::{release_best_effort, Provisioner, ProvisionerRegistry};
use crate::slot::{
    AnySlot, Claimed, Preparing, ProviderKind, Slot, SlotData, SlotId, SlotStatus, UserId,
};
use crate::store::SlotStore;
use crate::sweep::Sweeper;

/// Configuration for the warming manager.
#[derive(Debug, Clone)]
pub struct WarmingConfig {
    /// How long an unclaimed slot stays alive. Re-triggers extend by this
    /// amount.
    pub slot_ttl_seconds: i64,

    /// How often the sweep pass looks for overdue slots.
    pub sweep_interval_ms: u64,

    /// Maximum simultaneous `preparing`/`ready` slots per user.
    pub max_slots_per_user: usize,

    /// Provider new slots are provisioned on.
    pub default_provider: ProviderKind,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            slot_ttl_seconds: 180,
            sweep_interval_ms: 30_000,
            max_slots_per_user: 2,
            default_provider: ProviderKind::Verda,
        }
    }
}

/// The UI/user event that triggered a warming attempt. Informational only;
/// recorded in logs, never used for gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Login,
    Hover,
    Click,
    Config,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Signal::Login => "login",
            Signal::Hover => "hover",
            Signal::Click => "click",
            Signal::Config => "config",
        };
        f.write_str(s)
    }
}

/// Read-only projection of a slot for API responses.
///
/// Host and port are absent until the slot is ready.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub slot_id: SlotId,
    pub template_id: String,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub seconds_remaining: i64,
}

impl SlotView {
    pub fn from_slot(slot: &AnySlot, now: DateTime<Utc>) -> Self {
        Self {
            slot_id: slot.id(),
            template_id: slot.template_id().to_string(),
            status: slot.status(),
            host: slot.host().map(str::to_string),
            port: slot.port(),
            created_at: slot.created_at(),
            ready_at: slot.ready_at(),
            expires_at: slot.expires_at(),
            seconds_remaining: slot.seconds_remaining(now),
        }
    }
}

/// Outcome of a successful `trigger_warming` call.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// A new slot was created and provisioning scheduled.
    Created { slot: SlotView },
    /// An active slot for the pair already existed; its TTL was extended.
    Extended { slot: SlotView },
}

impl TriggerOutcome {
    pub fn slot(&self) -> &SlotView {
        match self {
            TriggerOutcome::Created { slot } => slot,
            TriggerOutcome::Extended { slot } => slot,
        }
    }

    pub fn extended(&self) -> bool {
        matches!(self, TriggerOutcome::Extended { .. })
    }
}

/// Outcome of a `cancel_warm_slot` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The slot had already been claimed or expired; nothing changed.
    AlreadyTerminal,
}

/// Manages predictive warming of compute slots.
///
/// Generic over the slot store so the same orchestration runs against the
/// in-memory store in tests and Postgres in production.
pub struct WarmingManager<S: SlotStore> {
    store: Arc<S>,
    provisioners: ProvisionerRegistry,
    config: WarmingConfig,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    warm_tasks_in_flight: Arc<AtomicUsize>,
}

impl<S: SlotStore + 'static> WarmingManager<S> {
    /// Create a new manager with injected dependencies.
    pub fn new(store: Arc<S>, provisioners: ProvisionerRegistry, config: WarmingConfig) -> Self {
        Self {
            store,
            provisioners,
            config,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            warm_tasks_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WarmingConfig {
        &self.config
    }

    /// Number of warm tasks currently provisioning.
    pub fn warm_tasks_in_flight(&self) -> usize {
        self.warm_tasks_in_flight.load(Ordering::Relaxed)
    }

    /// Start the background sweep loop.
    pub fn start(self: &Arc<Self>) {
        let sweeper = Sweeper::new(
            Arc::clone(self),
            self.config.sweep_interval_ms,
            self.shutdown.clone(),
        );
        self.tasks.spawn(sweeper.run());
        tracing::info!("Warming manager started");
    }

    /// Stop the sweep loop and wait for it plus any in-flight warm tasks.
    ///
    /// The sweep finishes its current pass before exiting, so shutdown never
    /// leaves a row half-updated. Warm tasks are not cancelled; they run to
    /// completion and clean up after themselves if their slot expired.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Warming manager stopped");
    }

    /// Trigger warming for a `(user, template)` pair.
    ///
    /// Extends the TTL when an active slot already exists; otherwise creates
    /// a `preparing` slot and schedules provisioning in the background. The
    /// call returns as soon as the slot is durably recorded - it never
    /// blocks on provisioning.
    ///
    /// # Errors
    /// - `SlotLimitExceeded` when the user is at the active-slot cap
    /// - `ProviderNotRegistered` when the configured provider has no
    ///   provisioner
    #[tracing::instrument(skip(self), fields(user_id = %user_id, template_id = %template_id, signal = %signal))]
    pub async fn trigger_warming(
        &self,
        user_id: UserId,
        template_id: &str,
        signal: Signal,
    ) -> Result<TriggerOutcome> {
        if let Some(existing) = self.store.find_active(user_id, template_id).await? {
            let requested = Utc::now() + chrono::Duration::seconds(self.config.slot_ttl_seconds);
            if self
                .store
                .extend_expiry(existing.id(), requested)
                .await?
                .is_some()
            {
                let slot = self.store.get(existing.id()).await?;
                tracing::debug!(slot_id = %slot.id(), "Extended TTL on existing warm slot");
                return Ok(TriggerOutcome::Extended {
                    slot: SlotView::from_slot(&slot, Utc::now()),
                });
            }
            // The slot went terminal between lookup and extension; fall
            // through and create a fresh one.
        }

        let active = self.store.count_active(user_id).await?;
        if active >= self.config.max_slots_per_user {
            return Err(WarmingError::SlotLimitExceeded {
                max: self.config.max_slots_per_user,
            });
        }

        let provider = self.config.default_provider;
        // Resolve the provisioner up front so a misconfigured registry fails
        // the trigger synchronously instead of stranding a preparing slot.
        let provisioner = self.provisioners.get(provider)?;

        let now = Utc::now();
        let slot = Slot {
            state: Preparing {},
            data: SlotData {
                id: Uuid::new_v4(),
                user_id,
                template_id: template_id.to_string(),
                provider,
                created_at: now,
                expires_at: now + chrono::Duration::seconds(self.config.slot_ttl_seconds),
            },
        };
        self.store.insert(slot.clone()).await?;

        tracing::info!(slot_id = %slot.data.id, "Created warm slot, scheduling provisioning");

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.warm_tasks_in_flight);
        let slot_id = slot.data.id;
        let template = slot.data.template_id.clone();
        in_flight.fetch_add(1, Ordering::Relaxed);
        self.tasks.spawn(async move {
            let _guard = scopeguard::guard((), |_| {
                in_flight.fetch_sub(1, Ordering::Relaxed);
            });
            warm_slot(store, provisioner, slot_id, template).await;
        });

        Ok(TriggerOutcome::Created {
            slot: SlotView::from_slot(&slot.into(), now),
        })
    }

    /// Try to claim a ready warm slot for deployment.
    ///
    /// Atomically transitions ready -> claimed; under concurrent claims for
    /// the same pair exactly one caller gets the slot. Returns `None` when
    /// no eligible slot exists - the caller falls back to cold-start
    /// provisioning.
    pub async fn claim_warm_slot(
        &self,
        user_id: UserId,
        template_id: &str,
    ) -> Result<Option<Slot<Claimed>>> {
        let Some(slot) = self
            .store
            .find_ready(user_id, template_id, Utc::now())
            .await?
        else {
            return Ok(None);
        };

        let claimed = slot.claim(self.store.as_ref()).await?;
        if let Some(claimed) = &claimed {
            tracing::info!(
                slot_id = %claimed.data.id,
                user_id = %user_id,
                template_id = %template_id,
                "Warm slot claimed for deployment"
            );
        }
        Ok(claimed)
    }

    /// All active slots for a user, with computed seconds remaining.
    pub async fn get_user_warm_slots(&self, user_id: UserId) -> Result<Vec<SlotView>> {
        let now = Utc::now();
        let slots = self.store.list_active(user_id).await?;
        Ok(slots
            .iter()
            .map(|slot| SlotView::from_slot(slot, now))
            .collect())
    }

    /// Owner-requested early expiry of a slot.
    ///
    /// Ownership is checked before any mutation; terminal slots report
    /// `AlreadyTerminal` without side effects.
    ///
    /// # Errors
    /// - `SlotNotFound` if the slot doesn't exist
    /// - `Unauthorized` if `user_id` does not own the slot
    pub async fn cancel_warm_slot(
        &self,
        slot_id: SlotId,
        user_id: UserId,
    ) -> Result<CancelOutcome> {
        let slot = self.store.get(slot_id).await?;
        if slot.user_id() != user_id {
            return Err(WarmingError::Unauthorized(slot_id));
        }

        match slot {
            AnySlot::Preparing(slot) => {
                let outcome = match slot.expire(None, self.store.as_ref()).await? {
                    Some(_) => CancelOutcome::Canceled,
                    None => CancelOutcome::AlreadyTerminal,
                };
                Ok(outcome)
            }
            AnySlot::Ready(slot) => {
                let provider = slot.data.provider;
                let instance_id = slot.state.provider_instance_id.clone();
                // Win the expiry transition before touching the instance. A
                // release issued first can tear down an instance that a
                // concurrent claim just took ownership of.
                match slot.expire(self.store.as_ref()).await? {
                    Some(_) => {
                        match self.provisioners.get(provider) {
                            Ok(provisioner) => {
                                release_best_effort(provisioner.as_ref(), &instance_id).await
                            }
                            Err(e) => tracing::warn!(
                                slot_id = %slot_id,
                                error = %e,
                                "No provisioner to release cancelled slot"
                            ),
                        }
                        Ok(CancelOutcome::Canceled)
                    }
                    // Claim or sweep got there first; the instance belongs
                    // to whoever won.
                    None => Ok(CancelOutcome::AlreadyTerminal),
                }
            }
            AnySlot::Claimed(_) | AnySlot::Expired(_) => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// One batched sweep pass: expire every active slot past its TTL and
    /// release its resources. Failures are isolated per slot; one bad
    /// release never blocks the rest of the batch.
    ///
    /// Returns the number of slots expired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let overdue = self.store.find_expired(now).await?;
        let mut swept = 0;

        for slot in overdue {
            let slot_id = slot.id();
            // Win the expiry transition before releasing; the reverse order
            // can destroy an instance a concurrent claim just took over.
            let to_release = match slot {
                AnySlot::Preparing(slot) => match slot.expire(None, self.store.as_ref()).await {
                    Ok(Some(_)) => None,
                    // Another actor (claim, cancel, a second replica's
                    // sweep) transitioned the slot first.
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(slot_id = %slot_id, error = %e, "Failed to expire overdue slot");
                        continue;
                    }
                },
                AnySlot::Ready(slot) => {
                    let provider = slot.data.provider;
                    let instance_id = slot.state.provider_instance_id.clone();
                    match slot.expire(self.store.as_ref()).await {
                        Ok(Some(_)) => Some((provider, instance_id)),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!(slot_id = %slot_id, error = %e, "Failed to expire overdue slot");
                            continue;
                        }
                    }
                }
                // find_expired only returns active slots.
                AnySlot::Claimed(_) | AnySlot::Expired(_) => continue,
            };

            if let Some((provider, instance_id)) = to_release {
                match self.provisioners.get(provider) {
                    Ok(provisioner) => {
                        release_best_effort(provisioner.as_ref(), &instance_id).await
                    }
                    Err(e) => tracing::warn!(
                        slot_id = %slot_id,
                        error = %e,
                        "No provisioner to release expired slot"
                    ),
                }
            }
            swept += 1;
        }

        if swept > 0 {
            tracing::info!(swept, "Expired overdue warm slots");
        }
        Ok(swept)
    }
}

/// Background task that provisions one slot's instance.
///
/// One task runs per created slot. It is never cancelled mid-flight; if the
/// sweep expires the slot while provisioning is in progress, the task simply
/// releases the instance it acquired and discards its result.
async fn warm_slot<S: SlotStore>(
    store: Arc<S>,
    provisioner: Arc<dyn Provisioner>,
    slot_id: SlotId,
    template_id: String,
) {
    let instance = match provisioner.provision(&template_id).await {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!(slot_id = %slot_id, error = %e, "Provisioning failed, expiring slot");
            match store.get(slot_id).await {
                Ok(AnySlot::Preparing(slot)) => {
                    if let Err(e) = slot.expire(None, store.as_ref()).await {
                        tracing::error!(
                            slot_id = %slot_id,
                            error = %e,
                            "Failed to expire slot after provisioning failure"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(slot_id = %slot_id, error = %e, "Failed to fetch failed slot")
                }
            }
            return;
        }
    };

    // Re-fetch before writing ready: the sweep may have expired the slot
    // while provisioning was in flight. A slot that is no longer preparing
    // lost the race, and the fresh instance must be released rather than
    // written over the row.
    match store.get(slot_id).await {
        Ok(AnySlot::Preparing(slot)) => {
            match slot.ready(instance.clone(), store.as_ref()).await {
                Ok(Some(ready)) => {
                    tracing::info!(
                        slot_id = %slot_id,
                        host = %ready.state.host,
                        port = ready.state.port,
                        "Warm slot ready"
                    );
                }
                Ok(None) => {
                    tracing::debug!(slot_id = %slot_id, "Slot expired during provisioning, releasing instance");
                    release_best_effort(provisioner.as_ref(), &instance.instance_id).await;
                }
                Err(e) => {
                    tracing::error!(slot_id = %slot_id, error = %e, "Failed to persist ready slot, releasing instance");
                    release_best_effort(provisioner.as_ref(), &instance.instance_id).await;
                }
            }
        }
        Ok(other) => {
            tracing::debug!(
                slot_id = %slot_id,
                status = %other.status(),
                "Slot no longer preparing, releasing instance"
            );
            release_best_effort(provisioner.as_ref(), &instance.instance_id).await;
        }
        Err(e) => {
            tracing::error!(slot_id = %slot_id, error = %e, "Failed to re-fetch slot, releasing instance");
            release_best_effort(provisioner.as_ref(), &instance.instance_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::{MockProvisioner, ProvisionedInstance};
    use crate::store::in_memory::InMemorySlotStore;

    fn test_manager(
        config: WarmingConfig,
    ) -> (
        Arc<WarmingManager<InMemorySlotStore>>,
        Arc<InMemorySlotStore>,
        MockProvisioner,
    ) {
        let store = Arc::new(InMemorySlotStore::new());
        let mock = MockProvisioner::new();
        let registry = ProvisionerRegistry::new()
            .with(ProviderKind::Verda, Arc::new(mock.clone()))
            .with(ProviderKind::Local, Arc::new(mock.clone()));
        let manager = Arc::new(WarmingManager::new(
            Arc::clone(&store),
            registry,
            config,
        ));
        (manager, store, mock)
    }

    fn fast_config() -> WarmingConfig {
        WarmingConfig {
            slot_ttl_seconds: 180,
            sweep_interval_ms: 10,
            max_slots_per_user: 2,
            default_provider: ProviderKind::Verda,
        }
    }

    // Scenario A: trigger -> preparing without connection info; after
    // provisioning completes the slot is ready with host/port set.
    #[test_log::test(tokio::test)]
    async fn test_trigger_creates_preparing_then_ready() {
        let (manager, _store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        assert!(!outcome.extended());
        let view = outcome.slot();
        assert_eq!(view.status, SlotStatus::Preparing);
        assert!(view.host.is_none());
        assert!(view.port.is_none());
        assert!(view.seconds_remaining > 175 && view.seconds_remaining <= 180);

        // Wait for the warm task to finish.
        manager.shutdown().await;
        assert_eq!(mock.provision_count(), 1);

        let slots = manager.get_user_warm_slots(user).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].status, SlotStatus::Ready);
        assert!(slots[0].host.is_some());
        assert_eq!(slots[0].port, Some(8080));
        assert!(slots[0].ready_at.is_some());
    }

    // Scenario B: a second trigger before provisioning completes extends
    // the existing slot instead of creating a duplicate.
    #[test_log::test(tokio::test)]
    async fn test_retrigger_extends_instead_of_duplicating() {
        let (manager, store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        let hold = mock.add_instance_with_trigger(ProvisionedInstance {
            instance_id: "inst-1".to_string(),
            host: "warm-1".to_string(),
            port: 8080,
        });

        let first = manager
            .trigger_warming(user, "ollama", Signal::Hover)
            .await
            .unwrap();
        let second = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();

        assert!(second.extended());
        assert_eq!(second.slot().slot_id, first.slot().slot_id);
        assert_eq!(store.len(), 1);

        // TTL extension is monotonic.
        assert!(second.slot().expires_at >= first.slot().expires_at);

        drop(hold);
        manager.shutdown().await;
    }

    // Scenario C: the third distinct template hits the per-user cap.
    #[test_log::test(tokio::test)]
    async fn test_slot_limit_enforced() {
        let (manager, store, _mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        manager
            .trigger_warming(user, "ollama", Signal::Login)
            .await
            .unwrap();
        manager
            .trigger_warming(user, "jupyter", Signal::Login)
            .await
            .unwrap();

        let third = manager.trigger_warming(user, "minecraft", Signal::Login).await;
        assert!(matches!(
            third,
            Err(WarmingError::SlotLimitExceeded { max: 2 })
        ));

        assert_eq!(store.count_active(user).await.unwrap(), 2);

        // Re-triggering an existing template still works at the cap: the
        // extension path does not double-count the slot being extended.
        let again = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        assert!(again.extended());

        manager.shutdown().await;
    }

    // Scenario D (no instance): a preparing slot past its TTL is swept to
    // expired without any release call.
    #[test_log::test(tokio::test)]
    async fn test_sweep_expires_preparing_slot_without_release() {
        let (manager, store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        let slot = Slot {
            state: Preparing {},
            data: SlotData {
                id: Uuid::new_v4(),
                user_id: user,
                template_id: "ollama".to_string(),
                provider: ProviderKind::Verda,
                created_at: Utc::now(),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            },
        };
        let id = slot.data.id;
        store.insert(slot).await.unwrap();

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);
        assert_eq!(mock.release_count(), 0);
    }

    // Scenario D (with instance): an overdue ready slot is released exactly
    // once and marked expired.
    #[test_log::test(tokio::test)]
    async fn test_sweep_releases_overdue_ready_slot() {
        let mut config = fast_config();
        config.slot_ttl_seconds = -1; // slots are born overdue
        let (manager, store, mock) = test_manager(config);
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;

        // Let provisioning finish; the slot becomes ready (but overdue).
        manager.shutdown().await;
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Ready);

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        let slot = store.get(id).await.unwrap();
        assert_eq!(slot.status(), SlotStatus::Expired);
        assert_eq!(slot.host(), None);
        assert_eq!(mock.release_count(), 1);
        assert_eq!(mock.release_calls(), vec!["mock-1".to_string()]);
    }

    // Scenario E: claim a ready slot; the second claim comes up empty.
    #[test_log::test(tokio::test)]
    async fn test_claim_then_second_claim_returns_none() {
        let (manager, _store, _mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        manager
            .trigger_warming(user, "ollama", Signal::Config)
            .await
            .unwrap();
        manager.shutdown().await;

        let claimed = manager.claim_warm_slot(user, "ollama").await.unwrap();
        let claimed = claimed.expect("ready slot should be claimable");
        assert_eq!(claimed.state.port, 8080);
        assert!(claimed.state.claimed_at >= claimed.state.ready_at);

        let second = manager.claim_warm_slot(user, "ollama").await.unwrap();
        assert!(second.is_none());

        // Claimed slots no longer show up in the active view.
        let slots = manager.get_user_warm_slots(user).await.unwrap();
        assert!(slots.is_empty());
    }

    // The correctness-critical race: provisioning completes after the sweep
    // already expired the slot. The warm task must release the instance
    // exactly once and must not write ready over the expired row.
    #[test_log::test(tokio::test)]
    async fn test_late_provisioning_releases_instead_of_overwriting() {
        let mut config = fast_config();
        config.slot_ttl_seconds = -1;
        let (manager, store, mock) = test_manager(config);
        let user = Uuid::new_v4();

        let hold = mock.add_instance_with_trigger(ProvisionedInstance {
            instance_id: "inst-race".to_string(),
            host: "warm-race".to_string(),
            port: 8080,
        });

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;

        // Sweep wins while provisioning is held in flight.
        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);
        assert_eq!(mock.release_count(), 0);

        // Now let provisioning complete and the warm task drain.
        hold.send(()).unwrap();
        manager.shutdown().await;

        let slot = store.get(id).await.unwrap();
        assert_eq!(slot.status(), SlotStatus::Expired);
        assert_eq!(slot.host(), None);
        assert_eq!(mock.release_calls(), vec!["inst-race".to_string()]);
    }

    // Claim exclusivity under concurrency: one winner, one None.
    #[test_log::test(tokio::test)]
    async fn test_concurrent_claims_have_one_winner() {
        let (manager, _store, _mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        manager.shutdown().await;

        let (a, b) = tokio::join!(
            manager.claim_warm_slot(user, "ollama"),
            manager.claim_warm_slot(user, "ollama"),
        );
        let wins = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(wins, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_provisioning_failure_expires_slot_without_retry() {
        let (manager, store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        mock.add_error("no capacity");
        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;

        manager.shutdown().await;

        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);
        assert_eq!(mock.provision_count(), 1);
        assert_eq!(mock.release_count(), 0);

        // A fresh trigger retries from scratch.
        let retry = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        assert!(!retry.extended());
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_requires_ownership() {
        let (manager, store, _mock) = test_manager(fast_config());
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(owner, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;

        let denied = manager.cancel_warm_slot(id, stranger).await;
        assert!(matches!(denied, Err(WarmingError::Unauthorized(_))));
        assert!(store.get(id).await.unwrap().is_active());

        let cancelled = manager.cancel_warm_slot(id, owner).await.unwrap();
        assert_eq!(cancelled, CancelOutcome::Canceled);
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);

        manager.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_ready_slot_releases_instance() {
        let (manager, _store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;
        manager.shutdown().await;

        let cancelled = manager.cancel_warm_slot(id, user).await.unwrap();
        assert_eq!(cancelled, CancelOutcome::Canceled);
        assert_eq!(mock.release_count(), 1);

        // Cancelling again is an idempotent no-op.
        let again = manager.cancel_warm_slot(id, user).await.unwrap();
        assert_eq!(again, CancelOutcome::AlreadyTerminal);
        assert_eq!(mock.release_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_missing_slot_is_not_found() {
        let (manager, _store, _mock) = test_manager(fast_config());
        let result = manager
            .cancel_warm_slot(Uuid::new_v4(), Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(WarmingError::SlotNotFound(_))));
    }

    // Cap invariant: no trigger sequence pushes a user above the cap.
    #[test_log::test(tokio::test)]
    async fn test_cap_invariant_over_trigger_sequence() {
        let (manager, store, _mock) = test_manager(fast_config());
        let user = Uuid::new_v4();
        let templates = ["ollama", "jupyter", "minecraft", "desktop", "ollama"];

        for template in templates {
            let _ = manager.trigger_warming(user, template, Signal::Hover).await;
            assert!(store.count_active(user).await.unwrap() <= 2);
        }

        manager.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_unregistered_provider_fails_synchronously() {
        let store = Arc::new(InMemorySlotStore::new());
        let manager = WarmingManager::new(
            Arc::clone(&store),
            ProvisionerRegistry::new(),
            fast_config(),
        );

        let result = manager
            .trigger_warming(Uuid::new_v4(), "ollama", Signal::Login)
            .await;
        assert!(matches!(
            result,
            Err(WarmingError::ProviderNotRegistered(ProviderKind::Verda))
        ));
        assert!(store.is_empty());
    }

    /// Records the stored status of a designated slot at the moment
    /// `release` is invoked, to pin down transition/release ordering.
    struct ReleaseOrderRecorder {
        store: Arc<InMemorySlotStore>,
        slot_id: parking_lot::Mutex<Option<SlotId>>,
        statuses: parking_lot::Mutex<Vec<SlotStatus>>,
    }

    impl ReleaseOrderRecorder {
        fn new(store: Arc<InMemorySlotStore>) -> Arc<Self> {
            Arc::new(Self {
                store,
                slot_id: parking_lot::Mutex::new(None),
                statuses: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Provisioner for ReleaseOrderRecorder {
        async fn provision(&self, _template_id: &str) -> Result<ProvisionedInstance> {
            Ok(ProvisionedInstance {
                instance_id: "inst-1".to_string(),
                host: "warm-1".to_string(),
                port: 8080,
            })
        }

        async fn release(&self, _instance_id: &str) -> Result<()> {
            let id = (*self.slot_id.lock()).expect("slot id set before release");
            let status = self.store.get(id).await?.status();
            self.statuses.lock().push(status);
            Ok(())
        }
    }

    // Cancel must win the ready -> expired transition before releasing, so
    // it can never tear down an instance a concurrent claim just took over.
    #[test_log::test(tokio::test)]
    async fn test_cancel_releases_only_after_slot_is_expired() {
        let store = Arc::new(InMemorySlotStore::new());
        let recorder = ReleaseOrderRecorder::new(Arc::clone(&store));
        let registry = ProvisionerRegistry::new()
            .with(ProviderKind::Verda, Arc::clone(&recorder) as Arc<dyn Provisioner>);
        let manager = Arc::new(WarmingManager::new(
            Arc::clone(&store),
            registry,
            fast_config(),
        ));
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;
        manager.shutdown().await;
        *recorder.slot_id.lock() = Some(id);

        let cancelled = manager.cancel_warm_slot(id, user).await.unwrap();
        assert_eq!(cancelled, CancelOutcome::Canceled);
        assert_eq!(*recorder.statuses.lock(), vec![SlotStatus::Expired]);
    }

    // Same ordering for the sweep: the row is expired before the instance
    // is released.
    #[test_log::test(tokio::test)]
    async fn test_sweep_releases_only_after_slot_is_expired() {
        let mut config = fast_config();
        config.slot_ttl_seconds = -1;
        let store = Arc::new(InMemorySlotStore::new());
        let recorder = ReleaseOrderRecorder::new(Arc::clone(&store));
        let registry = ProvisionerRegistry::new()
            .with(ProviderKind::Verda, Arc::clone(&recorder) as Arc<dyn Provisioner>);
        let manager = Arc::new(WarmingManager::new(Arc::clone(&store), registry, config));
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;
        manager.shutdown().await;
        *recorder.slot_id.lock() = Some(id);

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(*recorder.statuses.lock(), vec![SlotStatus::Expired]);
    }

    // A cancel that loses to a claim leaves the claimed deployment's
    // instance untouched.
    #[test_log::test(tokio::test)]
    async fn test_cancel_after_claim_never_releases_claimed_instance() {
        let (manager, store, mock) = test_manager(fast_config());
        let user = Uuid::new_v4();

        let outcome = manager
            .trigger_warming(user, "ollama", Signal::Click)
            .await
            .unwrap();
        let id = outcome.slot().slot_id;
        manager.shutdown().await;

        let claimed = manager.claim_warm_slot(user, "ollama").await.unwrap();
        assert!(claimed.is_some());

        let cancelled = manager.cancel_warm_slot(id, user).await.unwrap();
        assert_eq!(cancelled, CancelOutcome::AlreadyTerminal);
        assert_eq!(mock.release_count(), 0);

        let slot = store.get(id).await.unwrap();
        assert_eq!(slot.status(), SlotStatus::Claimed);
        assert!(slot.host().is_some());
    }
}
