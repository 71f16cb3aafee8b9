//! Predictive warming of compute slots.
//!
//! When user behavior suggests a deployment is imminent (login, template
//! hover, template click, configuration), the manager pre-provisions a
//! compute instance into a *warm slot* keyed by `(user, template)`. If the
//! deployment materializes it claims the slot and skips cold-start latency;
//! if not, the slot expires and its instance is released.
//!
//! # Architecture
//!
//! - [`slot`]: typestate slot model. `Slot<Preparing>` -> `Slot<Ready>` ->
//!   `Slot<Claimed>`, with `Slot<Expired>` reachable from both live states.
//!   Illegal transitions do not compile.
//! - [`store`]: the [`SlotStore`] persistence trait with in-memory and
//!   Postgres implementations. Every transition is a conditional update on
//!   the previous status, so concurrent actors resolve races at the store.
//! - [`provisioner`]: the [`Provisioner`] trait over provider control APIs,
//!   plus a registry for runtime dispatch and a mock for tests.
//! - [`manager`]: the [`WarmingManager`] orchestration layer - triggers,
//!   claims, cancellation, and the expiry sweep.
//! - [`sweep`]: the background loop driving [`WarmingManager::sweep_expired`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use prewarm::{
//!     HttpProvisioner, ProviderKind, ProvisionerRegistry, Signal, WarmingConfig, WarmingManager,
//! };
//! use prewarm::store::in_memory::InMemorySlotStore;
//!
//! # async fn run() -> prewarm::Result<()> {
//! let registry = ProvisionerRegistry::new().with(
//!     ProviderKind::Verda,
//!     Arc::new(HttpProvisioner::new("https://api.verda.example", "key")),
//! );
//! let manager = Arc::new(WarmingManager::new(
//!     Arc::new(InMemorySlotStore::new()),
//!     registry,
//!     WarmingConfig::default(),
//! ));
//! manager.start();
//!
//! let user = uuid::Uuid::new_v4();
//! manager.trigger_warming(user, "ollama", Signal::Click).await?;
//!
//! // Later, when the user actually deploys:
//! if let Some(slot) = manager.claim_warm_slot(user, "ollama").await? {
//!     println!("connect to {}:{}", slot.state.host, slot.state.port);
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod provisioner;
pub mod slot;
pub mod store;
pub mod sweep;

pub use error::{Result, WarmingError};
pub use manager::{
    CancelOutcome, Signal, SlotView, TriggerOutcome, WarmingConfig, WarmingManager,
};
pub use provisioner::{
    HttpProvisioner, MockProvisioner, ProvisionedInstance, Provisioner, ProvisionerRegistry,
};
pub use slot::{
    AnySlot, Claimed, Expired, Preparing, ProviderKind, Ready, Slot, SlotData, SlotId, SlotStatus,
    UserId,
};
pub use store::SlotStore;
