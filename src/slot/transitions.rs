//! State transitions for warm slots.
//!
//! Each transition constructs the next typestate and persists it through the
//! store's conditional update. A `None` return means the stored row was no
//! longer in the expected state - another actor (the sweep, a concurrent
//! claim) got there first. Callers treat that as losing the race, not as an
//! error.

use crate::error::Result;
use crate::provisioner::ProvisionedInstance;
use crate::store::SlotStore;

use super::types::{Claimed, Expired, Preparing, Ready, Slot, SlotStatus};

impl Slot<Preparing> {
    /// Provisioning succeeded: record the instance handle and connection
    /// coordinates and move to `ready`.
    ///
    /// Returns `None` if the slot was expired while provisioning was in
    /// flight; the caller is then responsible for releasing `instance`.
    pub async fn ready<S: SlotStore>(
        self,
        instance: ProvisionedInstance,
        store: &S,
    ) -> Result<Option<Slot<Ready>>> {
        let slot = Slot {
            state: Ready {
                provider_instance_id: instance.instance_id,
                host: instance.host,
                port: instance.port,
                ready_at: chrono::Utc::now(),
            },
            data: self.data,
        };
        if store.transition(SlotStatus::Preparing, &slot).await? {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    /// Provisioning failed or the slot was cancelled before completing.
    ///
    /// `provider_instance_id` carries a partially acquired handle, if any,
    /// so the record reflects what was released.
    pub async fn expire<S: SlotStore>(
        self,
        provider_instance_id: Option<String>,
        store: &S,
    ) -> Result<Option<Slot<Expired>>> {
        let slot = Slot {
            state: Expired {
                provider_instance_id,
                expired_at: chrono::Utc::now(),
            },
            data: self.data,
        };
        if store.transition(SlotStatus::Preparing, &slot).await? {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }
}

impl Slot<Ready> {
    /// Convert the slot into a deployment. Sets `claimed_at`; the instance
    /// is not released - ownership transfers to the deployment layer.
    ///
    /// Returns `None` when a concurrent claim or the sweep won: exactly one
    /// caller observes `Some` for a given ready slot.
    pub async fn claim<S: SlotStore>(self, store: &S) -> Result<Option<Slot<Claimed>>> {
        let slot = Slot {
            state: Claimed {
                provider_instance_id: self.state.provider_instance_id,
                host: self.state.host,
                port: self.state.port,
                ready_at: self.state.ready_at,
                claimed_at: chrono::Utc::now(),
            },
            data: self.data,
        };
        if store.transition(SlotStatus::Ready, &slot).await? {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    /// The TTL lapsed before anyone claimed the slot. The caller releases
    /// the underlying instance before (best-effort) or after this call.
    pub async fn expire<S: SlotStore>(self, store: &S) -> Result<Option<Slot<Expired>>> {
        let slot = Slot {
            state: Expired {
                provider_instance_id: Some(self.state.provider_instance_id),
                expired_at: chrono::Utc::now(),
            },
            data: self.data,
        };
        if store.transition(SlotStatus::Ready, &slot).await? {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::provisioner::ProvisionedInstance;
    use crate::slot::{AnySlot, Preparing, ProviderKind, Slot, SlotData, SlotStatus};
    use crate::store::{in_memory::InMemorySlotStore, SlotStore};

    fn preparing_slot() -> Slot<Preparing> {
        Slot {
            state: Preparing {},
            data: SlotData {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                template_id: "jupyter".to_string(),
                provider: ProviderKind::Verda,
                created_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::seconds(180),
            },
        }
    }

    fn instance() -> ProvisionedInstance {
        ProvisionedInstance {
            instance_id: "inst-42".to_string(),
            host: "warm-ab12".to_string(),
            port: 8080,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_preparing_to_ready_sets_connection_info() {
        let store = InMemorySlotStore::new();
        let slot = preparing_slot();
        let id = slot.data.id;
        store.insert(slot.clone()).await.unwrap();

        let ready = slot.ready(instance(), &store).await.unwrap().unwrap();
        assert_eq!(ready.state.host, "warm-ab12");
        assert_eq!(ready.state.port, 8080);

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status(), SlotStatus::Ready);
        assert_eq!(stored.host(), Some("warm-ab12"));
    }

    #[test_log::test(tokio::test)]
    async fn test_ready_loses_race_against_expiry() {
        let store = InMemorySlotStore::new();
        let slot = preparing_slot();
        let id = slot.data.id;
        store.insert(slot.clone()).await.unwrap();

        // The sweep expires the slot first.
        let expired = slot.clone().expire(None, &store).await.unwrap();
        assert!(expired.is_some());

        // The late provisioning task must not overwrite the expired row.
        let result = slot.ready(instance(), &store).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.get(id).await.unwrap().status(), SlotStatus::Expired);
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_is_exclusive() {
        let store = InMemorySlotStore::new();
        let slot = preparing_slot();
        store.insert(slot.clone()).await.unwrap();
        let ready = slot.ready(instance(), &store).await.unwrap().unwrap();

        let claimed = ready.clone().claim(&store).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(
            claimed.as_ref().unwrap().state.provider_instance_id,
            "inst-42"
        );

        // Second claim against the same (stale) ready view loses.
        let second = ready.claim(&store).await.unwrap();
        assert!(second.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_terminal_states_never_transition() {
        let store = InMemorySlotStore::new();
        let slot = preparing_slot();
        let id = slot.data.id;
        store.insert(slot.clone()).await.unwrap();

        let ready = slot.ready(instance(), &store).await.unwrap().unwrap();
        ready.clone().claim(&store).await.unwrap().unwrap();

        // Neither expiry nor a second claim moves a claimed slot.
        assert!(ready.clone().expire(&store).await.unwrap().is_none());
        assert!(ready.claim(&store).await.unwrap().is_none());

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status(), SlotStatus::Claimed);
        assert_eq!(stored.host(), Some("warm-ab12"));
        assert!(matches!(stored, AnySlot::Claimed(_)));
    }
}
