//! In-memory slot store.
//!
//! Stores all slots in memory behind a `parking_lot` lock. Suitable for
//! testing and single-process deployments; slots are lost on restart. All
//! mutations happen under one lock, so the conditional-update contract holds
//! within the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, WarmingError};
use crate::slot::{AnySlot, Preparing, Ready, Slot, SlotId, SlotState, SlotStatus, UserId};

use super::SlotStore;

/// In-memory implementation of the [`SlotStore`] trait.
#[derive(Clone, Default)]
pub struct InMemorySlotStore {
    slots: Arc<RwLock<HashMap<SlotId, AnySlot>>>,
}

impl InMemorySlotStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots in any state, including terminal ones.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl SlotStore for InMemorySlotStore {
    async fn insert(&self, slot: Slot<Preparing>) -> Result<()> {
        let mut slots = self.slots.write();

        if slots.contains_key(&slot.data.id) {
            return Err(WarmingError::Other(anyhow::anyhow!(
                "slot {} already exists",
                slot.data.id
            )));
        }

        slots.insert(slot.data.id, slot.into());
        Ok(())
    }

    async fn get(&self, id: SlotId) -> Result<AnySlot> {
        self.slots
            .read()
            .get(&id)
            .cloned()
            .ok_or(WarmingError::SlotNotFound(id))
    }

    async fn find_active(&self, user_id: UserId, template_id: &str) -> Result<Option<AnySlot>> {
        let slots = self.slots.read();
        Ok(slots
            .values()
            .find(|s| {
                s.is_active() && s.user_id() == user_id && s.template_id() == template_id
            })
            .cloned())
    }

    async fn list_active(&self, user_id: UserId) -> Result<Vec<AnySlot>> {
        let slots = self.slots.read();
        let mut active: Vec<AnySlot> = slots
            .values()
            .filter(|s| s.is_active() && s.user_id() == user_id)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at());
        Ok(active)
    }

    async fn count_active(&self, user_id: UserId) -> Result<usize> {
        let slots = self.slots.read();
        Ok(slots
            .values()
            .filter(|s| s.is_active() && s.user_id() == user_id)
            .count())
    }

    async fn find_ready(
        &self,
        user_id: UserId,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Slot<Ready>>> {
        let slots = self.slots.read();
        Ok(slots
            .values()
            .find(|s| {
                s.status() == SlotStatus::Ready
                    && s.user_id() == user_id
                    && s.template_id() == template_id
                    && s.expires_at() > now
            })
            .cloned()
            .and_then(AnySlot::into_ready))
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<AnySlot>> {
        let slots = self.slots.read();
        Ok(slots
            .values()
            .filter(|s| s.is_active() && s.expires_at() < now)
            .cloned()
            .collect())
    }

    async fn extend_expiry(
        &self,
        id: SlotId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut slots = self.slots.write();

        match slots.get_mut(&id) {
            Some(slot) if slot.is_active() => {
                let data = slot.data_mut();
                // Monotonic: never shorten an existing reservation.
                data.expires_at = data.expires_at.max(expires_at);
                Ok(Some(data.expires_at))
            }
            _ => Ok(None),
        }
    }

    async fn transition<T: SlotState + Clone>(
        &self,
        expected: SlotStatus,
        slot: &Slot<T>,
    ) -> Result<bool>
    where
        AnySlot: From<Slot<T>>,
    {
        let mut slots = self.slots.write();

        match slots.get_mut(&slot.data.id) {
            Some(existing) if existing.status() == expected => {
                *existing = slot.clone().into();
                Ok(true)
            }
            // Row moved on (or never existed): the caller lost the race.
            _ => Ok(false),
        }
    }
}
