use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::slot::{AnySlot, Preparing, Ready, Slot, SlotId, SlotState, SlotStatus, UserId};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage trait for persisting and querying warm slots.
///
/// The store may be shared with other replicas of the service, so every
/// status change goes through [`SlotStore::transition`], a conditional
/// single-row update. The type system constrains which transitions exist;
/// the store guards against stale writers.
pub trait SlotStore: Send + Sync {
    /// Insert a freshly created slot. Slots always enter storage in the
    /// `preparing` state.
    ///
    /// # Errors
    /// - If a slot with the same ID already exists
    fn insert(&self, slot: Slot<Preparing>) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a slot by ID, in whatever state it currently holds.
    ///
    /// # Errors
    /// - `SlotNotFound` if the slot doesn't exist
    fn get(&self, id: SlotId) -> impl Future<Output = Result<AnySlot>> + Send;

    /// Find the active (`preparing` or `ready`) slot for a
    /// `(user, template)` pair, if any. At most one exists.
    fn find_active(
        &self,
        user_id: UserId,
        template_id: &str,
    ) -> impl Future<Output = Result<Option<AnySlot>>> + Send;

    /// All active slots for a user (read-only projection).
    fn list_active(&self, user_id: UserId) -> impl Future<Output = Result<Vec<AnySlot>>> + Send;

    /// Number of active slots for a user, for cap enforcement.
    fn count_active(&self, user_id: UserId) -> impl Future<Output = Result<usize>> + Send;

    /// Find a `ready` slot for the pair that has not yet expired at `now`.
    fn find_ready(
        &self,
        user_id: UserId,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Slot<Ready>>>> + Send;

    /// All active slots whose `expires_at` is strictly before `now`.
    fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<AnySlot>>> + Send;

    /// Extend a slot's expiry to `expires_at`, but never shorten it: the
    /// stored value becomes `max(current, expires_at)`.
    ///
    /// Returns the effective expiry after the update, or `None` if the slot
    /// is missing or no longer active (extension only applies to
    /// `preparing`/`ready` slots).
    fn extend_expiry(
        &self,
        id: SlotId,
        expires_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Conditionally persist `slot`, succeeding only if the stored row is
    /// still in the `expected` status (`UPDATE .. WHERE id = $1 AND
    /// status = $2` semantics).
    ///
    /// Returns `false` when the row has moved on - the caller lost the race
    /// and must not assume its transition took effect. Never an error: a
    /// rejected transition on a terminal slot is an expected outcome.
    fn transition<T: SlotState + Clone>(
        &self,
        expected: SlotStatus,
        slot: &Slot<T>,
    ) -> impl Future<Output = Result<bool>> + Send
    where
        AnySlot: From<Slot<T>>;
}
