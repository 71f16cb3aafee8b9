//! Core types for the warming system.
//!
//! This module defines the type-safe warm-slot lifecycle using the typestate
//! pattern. Each slot progresses through distinct states, enforced at compile
//! time: `preparing -> ready -> claimed`, with `expired` reachable from either
//! non-terminal state.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a warm slot.
pub type SlotId = Uuid;

/// Stable identifier for the owning user, produced by the auth layer.
pub type UserId = Uuid;

/// Compute backend a slot is provisioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Verda,
    Targon,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Verda => "verda",
            ProviderKind::Targon => "targon",
            ProviderKind::Local => "local",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verda" => Ok(ProviderKind::Verda),
            "targon" => Ok(ProviderKind::Targon),
            "local" => Ok(ProviderKind::Local),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// The status of a warm slot, as stored and exposed over the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Preparing,
    Ready,
    Claimed,
    Expired,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Preparing => "preparing",
            SlotStatus::Ready => "ready",
            SlotStatus::Claimed => "claimed",
            SlotStatus::Expired => "expired",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotStatus::Claimed | SlotStatus::Expired)
    }

    /// Active states count against the per-user cap.
    pub fn is_active(&self) -> bool {
        matches!(self, SlotStatus::Preparing | SlotStatus::Ready)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(SlotStatus::Preparing),
            "ready" => Ok(SlotStatus::Ready),
            "claimed" => Ok(SlotStatus::Claimed),
            "expired" => Ok(SlotStatus::Expired),
            other => Err(format!("unknown slot status '{other}'")),
        }
    }
}

/// Marker trait for valid slot states.
///
/// This trait enables the typestate pattern, ensuring that operations are only
/// performed on slots in valid states.
pub trait SlotState: Send + Sync {}

/// A warm slot: a speculative, time-boxed reservation of compute resources
/// for a `(user, template)` pair.
///
/// Uses the typestate pattern to ensure type-safe state transitions. The
/// generic parameter `T` represents the current state of the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<T: SlotState> {
    /// The current state of the slot.
    pub state: T,
    /// State-independent slot data.
    pub data: SlotData,
}

/// Data shared by every slot state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotData {
    pub id: SlotId,

    /// Owning user.
    pub user_id: UserId,

    /// Application template the slot is pre-warmed for (e.g. "ollama").
    pub template_id: String,

    /// Which compute backend is provisioning it.
    pub provider: ProviderKind,

    pub created_at: DateTime<Utc>,

    /// When the slot stops being eligible for claim. Set at creation and only
    /// ever extended while the slot is active.
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Slot States
// ============================================================================

/// The underlying container is being provisioned.
///
/// This is the initial state for all newly triggered slots. No connection
/// coordinates exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preparing {}

impl SlotState for Preparing {}

/// Provisioning completed: the slot holds a live instance and is waiting to
/// be claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    /// Handle to the underlying resource at the provider.
    pub provider_instance_id: String,
    pub host: String,
    pub port: u16,
    pub ready_at: DateTime<Utc>,
}

impl SlotState for Ready {}

/// The slot was converted into a real deployment. Terminal; resource
/// ownership transferred to the deployment layer, so no release happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    pub provider_instance_id: String,
    pub host: String,
    pub port: u16,
    pub ready_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
}

impl SlotState for Claimed {}

/// The slot's TTL lapsed or provisioning failed. Terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    /// Instance handle at the time of expiry, if one was ever acquired. Kept
    /// for operational forensics; the resource itself has been released.
    pub provider_instance_id: Option<String>,
    pub expired_at: DateTime<Utc>,
}

impl SlotState for Expired {}

// ============================================================================
// Unified Slot Representation
// ============================================================================

/// Enum that can hold a slot in any state.
///
/// This is used for storage and read paths where slots are handled uniformly
/// regardless of their current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnySlot {
    Preparing(Slot<Preparing>),
    Ready(Slot<Ready>),
    Claimed(Slot<Claimed>),
    Expired(Slot<Expired>),
}

impl AnySlot {
    pub fn id(&self) -> SlotId {
        self.data().id
    }

    pub fn user_id(&self) -> UserId {
        self.data().user_id
    }

    pub fn template_id(&self) -> &str {
        &self.data().template_id
    }

    pub fn provider(&self) -> ProviderKind {
        self.data().provider
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data().created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.data().expires_at
    }

    /// State-independent slot data.
    pub fn data(&self) -> &SlotData {
        match self {
            AnySlot::Preparing(s) => &s.data,
            AnySlot::Ready(s) => &s.data,
            AnySlot::Claimed(s) => &s.data,
            AnySlot::Expired(s) => &s.data,
        }
    }

    pub(crate) fn data_mut(&mut self) -> &mut SlotData {
        match self {
            AnySlot::Preparing(s) => &mut s.data,
            AnySlot::Ready(s) => &mut s.data,
            AnySlot::Claimed(s) => &mut s.data,
            AnySlot::Expired(s) => &mut s.data,
        }
    }

    pub fn status(&self) -> SlotStatus {
        match self {
            AnySlot::Preparing(_) => SlotStatus::Preparing,
            AnySlot::Ready(_) => SlotStatus::Ready,
            AnySlot::Claimed(_) => SlotStatus::Claimed,
            AnySlot::Expired(_) => SlotStatus::Expired,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Connection host; populated only for ready/claimed slots.
    pub fn host(&self) -> Option<&str> {
        match self {
            AnySlot::Ready(s) => Some(&s.state.host),
            AnySlot::Claimed(s) => Some(&s.state.host),
            _ => None,
        }
    }

    /// Connection port; populated only for ready/claimed slots.
    pub fn port(&self) -> Option<u16> {
        match self {
            AnySlot::Ready(s) => Some(s.state.port),
            AnySlot::Claimed(s) => Some(s.state.port),
            _ => None,
        }
    }

    pub fn provider_instance_id(&self) -> Option<&str> {
        match self {
            AnySlot::Preparing(_) => None,
            AnySlot::Ready(s) => Some(&s.state.provider_instance_id),
            AnySlot::Claimed(s) => Some(&s.state.provider_instance_id),
            AnySlot::Expired(s) => s.state.provider_instance_id.as_deref(),
        }
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnySlot::Ready(s) => Some(s.state.ready_at),
            AnySlot::Claimed(s) => Some(s.state.ready_at),
            _ => None,
        }
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnySlot::Claimed(s) => Some(s.state.claimed_at),
            _ => None,
        }
    }

    /// Whole seconds until expiry, clamped at zero.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at() - now).num_seconds().max(0)
    }

    /// Try to extract as a Preparing slot.
    pub fn as_preparing(&self) -> Option<&Slot<Preparing>> {
        match self {
            AnySlot::Preparing(s) => Some(s),
            _ => None,
        }
    }

    /// Try to take as a Ready slot, consuming self.
    pub fn into_ready(self) -> Option<Slot<Ready>> {
        match self {
            AnySlot::Ready(s) => Some(s),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Slot to AnySlot

impl From<Slot<Preparing>> for AnySlot {
    fn from(s: Slot<Preparing>) -> Self {
        AnySlot::Preparing(s)
    }
}

impl From<Slot<Ready>> for AnySlot {
    fn from(s: Slot<Ready>) -> Self {
        AnySlot::Ready(s)
    }
}

impl From<Slot<Claimed>> for AnySlot {
    fn from(s: Slot<Claimed>) -> Self {
        AnySlot::Claimed(s)
    }
}

impl From<Slot<Expired>> for AnySlot {
    fn from(s: Slot<Expired>) -> Self {
        AnySlot::Expired(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> SlotData {
        SlotData {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            template_id: "ollama".to_string(),
            provider: ProviderKind::Verda,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(180),
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!SlotStatus::Preparing.is_terminal());
        assert!(!SlotStatus::Ready.is_terminal());
        assert!(SlotStatus::Claimed.is_terminal());
        assert!(SlotStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_active() {
        assert!(SlotStatus::Preparing.is_active());
        assert!(SlotStatus::Ready.is_active());
        assert!(!SlotStatus::Claimed.is_active());
        assert!(!SlotStatus::Expired.is_active());
    }

    #[test]
    fn test_provider_round_trip() {
        for kind in [ProviderKind::Verda, ProviderKind::Targon, ProviderKind::Local] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("firecracker".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_host_port_only_when_ready_or_claimed() {
        let preparing = AnySlot::Preparing(Slot {
            state: Preparing {},
            data: sample_data(),
        });
        assert_eq!(preparing.host(), None);
        assert_eq!(preparing.port(), None);

        let ready = AnySlot::Ready(Slot {
            state: Ready {
                provider_instance_id: "inst-1".to_string(),
                host: "warm-a1b2".to_string(),
                port: 8080,
                ready_at: Utc::now(),
            },
            data: sample_data(),
        });
        assert_eq!(ready.host(), Some("warm-a1b2"));
        assert_eq!(ready.port(), Some(8080));
    }

    #[test]
    fn test_seconds_remaining_clamped() {
        let now = Utc::now();
        let mut data = sample_data();
        data.expires_at = now + chrono::Duration::seconds(90);
        let slot = AnySlot::Preparing(Slot {
            state: Preparing {},
            data: data.clone(),
        });
        assert_eq!(slot.seconds_remaining(now), 90);

        data.expires_at = now - chrono::Duration::seconds(5);
        let overdue = AnySlot::Preparing(Slot {
            state: Preparing {},
            data,
        });
        assert_eq!(overdue.seconds_remaining(now), 0);
    }
}
