//! Warm-slot lifecycle: typestate definitions and the transitions between
//! them.

pub mod transitions;
pub mod types;

pub use types::{
    AnySlot, Claimed, Expired, Preparing, ProviderKind, Ready, Slot, SlotData, SlotId, SlotState,
    SlotStatus, UserId,
};
