use thiserror::Error;

use crate::slot::{ProviderKind, SlotId};

/// Result type for warming operations.
pub type Result<T> = std::result::Result<T, WarmingError>;

/// Errors that can occur in the warming system.
#[derive(Debug, Error)]
pub enum WarmingError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Warm slot not found
    #[error("Warm slot not found: {0}")]
    SlotNotFound(SlotId),

    /// The user already has the maximum number of active warm slots
    #[error("Warm slot limit reached ({max} active slots per user)")]
    SlotLimitExceeded { max: usize },

    /// Caller does not own the slot they tried to modify
    #[error("Not authorized to modify warm slot {0}")]
    Unauthorized(SlotId),

    /// No provisioner registered for the provider tag
    #[error("No provisioner registered for provider '{0}'")]
    ProviderNotRegistered(ProviderKind),

    /// The compute backend rejected or failed the provisioning request
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// HTTP request to a provider control API failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Other(#[from] anyhow::Error),
}
