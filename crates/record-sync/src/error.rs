// File: record-sync/src/error.rs
// Purpose: Error types for realtime record sync

use thiserror::Error;

/// Errors surfaced by the resolver and the subscription managers
#[derive(Debug, Error)]
pub enum SyncError {
    /// The form binding rejected a batch of field values.
    #[error("failed to apply remote field values: {0}")]
    Apply(#[source] anyhow::Error),

    /// The channel could not be created or subscribed.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
