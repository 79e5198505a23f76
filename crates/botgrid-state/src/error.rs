//! Error types for the BotGrid state store.

use thiserror::Error;

use botgrid_core::InstanceId;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("account {account} is leased by session {holder} on instance {instance}")]
    LeaseConflict {
        account: String,
        holder: String,
        instance: InstanceId,
    },

    #[error("account {account} is leased by session {holder}, not the caller")]
    LeaseNotHeld { account: String, holder: String },
}
