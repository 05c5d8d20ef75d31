/// Error types for the sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("authentication expired")]
    AuthExpired,

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("push channel closed: {0}")]
    ChannelClosed(String),

    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
