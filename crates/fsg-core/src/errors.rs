use std::path::PathBuf;

/// Core error type for the gateway.
///
/// Adapter crates map their specific errors into this type so the core can
/// treat failures consistently (absorbed per item vs surfaced to the caller).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable: {path}: {reason}")]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("remote publish failed: {0}")]
    RemotePublish(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
