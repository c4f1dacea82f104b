//! Sync layer errors

use std::time::Duration;

/// Errors raised by the hub connection
///
/// None of these are fatal to the process: the client reports them through
/// its status channel and retries with backoff.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid hub url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no traffic from hub for {0:?}")]
    IdleTimeout(Duration),

    #[error("websocket handshake not completed within {0:?}")]
    ConnectTimeout(Duration),

    #[error("hub closed the connection")]
    Closed,

    #[error("offline queue storage error: {0}")]
    Storage(#[from] sled::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}
