use reqwest::StatusCode;
use std::time::Duration;

/// Failures of the fetch pipeline, surfaced unchanged to its caller.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("weather API responded with HTTP {status}")]
    UpstreamHttp { status: StatusCode },

    #[error("weather API did not answer within {timeout:?}")]
    UpstreamTimeout { timeout: Duration },

    #[error("weather API request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("malformed weather API response: {0}")]
    MalformedResponse(String),

    #[error("invalid observation timestamp '{value}'")]
    InvalidTimestamp { value: String },

    #[error("failed to store sample: {0}")]
    StoreWrite(#[from] StoreError),
}

/// Persistence layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Store(StoreError::Sqlite(e))
    }
}
