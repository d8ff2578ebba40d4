use crate::core::model::DownloadId;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no stored download with id {0}")]
    NotFound(DownloadId),
}

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("{worker} binary not found")]
    BinaryNotFound { worker: &'static str },

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Starting a second process for an id that still has one is a caller bug.
    #[error("a worker is already running for download {0}")]
    AlreadyRunning(DownloadId),

    #[error("worker output pipe unavailable")]
    MissingPipe,
}

impl RunnerError {
    /// Whether this failure belongs to the download (and should put it in `error`)
    /// rather than to the scheduler's own bookkeeping.
    pub fn is_spawn_failure(&self) -> bool {
        !matches!(self, Self::AlreadyRunning(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Commands that do not apply to a record's current state. These never abort
/// the scheduler; they come back to the caller as [`Ack::Ignored`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("no download with that id")]
    UnknownId,
    #[error("download is not running")]
    NotDownloading,
    #[error("download is not paused")]
    NotPaused,
    #[error("only failed downloads can be retried")]
    NotRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Applied,
    Ignored(InvalidRequest),
}

impl Ack {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
