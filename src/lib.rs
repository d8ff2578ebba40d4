//! Download queue for external media workers (yt-dlp): bounded concurrency,
//! a persisted per-download state machine, and an event stream for UIs.

pub mod core;
pub mod plugins;

pub use crate::core::engine::{Engine, EngineConfig};
pub use crate::core::error::{Ack, InvalidRequest, QueueError};
pub use crate::core::events::QueueEvent;
pub use crate::core::model::{Download, DownloadId, DownloadRequest, DownloadStatus, Settings};
