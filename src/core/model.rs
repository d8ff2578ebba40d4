use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub type DownloadId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Deleted,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    /// `completed` and `error` end a run; only `error` can leave again (retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown download status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The worker could not be started at all.
    Spawn,
    /// The worker ran and exited non-zero (or was killed by a signal).
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Worker directives fixed at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadOptions {
    pub audio_only: bool,
    pub audio_format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: Option<String>,
    pub options: DownloadOptions,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), format_id: None, options: DownloadOptions::default() }
    }
}

/// Last observed transfer metrics. Only meaningful while downloading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub speed_text: Option<String>,
    pub speed_value: Option<f64>,
    pub eta: Option<String>,
    pub total_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: DownloadId,
    pub url: String,
    pub format_id: Option<String>,
    pub options: DownloadOptions,
    pub status: DownloadStatus,
    pub progress: u8,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub file_path: Option<PathBuf>,
    pub error: Option<DownloadError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Position in the admission queue; reassigned whenever the record re-enters `queued`.
    #[serde(skip)]
    pub queue_ticket: i64,
}

impl Download {
    pub fn new(req: DownloadRequest, queue_ticket: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: req.url,
            format_id: req.format_id,
            options: req.options,
            status: DownloadStatus::Queued,
            progress: 0,
            metrics: Metrics::default(),
            file_path: None,
            error: None,
            created_at: now,
            updated_at: now,
            queue_ticket,
        }
    }

    pub fn apply(&mut self, patch: &DownloadPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(metrics) = &patch.metrics {
            self.metrics = metrics.clone();
        }
        if let Some(file_path) = &patch.file_path {
            self.file_path = file_path.clone();
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(ticket) = patch.queue_ticket {
            self.queue_ticket = ticket;
        }
        self.updated_at = patch.updated_at;
    }
}

/// A partial update of a [`Download`]. `None` leaves a field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone)]
pub struct DownloadPatch {
    pub status: Option<DownloadStatus>,
    pub progress: Option<u8>,
    pub metrics: Option<Metrics>,
    pub file_path: Option<Option<PathBuf>>,
    pub error: Option<Option<DownloadError>>,
    pub queue_ticket: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DownloadPatch {
    fn default() -> Self {
        Self {
            status: None,
            progress: None,
            metrics: None,
            file_path: None,
            error: None,
            queue_ticket: None,
            updated_at: Utc::now(),
        }
    }
}

impl DownloadPatch {
    pub fn status(status: DownloadStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn progress(progress: u8, metrics: Metrics) -> Self {
        Self { progress: Some(progress), metrics: Some(metrics), ..Default::default() }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn clear_metrics(mut self) -> Self {
        self.metrics = Some(Metrics::default());
        self
    }

    pub fn with_ticket(mut self, ticket: i64) -> Self {
        self.queue_ticket = Some(ticket);
        self
    }

    pub fn with_error(mut self, error: Option<DownloadError>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_file_path(mut self, path: Option<PathBuf>) -> Self {
        self.file_path = Some(path);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub concurrency: usize,
    /// KiB/s, 0 = unlimited.
    pub speed_limit: u64,
    pub download_directory: PathBuf,
    pub proxy: Option<String>,
    pub default_format: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let download_directory = dirs::download_dir()
            .map(|d| d.join("media-queue"))
            .unwrap_or_else(|| PathBuf::from("./downloads"));
        Self {
            concurrency: 2,
            speed_limit: 0,
            download_directory,
            proxy: None,
            default_format: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.proxy = self.proxy.filter(|p| !p.trim().is_empty());
        self.default_format = self.default_format.filter(|f| !f.trim().is_empty());
        self
    }
}
