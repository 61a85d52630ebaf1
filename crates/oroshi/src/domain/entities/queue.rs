use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
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
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown download status {other}")),
        }
    }
}

/// One pending or active download job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub manga_title: Option<String>,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub chapter_title: Option<String>,
    pub status: DownloadStatus,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_current: i64,
    pub progress_total: i64,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub manga_title: Option<String>,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub chapter_title: Option<String>,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub queue_id: i64,
    pub progress_current: i64,
    pub progress_total: i64,
}

/// Archival record of a queue item that reached a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: i64,
    pub queue_id: i64,
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub manga_title: Option<String>,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub chapter_title: Option<String>,
    pub status: DownloadStatus,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub progress_current: i64,
    pub progress_total: i64,
}
