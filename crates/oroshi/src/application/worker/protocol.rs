use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    domain::entities::{
        archive::{ConflictPolicy, ExportReport, ImportReport},
        metrics::MetricsSnapshot,
        offline::{ChapterValidation, OfflineChapter, OfflineManga, StorageStats},
        queue::{HistoryItem, QueueItem},
    },
    infrastructure::{config::WorkerOptions, local::MangaMetadata},
};

/// First message on the channel; everything else is rejected until the worker
/// has seen it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitOptions {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub download_dir: PathBuf,
    pub options: WorkerOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerMessage {
    Initialize {
        request_id: u64,
        options: Box<InitOptions>,
    },
    Request(WorkerRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: u64,
    pub command: WorkerCommand,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueChapterOptions {
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMangaOptions {
    #[serde(default)]
    pub priority: i64,
    /// Restrict the expansion to these chapters; `None` means all of them.
    #[serde(default)]
    pub chapter_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerCommand {
    Start,
    Stop,
    Ping,
    IsActive,
    GetActiveDownloads,
    QueueChapter {
        extension_id: String,
        manga_id: String,
        chapter_id: String,
        #[serde(default)]
        options: QueueChapterOptions,
    },
    QueueManga {
        extension_id: String,
        manga_id: String,
        #[serde(default)]
        options: QueueMangaOptions,
    },
    CancelDownload {
        queue_id: i64,
    },
    RetryDownload {
        queue_id: i64,
    },
    RetryFrozenDownloads,
    GetQueuedDownloads,
    GetDownloadProgress {
        queue_id: i64,
    },
    GetStorageStats,
    GetDownloadedManga,
    GetMangaMetadata {
        extension_id: String,
        manga_id: String,
    },
    GetDownloadedChapters {
        extension_id: String,
        manga_id: String,
    },
    GetChapterPages {
        extension_id: String,
        manga_id: String,
        chapter_id: String,
    },
    IsChapterDownloaded {
        extension_id: String,
        manga_id: String,
        chapter_id: String,
    },
    DeleteChapter {
        extension_id: String,
        manga_id: String,
        chapter_id: String,
    },
    DeleteManga {
        extension_id: String,
        manga_id: String,
    },
    NukeOfflineData,
    GetDownloadHistory {
        #[serde(default)]
        limit: Option<i64>,
    },
    DeleteHistoryItem {
        history_id: i64,
    },
    ClearDownloadHistory,
    ValidateMangaChapterCount {
        extension_id: String,
        manga_id: String,
    },
    StartBackgroundSync {
        ttl_ms: u64,
        concurrency: usize,
        delay_ms: u64,
    },
    GetPagePath {
        manga_id: String,
        chapter_id: String,
        filename: String,
    },
    PauseDownloads,
    ResumeDownloads,
    ExportManga {
        extension_id: String,
        manga_id: String,
        #[serde(default)]
        chapter_ids: Option<Vec<String>>,
        destination: PathBuf,
    },
    ImportArchive {
        archive_path: PathBuf,
        conflict_resolution: ConflictPolicy,
    },
    GetMetrics,
    ResetMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    Ack,
    Pong,
    Active(bool),
    Queued(QueueItem),
    QueuedMany(Vec<QueueItem>),
    QueueItems(Vec<QueueItem>),
    Progress {
        progress_current: i64,
        progress_total: i64,
    },
    StorageStats(StorageStats),
    MangaList(Vec<OfflineManga>),
    MangaMetadata(Box<MangaMetadata>),
    Chapters(Vec<OfflineChapter>),
    Pages(Vec<String>),
    Flag(bool),
    RetriedIds(Vec<i64>),
    History(Vec<HistoryItem>),
    Count(u64),
    Validation(ChapterValidation),
    PagePath(String),
    Export(ExportReport),
    Import(ImportReport),
    Metrics(MetricsSnapshot),
}

/// Error taxonomy carried across the worker boundary; each variant maps to a
/// distinct caller-visible failure class.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum WorkerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {errors:?}")]
    Validation {
        errors: Vec<String>,
        warnings: Vec<String>,
    },
    #[error("worker unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::domain::services::downloads::DownloadError> for WorkerError {
    fn from(e: crate::domain::services::downloads::DownloadError) -> Self {
        use crate::domain::repositories::queue::QueueRepositoryError;
        use crate::domain::services::downloads::DownloadError;

        match e {
            DownloadError::NotFound(message) => WorkerError::NotFound(message),
            DownloadError::Conflict(message) => WorkerError::Conflict(message),
            DownloadError::QueueRepository(QueueRepositoryError::NotFound(id)) => {
                WorkerError::NotFound(format!("queue item {id}"))
            }
            DownloadError::QueueRepository(QueueRepositoryError::NotTerminal(id)) => {
                WorkerError::Conflict(format!("queue item {id} has not reached a terminal state"))
            }
            other => WorkerError::Internal(other.to_string()),
        }
    }
}

impl From<crate::domain::services::archive::ArchiveError> for WorkerError {
    fn from(e: crate::domain::services::archive::ArchiveError) -> Self {
        use crate::domain::services::archive::ArchiveError;

        match e {
            ArchiveError::NotFound(message) => WorkerError::NotFound(message),
            ArchiveError::Validation { errors, warnings } => {
                WorkerError::Validation { errors, warnings }
            }
            other => WorkerError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReply {
    pub request_id: u64,
    pub result: Result<CommandResult, WorkerError>,
}

/// Unsolicited worker-to-host notifications, re-broadcast by the host to its
/// own subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerEvent {
    DownloadQueued {
        queue_id: i64,
        extension_id: String,
        manga_id: String,
        chapter_id: String,
        manga_title: Option<String>,
        chapter_title: Option<String>,
    },
    DownloadStarted {
        queue_id: i64,
    },
    DownloadProgress {
        queue_id: i64,
        progress_current: i64,
        progress_total: i64,
    },
    DownloadCompleted {
        queue_id: i64,
    },
    DownloadFailed {
        queue_id: i64,
        error: String,
    },
    ChapterDeleted {
        extension_id: String,
        manga_id: String,
        chapter_id: String,
    },
    MangaDeleted {
        extension_id: String,
        manga_id: String,
    },
    FatalError {
        message: String,
    },
}

/// Wire encoding for the protocol; messages stay process-portable even though
/// the worker currently runs in an in-process task.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrips_through_wire_encoding() {
        let message = WorkerMessage::Request(WorkerRequest {
            request_id: 7,
            command: WorkerCommand::QueueChapter {
                extension_id: "mockmanga".to_string(),
                manga_id: "m1".to_string(),
                chapter_id: "c1".to_string(),
                options: QueueChapterOptions { priority: 5 },
            },
        });

        let bytes = encode(&message).unwrap();
        let decoded: WorkerMessage = decode(&bytes).unwrap();

        match decoded {
            WorkerMessage::Request(req) => {
                assert_eq!(req.request_id, 7);
                match req.command {
                    WorkerCommand::QueueChapter { options, .. } => {
                        assert_eq!(options.priority, 5)
                    }
                    _ => panic!("wrong command"),
                }
            }
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn command_names_follow_the_wire_convention() {
        let json = serde_json::to_string(&WorkerCommand::RetryFrozenDownloads).unwrap();
        assert!(json.contains("retry-frozen-downloads"));

        let json = serde_json::to_string(&WorkerEvent::DownloadProgress {
            queue_id: 1,
            progress_current: 3,
            progress_total: 10,
        })
        .unwrap();
        assert!(json.contains("download-progress"));
    }
}
