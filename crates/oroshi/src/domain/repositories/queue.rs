use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::entities::queue::{
    DownloadStatus, HistoryItem, NewQueueItem, ProgressUpdate, QueueItem,
};

#[derive(Debug, Error)]
pub enum QueueRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("queue item {0} not found")]
    NotFound(i64),
    #[error("queue item {0} has not reached a terminal state")]
    NotTerminal(i64),
}

#[async_trait]
pub trait QueueRepository: Clone + Send + Sync {
    /// Upsert keyed by `(extension_id, manga_id, chapter_id)`; a conflicting
    /// non-terminal row is refreshed in place, never duplicated.
    async fn queue_download(&self, item: &NewQueueItem) -> Result<QueueItem, QueueRepositoryError>;

    async fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>, QueueRepositoryError>;

    async fn get_queue_item_by_triple(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<Option<QueueItem>, QueueRepositoryError>;

    /// Highest priority first, ties broken by earliest `queued_at`.
    async fn get_next_queued_download(&self) -> Result<Option<QueueItem>, QueueRepositoryError>;

    async fn get_queued_downloads(&self) -> Result<Vec<QueueItem>, QueueRepositoryError>;

    async fn get_active_downloads(&self) -> Result<Vec<QueueItem>, QueueRepositoryError>;

    /// Sets `started_at` exactly once on the first transition into
    /// `downloading` and `completed_at` exactly once on the first transition
    /// into a terminal state; repeated calls are idempotent.
    async fn update_queue_status(
        &self,
        id: i64,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<(), QueueRepositoryError>;

    /// Applies all updates in a single transaction.
    async fn update_queue_progress_batch(
        &self,
        updates: &[ProgressUpdate],
    ) -> Result<(), QueueRepositoryError>;

    async fn delete_queue_item(&self, id: i64) -> Result<bool, QueueRepositoryError>;

    /// Requires `completed_at` to be set; copies then deletes in one
    /// transaction so an id is never present in both tables.
    async fn move_queue_item_to_history(&self, id: i64) -> Result<i64, QueueRepositoryError>;

    /// Puts a row back to `queued`, clearing timestamps, progress and error.
    async fn requeue(&self, id: i64) -> Result<(), QueueRepositoryError>;

    /// `downloading` rows whose last progress advance is older than `cutoff`.
    async fn get_stalled_downloads(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueRepositoryError>;

    async fn pause_all_downloads(&self) -> Result<u64, QueueRepositoryError>;

    async fn resume_all_downloads(&self) -> Result<u64, QueueRepositoryError>;

    async fn clear_queue(&self) -> Result<u64, QueueRepositoryError>;

    async fn get_download_history(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<HistoryItem>, QueueRepositoryError>;

    /// Most recent history row recorded for a queue id.
    async fn get_history_by_queue_id(
        &self,
        queue_id: i64,
    ) -> Result<Option<HistoryItem>, QueueRepositoryError>;

    async fn delete_history_item(&self, id: i64) -> Result<bool, QueueRepositoryError>;

    async fn clear_download_history(&self) -> Result<u64, QueueRepositoryError>;
}
