use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::entities::offline::{
    NewOfflineChapter, NewOfflineManga, OfflineChapter, OfflineManga, StaleChapter, StorageStats,
};

#[derive(Debug, Error)]
pub enum OfflineRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[async_trait]
pub trait OfflineRepository: Clone + Send + Sync {
    /// Creates the manga row on first chapter write; an existing row keeps
    /// its `downloaded_at` and location.
    async fn upsert_offline_manga(
        &self,
        manga: &NewOfflineManga,
    ) -> Result<OfflineManga, OfflineRepositoryError>;

    async fn get_offline_manga(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<Option<OfflineManga>, OfflineRepositoryError>;

    async fn get_offline_manga_by_manga_id(
        &self,
        manga_id: &str,
    ) -> Result<Option<OfflineManga>, OfflineRepositoryError>;

    async fn get_all_offline_manga(&self) -> Result<Vec<OfflineManga>, OfflineRepositoryError>;

    async fn update_manga_totals(
        &self,
        id: i64,
        total_size_bytes: i64,
        last_updated_at: DateTime<Utc>,
    ) -> Result<(), OfflineRepositoryError>;

    async fn upsert_offline_chapter(
        &self,
        chapter: &NewOfflineChapter,
    ) -> Result<OfflineChapter, OfflineRepositoryError>;

    async fn get_offline_chapter(
        &self,
        offline_manga_id: i64,
        chapter_id: &str,
    ) -> Result<Option<OfflineChapter>, OfflineRepositoryError>;

    async fn get_offline_chapters(
        &self,
        offline_manga_id: i64,
    ) -> Result<Vec<OfflineChapter>, OfflineRepositoryError>;

    async fn count_offline_chapters(
        &self,
        offline_manga_id: i64,
    ) -> Result<i64, OfflineRepositoryError>;

    async fn delete_offline_chapter(&self, id: i64) -> Result<bool, OfflineRepositoryError>;

    /// Cascades to the chapter rows.
    async fn delete_offline_manga(&self, id: i64) -> Result<bool, OfflineRepositoryError>;

    async fn get_chapters_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleChapter>, OfflineRepositoryError>;

    async fn get_storage_stats(&self, top: i64) -> Result<StorageStats, OfflineRepositoryError>;

    async fn clear_all_offline_data(&self) -> Result<(), OfflineRepositoryError>;
}
