use std::ops::DerefMut;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    domain::{
        entities::queue::{
            DownloadStatus, HistoryItem, NewQueueItem, ProgressUpdate, QueueItem,
        },
        repositories::queue::{QueueRepository, QueueRepositoryError},
    },
    infrastructure::database::Pool,
};

use super::{from_millis, from_millis_opt, to_millis};

const QUEUE_COLUMNS: &str = r#"
    id,
    extension_id,
    manga_id,
    manga_slug,
    manga_title,
    chapter_id,
    chapter_number,
    chapter_title,
    status,
    priority,
    queued_at,
    started_at,
    completed_at,
    last_progress_at,
    error_message,
    progress_current,
    progress_total"#;

const HISTORY_COLUMNS: &str = r#"
    id,
    queue_id,
    extension_id,
    manga_id,
    manga_slug,
    manga_title,
    chapter_id,
    chapter_number,
    chapter_title,
    status,
    priority,
    queued_at,
    started_at,
    completed_at,
    error_message,
    progress_current,
    progress_total"#;

fn map_queue_item(row: &SqliteRow) -> QueueItem {
    QueueItem {
        id: row.get(0),
        extension_id: row.get(1),
        manga_id: row.get(2),
        manga_slug: row.get(3),
        manga_title: row.get(4),
        chapter_id: row.get(5),
        chapter_number: row.get(6),
        chapter_title: row.get(7),
        status: DownloadStatus::from_str(&row.get::<String, _>(8))
            .unwrap_or(DownloadStatus::Queued),
        priority: row.get(9),
        queued_at: from_millis(row.get(10)),
        started_at: from_millis_opt(row.get(11)),
        completed_at: from_millis_opt(row.get(12)),
        last_progress_at: from_millis_opt(row.get(13)),
        error_message: row.get(14),
        progress_current: row.get(15),
        progress_total: row.get(16),
    }
}

fn map_history_item(row: &SqliteRow) -> HistoryItem {
    HistoryItem {
        id: row.get(0),
        queue_id: row.get(1),
        extension_id: row.get(2),
        manga_id: row.get(3),
        manga_slug: row.get(4),
        manga_title: row.get(5),
        chapter_id: row.get(6),
        chapter_number: row.get(7),
        chapter_title: row.get(8),
        status: DownloadStatus::from_str(&row.get::<String, _>(9))
            .unwrap_or(DownloadStatus::Failed),
        priority: row.get(10),
        queued_at: from_millis(row.get(11)),
        started_at: from_millis_opt(row.get(12)),
        completed_at: from_millis(row.get(13)),
        error_message: row.get(14),
        progress_current: row.get(15),
        progress_total: row.get(16),
    }
}

#[derive(Clone)]
pub struct QueueRepositoryImpl {
    pool: Pool,
}

impl QueueRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl QueueRepository for QueueRepositoryImpl {
    async fn queue_download(&self, item: &NewQueueItem) -> Result<QueueItem, QueueRepositoryError> {
        sqlx::query(
            r#"INSERT INTO download_queue(
                extension_id,
                manga_id,
                manga_slug,
                manga_title,
                chapter_id,
                chapter_number,
                chapter_title,
                status,
                priority,
                queued_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?)
            ON CONFLICT (extension_id, manga_id, chapter_id) DO UPDATE SET
                manga_slug = excluded.manga_slug,
                manga_title = excluded.manga_title,
                chapter_number = excluded.chapter_number,
                chapter_title = excluded.chapter_title,
                priority = excluded.priority,
                queued_at = excluded.queued_at,
                status = CASE
                    WHEN download_queue.status = 'downloading' THEN 'downloading'
                    ELSE 'queued'
                END,
                started_at = CASE
                    WHEN download_queue.status = 'downloading' THEN download_queue.started_at
                    ELSE NULL
                END,
                completed_at = NULL,
                last_progress_at = CASE
                    WHEN download_queue.status = 'downloading' THEN download_queue.last_progress_at
                    ELSE NULL
                END,
                error_message = NULL,
                progress_current = CASE
                    WHEN download_queue.status = 'downloading' THEN download_queue.progress_current
                    ELSE 0
                END,
                progress_total = CASE
                    WHEN download_queue.status = 'downloading' THEN download_queue.progress_total
                    ELSE 0
                END"#,
        )
        .bind(&item.extension_id)
        .bind(&item.manga_id)
        .bind(&item.manga_slug)
        .bind(&item.manga_title)
        .bind(&item.chapter_id)
        .bind(item.chapter_number)
        .bind(&item.chapter_title)
        .bind(item.priority)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool as &SqlitePool)
        .await?;

        let row = self
            .get_queue_item_by_triple(&item.extension_id, &item.manga_id, &item.chapter_id)
            .await?
            .ok_or(QueueRepositoryError::NotFound(0))?;

        Ok(row)
    }

    async fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>, QueueRepositoryError> {
        let item = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM download_queue WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_queue_item(&row));

        Ok(item)
    }

    async fn get_queue_item_by_triple(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<Option<QueueItem>, QueueRepositoryError> {
        let item = sqlx::query(&format!(
            r#"SELECT {QUEUE_COLUMNS} FROM download_queue
            WHERE extension_id = ? AND manga_id = ? AND chapter_id = ?"#
        ))
        .bind(extension_id)
        .bind(manga_id)
        .bind(chapter_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_queue_item(&row));

        Ok(item)
    }

    async fn get_next_queued_download(&self) -> Result<Option<QueueItem>, QueueRepositoryError> {
        let item = sqlx::query(&format!(
            r#"SELECT {QUEUE_COLUMNS} FROM download_queue
            WHERE status = 'queued'
            ORDER BY priority DESC, queued_at ASC, id ASC
            LIMIT 1"#
        ))
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_queue_item(&row));

        Ok(item)
    }

    async fn get_queued_downloads(&self) -> Result<Vec<QueueItem>, QueueRepositoryError> {
        let items = sqlx::query(&format!(
            r#"SELECT {QUEUE_COLUMNS} FROM download_queue
            ORDER BY priority DESC, queued_at ASC, id ASC"#
        ))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_queue_item(&row))
        .collect();

        Ok(items)
    }

    async fn get_active_downloads(&self) -> Result<Vec<QueueItem>, QueueRepositoryError> {
        let items = sqlx::query(&format!(
            r#"SELECT {QUEUE_COLUMNS} FROM download_queue
            WHERE status = 'downloading'
            ORDER BY started_at ASC"#
        ))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_queue_item(&row))
        .collect();

        Ok(items)
    }

    async fn update_queue_status(
        &self,
        id: i64,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<(), QueueRepositoryError> {
        let now = to_millis(Utc::now());

        let result = sqlx::query(
            r#"UPDATE download_queue SET
                status = ?2,
                error_message = COALESCE(?3, error_message),
                started_at = CASE
                    WHEN ?2 = 'downloading' AND started_at IS NULL THEN ?4
                    ELSE started_at
                END,
                last_progress_at = CASE
                    WHEN ?2 = 'downloading' AND last_progress_at IS NULL THEN ?4
                    ELSE last_progress_at
                END,
                completed_at = CASE
                    WHEN ?2 IN ('completed', 'failed') AND completed_at IS NULL THEN ?4
                    ELSE completed_at
                END
            WHERE id = ?1"#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(now)
        .execute(&self.pool as &SqlitePool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueRepositoryError::NotFound(id));
        }

        Ok(())
    }

    async fn update_queue_progress_batch(
        &self,
        updates: &[ProgressUpdate],
    ) -> Result<(), QueueRepositoryError> {
        if updates.is_empty() {
            return Ok(());
        }

        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"UPDATE download_queue
                SET progress_current = ?, progress_total = ?, last_progress_at = ?
                WHERE id = ?"#,
            )
            .bind(update.progress_current)
            .bind(update.progress_total)
            .bind(now)
            .bind(update.queue_id)
            .execute(tx.deref_mut())
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn delete_queue_item(&self, id: i64) -> Result<bool, QueueRepositoryError> {
        let result = sqlx::query("DELETE FROM download_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn move_queue_item_to_history(&self, id: i64) -> Result<i64, QueueRepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM download_queue WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(tx.deref_mut())
        .await?
        .ok_or(QueueRepositoryError::NotFound(id))?;

        let item = map_queue_item(&row);
        let completed_at = item
            .completed_at
            .ok_or(QueueRepositoryError::NotTerminal(id))?;

        let inserted = sqlx::query(
            r#"INSERT INTO download_history(
                queue_id,
                extension_id,
                manga_id,
                manga_slug,
                manga_title,
                chapter_id,
                chapter_number,
                chapter_title,
                status,
                priority,
                queued_at,
                started_at,
                completed_at,
                error_message,
                progress_current,
                progress_total
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(item.id)
        .bind(&item.extension_id)
        .bind(&item.manga_id)
        .bind(&item.manga_slug)
        .bind(&item.manga_title)
        .bind(&item.chapter_id)
        .bind(item.chapter_number)
        .bind(&item.chapter_title)
        .bind(item.status.as_str())
        .bind(item.priority)
        .bind(to_millis(item.queued_at))
        .bind(item.started_at.map(to_millis))
        .bind(to_millis(completed_at))
        .bind(&item.error_message)
        .bind(item.progress_current)
        .bind(item.progress_total)
        .execute(tx.deref_mut())
        .await?;

        sqlx::query("DELETE FROM download_queue WHERE id = ?")
            .bind(id)
            .execute(tx.deref_mut())
            .await?;

        tx.commit().await?;

        Ok(inserted.last_insert_rowid())
    }

    async fn requeue(&self, id: i64) -> Result<(), QueueRepositoryError> {
        let result = sqlx::query(
            r#"UPDATE download_queue SET
                status = 'queued',
                queued_at = ?,
                started_at = NULL,
                completed_at = NULL,
                last_progress_at = NULL,
                error_message = NULL,
                progress_current = 0,
                progress_total = 0
            WHERE id = ?"#,
        )
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool as &SqlitePool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueRepositoryError::NotFound(id));
        }

        Ok(())
    }

    async fn get_stalled_downloads(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueRepositoryError> {
        let items = sqlx::query(&format!(
            r#"SELECT {QUEUE_COLUMNS} FROM download_queue
            WHERE status = 'downloading'
              AND COALESCE(last_progress_at, started_at, queued_at) < ?"#
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_queue_item(&row))
        .collect();

        Ok(items)
    }

    async fn pause_all_downloads(&self) -> Result<u64, QueueRepositoryError> {
        let result = sqlx::query("UPDATE download_queue SET status = 'paused' WHERE status = 'queued'")
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn resume_all_downloads(&self) -> Result<u64, QueueRepositoryError> {
        let result = sqlx::query("UPDATE download_queue SET status = 'queued' WHERE status = 'paused'")
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn clear_queue(&self) -> Result<u64, QueueRepositoryError> {
        let result = sqlx::query("DELETE FROM download_queue")
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get_download_history(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<HistoryItem>, QueueRepositoryError> {
        let items = sqlx::query(&format!(
            r#"SELECT {HISTORY_COLUMNS} FROM download_history
            ORDER BY completed_at DESC, id DESC
            LIMIT ?"#
        ))
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_history_item(&row))
        .collect();

        Ok(items)
    }

    async fn get_history_by_queue_id(
        &self,
        queue_id: i64,
    ) -> Result<Option<HistoryItem>, QueueRepositoryError> {
        let item = sqlx::query(&format!(
            r#"SELECT {HISTORY_COLUMNS} FROM download_history
            WHERE queue_id = ?
            ORDER BY completed_at DESC, id DESC
            LIMIT 1"#
        ))
        .bind(queue_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_history_item(&row));

        Ok(item)
    }

    async fn delete_history_item(&self, id: i64) -> Result<bool, QueueRepositoryError> {
        let result = sqlx::query("DELETE FROM download_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_download_history(&self) -> Result<u64, QueueRepositoryError> {
        let result = sqlx::query("DELETE FROM download_history")
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected())
    }
}
