use std::ops::DerefMut;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    domain::{
        entities::offline::{
            ExtensionUsage, MangaUsage, NewOfflineChapter, NewOfflineManga, OfflineChapter,
            OfflineManga, StaleChapter, StorageStats,
        },
        repositories::offline::{OfflineRepository, OfflineRepositoryError},
    },
    infrastructure::database::Pool,
};

use super::{from_millis, to_millis};

const MANGA_COLUMNS: &str = r#"
    id,
    extension_id,
    manga_id,
    manga_slug,
    download_path,
    downloaded_at,
    last_updated_at,
    total_size_bytes"#;

const CHAPTER_COLUMNS: &str = r#"
    id,
    offline_manga_id,
    chapter_id,
    chapter_number,
    chapter_title,
    folder_name,
    total_pages,
    downloaded_at,
    size_bytes"#;

fn map_offline_manga(row: &SqliteRow) -> OfflineManga {
    OfflineManga {
        id: row.get(0),
        extension_id: row.get(1),
        manga_id: row.get(2),
        manga_slug: row.get(3),
        download_path: row.get(4),
        downloaded_at: from_millis(row.get(5)),
        last_updated_at: from_millis(row.get(6)),
        total_size_bytes: row.get(7),
    }
}

fn map_offline_chapter(row: &SqliteRow) -> OfflineChapter {
    OfflineChapter {
        id: row.get(0),
        offline_manga_id: row.get(1),
        chapter_id: row.get(2),
        chapter_number: row.get(3),
        chapter_title: row.get(4),
        folder_name: row.get(5),
        total_pages: row.get(6),
        downloaded_at: from_millis(row.get(7)),
        size_bytes: row.get(8),
    }
}

#[derive(Clone)]
pub struct OfflineRepositoryImpl {
    pool: Pool,
}

impl OfflineRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl OfflineRepository for OfflineRepositoryImpl {
    async fn upsert_offline_manga(
        &self,
        manga: &NewOfflineManga,
    ) -> Result<OfflineManga, OfflineRepositoryError> {
        let now = to_millis(Utc::now());

        sqlx::query(
            r#"INSERT INTO offline_manga(
                extension_id,
                manga_id,
                manga_slug,
                download_path,
                downloaded_at,
                last_updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (extension_id, manga_id) DO UPDATE SET
                last_updated_at = excluded.last_updated_at"#,
        )
        .bind(&manga.extension_id)
        .bind(&manga.manga_id)
        .bind(&manga.manga_slug)
        .bind(&manga.download_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool as &SqlitePool)
        .await?;

        let row = sqlx::query(&format!(
            r#"SELECT {MANGA_COLUMNS} FROM offline_manga
            WHERE extension_id = ? AND manga_id = ?"#
        ))
        .bind(&manga.extension_id)
        .bind(&manga.manga_id)
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        Ok(map_offline_manga(&row))
    }

    async fn get_offline_manga(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<Option<OfflineManga>, OfflineRepositoryError> {
        let manga = sqlx::query(&format!(
            r#"SELECT {MANGA_COLUMNS} FROM offline_manga
            WHERE extension_id = ? AND manga_id = ?"#
        ))
        .bind(extension_id)
        .bind(manga_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_offline_manga(&row));

        Ok(manga)
    }

    async fn get_offline_manga_by_manga_id(
        &self,
        manga_id: &str,
    ) -> Result<Option<OfflineManga>, OfflineRepositoryError> {
        let manga = sqlx::query(&format!(
            r#"SELECT {MANGA_COLUMNS} FROM offline_manga
            WHERE manga_id = ?
            ORDER BY downloaded_at ASC
            LIMIT 1"#
        ))
        .bind(manga_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_offline_manga(&row));

        Ok(manga)
    }

    async fn get_all_offline_manga(&self) -> Result<Vec<OfflineManga>, OfflineRepositoryError> {
        let manga = sqlx::query(&format!(
            r#"SELECT {MANGA_COLUMNS} FROM offline_manga
            ORDER BY downloaded_at DESC"#
        ))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_offline_manga(&row))
        .collect();

        Ok(manga)
    }

    async fn update_manga_totals(
        &self,
        id: i64,
        total_size_bytes: i64,
        last_updated_at: DateTime<Utc>,
    ) -> Result<(), OfflineRepositoryError> {
        sqlx::query(
            r#"UPDATE offline_manga
            SET total_size_bytes = ?, last_updated_at = ?
            WHERE id = ?"#,
        )
        .bind(total_size_bytes)
        .bind(to_millis(last_updated_at))
        .bind(id)
        .execute(&self.pool as &SqlitePool)
        .await?;

        Ok(())
    }

    async fn upsert_offline_chapter(
        &self,
        chapter: &NewOfflineChapter,
    ) -> Result<OfflineChapter, OfflineRepositoryError> {
        sqlx::query(
            r#"INSERT INTO offline_chapter(
                offline_manga_id,
                chapter_id,
                chapter_number,
                chapter_title,
                folder_name,
                total_pages,
                downloaded_at,
                size_bytes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (offline_manga_id, chapter_id) DO UPDATE SET
                chapter_number = excluded.chapter_number,
                chapter_title = excluded.chapter_title,
                folder_name = excluded.folder_name,
                total_pages = excluded.total_pages,
                downloaded_at = excluded.downloaded_at,
                size_bytes = excluded.size_bytes"#,
        )
        .bind(chapter.offline_manga_id)
        .bind(&chapter.chapter_id)
        .bind(chapter.chapter_number)
        .bind(&chapter.chapter_title)
        .bind(&chapter.folder_name)
        .bind(chapter.total_pages)
        .bind(to_millis(Utc::now()))
        .bind(chapter.size_bytes)
        .execute(&self.pool as &SqlitePool)
        .await?;

        let row = sqlx::query(&format!(
            r#"SELECT {CHAPTER_COLUMNS} FROM offline_chapter
            WHERE offline_manga_id = ? AND chapter_id = ?"#
        ))
        .bind(chapter.offline_manga_id)
        .bind(&chapter.chapter_id)
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        Ok(map_offline_chapter(&row))
    }

    async fn get_offline_chapter(
        &self,
        offline_manga_id: i64,
        chapter_id: &str,
    ) -> Result<Option<OfflineChapter>, OfflineRepositoryError> {
        let chapter = sqlx::query(&format!(
            r#"SELECT {CHAPTER_COLUMNS} FROM offline_chapter
            WHERE offline_manga_id = ? AND chapter_id = ?"#
        ))
        .bind(offline_manga_id)
        .bind(chapter_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .map(|row| map_offline_chapter(&row));

        Ok(chapter)
    }

    async fn get_offline_chapters(
        &self,
        offline_manga_id: i64,
    ) -> Result<Vec<OfflineChapter>, OfflineRepositoryError> {
        let chapters = sqlx::query(&format!(
            r#"SELECT {CHAPTER_COLUMNS} FROM offline_chapter
            WHERE offline_manga_id = ?
            ORDER BY chapter_number ASC, downloaded_at ASC"#
        ))
        .bind(offline_manga_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_par_iter()
        .map(|row| map_offline_chapter(&row))
        .collect();

        Ok(chapters)
    }

    async fn count_offline_chapters(
        &self,
        offline_manga_id: i64,
    ) -> Result<i64, OfflineRepositoryError> {
        let row = sqlx::query("SELECT COUNT(1) FROM offline_chapter WHERE offline_manga_id = ?")
            .bind(offline_manga_id)
            .fetch_one(&self.pool as &SqlitePool)
            .await?;

        Ok(row.get(0))
    }

    async fn delete_offline_chapter(&self, id: i64) -> Result<bool, OfflineRepositoryError> {
        let result = sqlx::query("DELETE FROM offline_chapter WHERE id = ?")
            .bind(id)
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_offline_manga(&self, id: i64) -> Result<bool, OfflineRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM offline_chapter WHERE offline_manga_id = ?")
            .bind(id)
            .execute(tx.deref_mut())
            .await?;

        let result = sqlx::query("DELETE FROM offline_manga WHERE id = ?")
            .bind(id)
            .execute(tx.deref_mut())
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_chapters_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleChapter>, OfflineRepositoryError> {
        let stale = sqlx::query(
            r#"SELECT
                m.download_path,
                c.id,
                c.offline_manga_id,
                c.chapter_id,
                c.chapter_number,
                c.chapter_title,
                c.folder_name,
                c.total_pages,
                c.downloaded_at,
                c.size_bytes
            FROM offline_chapter c
            JOIN offline_manga m ON m.id = c.offline_manga_id
            WHERE c.downloaded_at < ?"#,
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(|row| StaleChapter {
            download_path: row.get(0),
            chapter: OfflineChapter {
                id: row.get(1),
                offline_manga_id: row.get(2),
                chapter_id: row.get(3),
                chapter_number: row.get(4),
                chapter_title: row.get(5),
                folder_name: row.get(6),
                total_pages: row.get(7),
                downloaded_at: from_millis(row.get(8)),
                size_bytes: row.get(9),
            },
        })
        .collect();

        Ok(stale)
    }

    async fn get_storage_stats(&self, top: i64) -> Result<StorageStats, OfflineRepositoryError> {
        let totals = sqlx::query(
            "SELECT COALESCE(SUM(total_size_bytes), 0), COUNT(1) FROM offline_manga",
        )
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        let chapter_totals = sqlx::query(
            "SELECT COUNT(1), COALESCE(SUM(total_pages), 0) FROM offline_chapter",
        )
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        let by_extension = sqlx::query(
            r#"SELECT extension_id, COALESCE(SUM(total_size_bytes), 0), COUNT(1)
            FROM offline_manga
            GROUP BY extension_id
            ORDER BY 2 DESC"#,
        )
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(|row| ExtensionUsage {
            extension_id: row.get(0),
            size_bytes: row.get(1),
            manga_count: row.get(2),
        })
        .collect();

        let top_manga = sqlx::query(
            r#"SELECT m.extension_id, m.manga_id, m.manga_slug, m.total_size_bytes, COUNT(c.id)
            FROM offline_manga m
            LEFT JOIN offline_chapter c ON c.offline_manga_id = m.id
            GROUP BY m.id
            ORDER BY m.total_size_bytes DESC
            LIMIT ?"#,
        )
        .bind(top)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(|row| MangaUsage {
            extension_id: row.get(0),
            manga_id: row.get(1),
            manga_slug: row.get(2),
            size_bytes: row.get(3),
            chapter_count: row.get(4),
        })
        .collect();

        Ok(StorageStats {
            total_size_bytes: totals.get(0),
            manga_count: totals.get(1),
            chapter_count: chapter_totals.get(0),
            page_count: chapter_totals.get(1),
            by_extension,
            top_manga,
        })
    }

    async fn clear_all_offline_data(&self) -> Result<(), OfflineRepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM offline_chapter")
            .execute(tx.deref_mut())
            .await?;

        sqlx::query("DELETE FROM offline_manga")
            .execute(tx.deref_mut())
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
