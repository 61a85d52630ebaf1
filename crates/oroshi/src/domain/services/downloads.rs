use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;

use oroshi_lib::prelude::{ChapterInfo, MangaDetails};

use crate::{
    application::worker::{
        downloads::{Command as DownloadCommand, DownloadSender},
        protocol::{QueueChapterOptions, QueueMangaOptions, WorkerEvent},
    },
    domain::{
        entities::{
            offline::{
                ChapterValidation, NewOfflineChapter, NewOfflineManga, OfflineChapter,
                OfflineManga, StorageStats,
            },
            queue::{DownloadStatus, HistoryItem, NewQueueItem, ProgressUpdate, QueueItem},
        },
        repositories::{
            offline::{OfflineRepository, OfflineRepositoryError},
            queue::{QueueRepository, QueueRepositoryError},
        },
    },
    infrastructure::{extension::ExtensionManager, local},
};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("repository error: {0}")]
    QueueRepository(#[from] QueueRepositoryError),
    #[error("repository error: {0}")]
    OfflineRepository(#[from] OfflineRepositoryError),
    #[error("source error: {0}")]
    Source(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the execution engine hands back after writing a chapter to disk; the
/// service turns it into rows.
#[derive(Debug, Clone)]
pub struct CompletedChapter {
    pub folder_name: String,
    pub total_pages: i64,
    pub size_bytes: i64,
}

/// Coordination layer over the queue and content stores: expands manga jobs,
/// derives display names, owns every row write the engine needs, and emits
/// lifecycle events.
#[derive(Clone)]
pub struct DownloadService<Q, O>
where
    Q: QueueRepository,
    O: OfflineRepository,
{
    queue_repo: Q,
    offline_repo: O,
    extensions: ExtensionManager,
    download_dir: PathBuf,
    stall_window: Duration,
    events: broadcast::Sender<WorkerEvent>,
    download_tx: DownloadSender,
}

impl<Q, O> DownloadService<Q, O>
where
    Q: QueueRepository,
    O: OfflineRepository,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: AsRef<Path>>(
        queue_repo: Q,
        offline_repo: O,
        extensions: ExtensionManager,
        download_dir: P,
        stall_window: Duration,
        events: broadcast::Sender<WorkerEvent>,
        download_tx: DownloadSender,
    ) -> Self {
        Self {
            queue_repo,
            offline_repo,
            extensions,
            download_dir: PathBuf::new().join(download_dir),
            stall_window,
            events,
            download_tx,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn extensions(&self) -> &ExtensionManager {
        &self.extensions
    }

    fn emit(&self, event: WorkerEvent) {
        // fire and forget; no subscribers is fine
        let _ = self.events.send(event);
    }

    fn nudge(&self) {
        let _ = self.download_tx.send(DownloadCommand::Process);
    }

    async fn enqueue(
        &self,
        extension_id: &str,
        manga_id: &str,
        details: &MangaDetails,
        chapter: &ChapterInfo,
        priority: i64,
    ) -> Result<QueueItem, DownloadError> {
        let item = self
            .queue_repo
            .queue_download(&NewQueueItem {
                extension_id: extension_id.to_string(),
                manga_id: manga_id.to_string(),
                manga_slug: local::sanitize_name(&details.title),
                manga_title: Some(details.title.clone()),
                chapter_id: chapter.id.clone(),
                chapter_number: chapter.number,
                chapter_title: chapter.title.clone(),
                priority,
            })
            .await?;

        self.emit(WorkerEvent::DownloadQueued {
            queue_id: item.id,
            extension_id: item.extension_id.clone(),
            manga_id: item.manga_id.clone(),
            chapter_id: item.chapter_id.clone(),
            manga_title: item.manga_title.clone(),
            chapter_title: item.chapter_title.clone(),
        });

        Ok(item)
    }

    pub async fn queue_chapter(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
        options: QueueChapterOptions,
    ) -> Result<QueueItem, DownloadError> {
        let details = self
            .extensions
            .fetch_manga_details(extension_id, manga_id)
            .await?;
        let chapters = self
            .extensions
            .fetch_chapter_list(extension_id, manga_id)
            .await?;

        let chapter = chapters
            .into_iter()
            .find(|c| c.id == chapter_id)
            .ok_or_else(|| DownloadError::NotFound(format!("chapter {chapter_id}")))?;

        let item = self
            .enqueue(extension_id, manga_id, &details, &chapter, options.priority)
            .await?;

        self.nudge();

        Ok(item)
    }

    /// Expands a whole-manga request into one queue item per chapter,
    /// skipping chapters that are already on disk.
    pub async fn queue_manga(
        &self,
        extension_id: &str,
        manga_id: &str,
        options: QueueMangaOptions,
    ) -> Result<Vec<QueueItem>, DownloadError> {
        let details = self
            .extensions
            .fetch_manga_details(extension_id, manga_id)
            .await?;
        let chapters = self
            .extensions
            .fetch_chapter_list(extension_id, manga_id)
            .await?;

        let offline = self
            .offline_repo
            .get_offline_manga(extension_id, manga_id)
            .await?;

        let mut queued = vec![];
        for chapter in chapters {
            if let Some(filter) = &options.chapter_ids {
                if !filter.contains(&chapter.id) {
                    continue;
                }
            }

            if let Some(offline) = &offline {
                let downloaded = self
                    .offline_repo
                    .get_offline_chapter(offline.id, &chapter.id)
                    .await?;
                if downloaded.is_some() {
                    debug!("chapter {} already downloaded, skipping", chapter.id);
                    continue;
                }
            }

            let item = self
                .enqueue(extension_id, manga_id, &details, &chapter, options.priority)
                .await?;
            queued.push(item);
        }

        if !queued.is_empty() {
            self.nudge();
        }

        Ok(queued)
    }

    /// A queued or paused job is removed outright; a job already in flight
    /// cannot be safely aborted mid-page.
    pub async fn cancel_download(&self, queue_id: i64) -> Result<(), DownloadError> {
        let item = self
            .queue_repo
            .get_queue_item(queue_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("queue item {queue_id}")))?;

        if item.status == DownloadStatus::Downloading {
            return Err(DownloadError::Conflict(format!(
                "queue item {queue_id} is downloading and cannot be cancelled"
            )));
        }

        self.queue_repo.delete_queue_item(queue_id).await?;

        Ok(())
    }

    /// Retries a failed or stuck job; terminal jobs that already moved to
    /// history are re-queued from their history record.
    pub async fn retry_download(&self, queue_id: i64) -> Result<QueueItem, DownloadError> {
        if let Some(item) = self.queue_repo.get_queue_item(queue_id).await? {
            return match item.status {
                DownloadStatus::Downloading | DownloadStatus::Failed => {
                    self.queue_repo.requeue(queue_id).await?;
                    let item = self
                        .queue_repo
                        .get_queue_item(queue_id)
                        .await?
                        .ok_or_else(|| DownloadError::NotFound(format!("queue item {queue_id}")))?;

                    self.emit(WorkerEvent::DownloadQueued {
                        queue_id: item.id,
                        extension_id: item.extension_id.clone(),
                        manga_id: item.manga_id.clone(),
                        chapter_id: item.chapter_id.clone(),
                        manga_title: item.manga_title.clone(),
                        chapter_title: item.chapter_title.clone(),
                    });
                    self.nudge();

                    Ok(item)
                }
                _ => Err(DownloadError::Conflict(format!(
                    "queue item {queue_id} is {} and cannot be retried",
                    item.status
                ))),
            };
        }

        let history = self
            .queue_repo
            .get_history_by_queue_id(queue_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("queue item {queue_id}")))?;

        let item = self
            .queue_repo
            .queue_download(&NewQueueItem {
                extension_id: history.extension_id,
                manga_id: history.manga_id,
                manga_slug: history.manga_slug,
                manga_title: history.manga_title,
                chapter_id: history.chapter_id,
                chapter_number: history.chapter_number,
                chapter_title: history.chapter_title,
                priority: history.priority,
            })
            .await?;

        self.emit(WorkerEvent::DownloadQueued {
            queue_id: item.id,
            extension_id: item.extension_id.clone(),
            manga_id: item.manga_id.clone(),
            chapter_id: item.chapter_id.clone(),
            manga_title: item.manga_title.clone(),
            chapter_title: item.chapter_title.clone(),
        });
        self.nudge();

        Ok(item)
    }

    /// Self healing against adapter hangs: anything `downloading` with no
    /// progress inside the stall window goes back to `queued`.
    pub async fn retry_frozen_downloads(&self) -> Result<Vec<i64>, DownloadError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stall_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let frozen = self.queue_repo.get_stalled_downloads(cutoff).await?;

        let mut ids = vec![];
        for item in frozen {
            info!("re-queueing frozen download {}", item.id);
            self.queue_repo.requeue(item.id).await?;
            ids.push(item.id);
        }

        if !ids.is_empty() {
            self.nudge();
        }

        Ok(ids)
    }

    pub async fn next_queued(&self) -> Result<Option<QueueItem>, DownloadError> {
        Ok(self.queue_repo.get_next_queued_download().await?)
    }

    pub async fn mark_started(&self, queue_id: i64) -> Result<(), DownloadError> {
        self.queue_repo
            .update_queue_status(queue_id, DownloadStatus::Downloading, None)
            .await?;

        self.emit(WorkerEvent::DownloadStarted { queue_id });

        Ok(())
    }

    pub async fn record_progress(&self, updates: &[ProgressUpdate]) -> Result<(), DownloadError> {
        self.queue_repo.update_queue_progress_batch(updates).await?;

        for update in updates {
            self.emit(WorkerEvent::DownloadProgress {
                queue_id: update.queue_id,
                progress_current: update.progress_current,
                progress_total: update.progress_total,
            });
        }

        Ok(())
    }

    /// Registers a chapter the engine finished writing, refreshes the manga
    /// totals and retires the queue row into history.
    pub async fn complete_download(
        &self,
        item: &QueueItem,
        chapter: CompletedChapter,
    ) -> Result<(), DownloadError> {
        let manga_dir = local::manga_dir(&self.download_dir, &item.extension_id, &item.manga_slug);

        let manga = self
            .offline_repo
            .upsert_offline_manga(&NewOfflineManga {
                extension_id: item.extension_id.clone(),
                manga_id: item.manga_id.clone(),
                manga_slug: item.manga_slug.clone(),
                download_path: manga_dir.display().to_string(),
            })
            .await?;

        self.offline_repo
            .upsert_offline_chapter(&NewOfflineChapter {
                offline_manga_id: manga.id,
                chapter_id: item.chapter_id.clone(),
                chapter_number: item.chapter_number,
                chapter_title: item.chapter_title.clone(),
                folder_name: chapter.folder_name,
                total_pages: chapter.total_pages,
                size_bytes: chapter.size_bytes,
            })
            .await?;

        let total_size = local::dir_size(&manga_dir) as i64;
        self.offline_repo
            .update_manga_totals(manga.id, total_size, Utc::now())
            .await?;

        self.queue_repo
            .update_queue_status(item.id, DownloadStatus::Completed, None)
            .await?;
        self.queue_repo.move_queue_item_to_history(item.id).await?;

        self.emit(WorkerEvent::DownloadCompleted { queue_id: item.id });

        Ok(())
    }

    pub async fn fail_download(&self, queue_id: i64, error: &str) -> Result<(), DownloadError> {
        self.queue_repo
            .update_queue_status(queue_id, DownloadStatus::Failed, Some(error))
            .await?;
        self.queue_repo.move_queue_item_to_history(queue_id).await?;

        self.emit(WorkerEvent::DownloadFailed {
            queue_id,
            error: error.to_string(),
        });

        Ok(())
    }

    pub async fn get_queued_downloads(&self) -> Result<Vec<QueueItem>, DownloadError> {
        Ok(self.queue_repo.get_queued_downloads().await?)
    }

    pub async fn get_active_downloads(&self) -> Result<Vec<QueueItem>, DownloadError> {
        Ok(self.queue_repo.get_active_downloads().await?)
    }

    pub async fn get_download_progress(&self, queue_id: i64) -> Result<(i64, i64), DownloadError> {
        let item = self
            .queue_repo
            .get_queue_item(queue_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("queue item {queue_id}")))?;

        Ok((item.progress_current, item.progress_total))
    }

    pub async fn pause_downloads(&self) -> Result<u64, DownloadError> {
        Ok(self.queue_repo.pause_all_downloads().await?)
    }

    pub async fn resume_downloads(&self) -> Result<u64, DownloadError> {
        let resumed = self.queue_repo.resume_all_downloads().await?;
        if resumed > 0 {
            self.nudge();
        }

        Ok(resumed)
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, DownloadError> {
        Ok(self.offline_repo.get_storage_stats(5).await?)
    }

    pub async fn get_downloaded_manga(&self) -> Result<Vec<OfflineManga>, DownloadError> {
        Ok(self.offline_repo.get_all_offline_manga().await?)
    }

    async fn offline_manga_or_not_found(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<OfflineManga, DownloadError> {
        self.offline_repo
            .get_offline_manga(extension_id, manga_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("manga {manga_id}")))
    }

    pub async fn get_manga_metadata(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<local::MangaMetadata, DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        local::read_manga_metadata(Path::new(&manga.download_path))
            .map_err(|_| DownloadError::NotFound(format!("metadata for manga {manga_id}")))
    }

    pub async fn get_downloaded_chapters(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<Vec<OfflineChapter>, DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        Ok(self.offline_repo.get_offline_chapters(manga.id).await?)
    }

    pub async fn is_chapter_downloaded(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<bool, DownloadError> {
        let Some(manga) = self
            .offline_repo
            .get_offline_manga(extension_id, manga_id)
            .await?
        else {
            return Ok(false);
        };

        Ok(self
            .offline_repo
            .get_offline_chapter(manga.id, chapter_id)
            .await?
            .is_some())
    }

    pub async fn get_chapter_pages(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<String>, DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        let chapter = self
            .offline_repo
            .get_offline_chapter(manga.id, chapter_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("chapter {chapter_id}")))?;

        let pages_dir = Path::new(&manga.download_path)
            .join(&chapter.folder_name)
            .join(local::PAGES_DIR);

        let pages = local::list_page_files(&pages_dir)
            .map_err(|_| DownloadError::NotFound(format!("pages for chapter {chapter_id}")))?
            .iter()
            .map(|path| path.display().to_string())
            .collect();

        Ok(pages)
    }

    pub async fn get_page_path(
        &self,
        manga_id: &str,
        chapter_id: &str,
        filename: &str,
    ) -> Result<String, DownloadError> {
        // a filename, not a path; refuse anything that walks the tree
        if filename.contains(['/', '\\']) || filename.contains("..") {
            return Err(DownloadError::NotFound(format!("page {filename}")));
        }

        let manga = self
            .offline_repo
            .get_offline_manga_by_manga_id(manga_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("manga {manga_id}")))?;

        let chapter = self
            .offline_repo
            .get_offline_chapter(manga.id, chapter_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("chapter {chapter_id}")))?;

        let path = Path::new(&manga.download_path)
            .join(&chapter.folder_name)
            .join(local::PAGES_DIR)
            .join(filename);

        if !path.exists() {
            return Err(DownloadError::NotFound(format!("page {filename}")));
        }

        Ok(path.display().to_string())
    }

    /// Compares the downloaded chapter count against the source's live list
    /// without downloading anything.
    pub async fn validate_manga_chapter_count(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<ChapterValidation, DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        let downloaded = self.offline_repo.count_offline_chapters(manga.id).await?;
        let source_chapters = self
            .extensions
            .fetch_chapter_list(extension_id, manga_id)
            .await?
            .len() as i64;

        Ok(ChapterValidation {
            downloaded_chapters: downloaded,
            source_chapters,
            missing_chapters: (source_chapters - downloaded).max(0),
            complete: downloaded >= source_chapters,
        })
    }

    /// Removes the chapter rows and files together; failing to remove the
    /// files aborts before any row is touched.
    pub async fn delete_chapter(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<(), DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        let chapter = self
            .offline_repo
            .get_offline_chapter(manga.id, chapter_id)
            .await?
            .ok_or_else(|| DownloadError::NotFound(format!("chapter {chapter_id}")))?;

        let chapter_dir = Path::new(&manga.download_path).join(&chapter.folder_name);
        if chapter_dir.exists() {
            std::fs::remove_dir_all(&chapter_dir)?;
        }

        self.offline_repo.delete_offline_chapter(chapter.id).await?;

        let total_size = local::dir_size(Path::new(&manga.download_path)) as i64;
        self.offline_repo
            .update_manga_totals(manga.id, total_size, Utc::now())
            .await?;

        self.emit(WorkerEvent::ChapterDeleted {
            extension_id: extension_id.to_string(),
            manga_id: manga_id.to_string(),
            chapter_id: chapter_id.to_string(),
        });

        Ok(())
    }

    pub async fn delete_manga(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<(), DownloadError> {
        let manga = self.offline_manga_or_not_found(extension_id, manga_id).await?;

        let manga_dir = Path::new(&manga.download_path);
        if manga_dir.exists() {
            std::fs::remove_dir_all(manga_dir)?;
        }

        self.offline_repo.delete_offline_manga(manga.id).await?;

        self.emit(WorkerEvent::MangaDeleted {
            extension_id: extension_id.to_string(),
            manga_id: manga_id.to_string(),
        });

        Ok(())
    }

    /// Drops the queue, the content rows and the files. History stays; it has
    /// its own clear operation.
    pub async fn nuke_offline_data(&self) -> Result<(), DownloadError> {
        self.queue_repo.clear_queue().await?;
        self.offline_repo.clear_all_offline_data().await?;

        if self.download_dir.exists() {
            for entry in std::fs::read_dir(&self.download_dir)? {
                let entry = entry?;
                let path = entry.path();
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(e) = removed {
                    error!("failed to remove {}: {e}", path.display());
                }
            }
        }

        Ok(())
    }

    pub async fn delete_chapters_older_than(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<i64>, DownloadError> {
        let stale = self.offline_repo.get_chapters_older_than(cutoff).await?;

        let mut deleted = vec![];
        for item in stale {
            let chapter_dir = Path::new(&item.download_path).join(&item.chapter.folder_name);
            if chapter_dir.exists() {
                std::fs::remove_dir_all(&chapter_dir)?;
            }

            self.offline_repo
                .delete_offline_chapter(item.chapter.id)
                .await?;

            let total_size = local::dir_size(Path::new(&item.download_path)) as i64;
            self.offline_repo
                .update_manga_totals(item.chapter.offline_manga_id, total_size, Utc::now())
                .await?;

            deleted.push(item.chapter.id);
        }

        Ok(deleted)
    }

    pub async fn get_download_history(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<HistoryItem>, DownloadError> {
        Ok(self.queue_repo.get_download_history(limit).await?)
    }

    pub async fn delete_history_item(&self, history_id: i64) -> Result<(), DownloadError> {
        if !self.queue_repo.delete_history_item(history_id).await? {
            return Err(DownloadError::NotFound(format!(
                "history item {history_id}"
            )));
        }

        Ok(())
    }

    pub async fn clear_download_history(&self) -> Result<u64, DownloadError> {
        Ok(self.queue_repo.clear_download_history().await?)
    }
}
