use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow, bail};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{Duration, Instant, sleep},
};

use crate::{
    application::metrics::Metrics,
    domain::{
        entities::queue::{ProgressUpdate, QueueItem},
        repositories::{offline::OfflineRepository, queue::QueueRepository},
        services::downloads::{CompletedChapter, DownloadService},
    },
    infrastructure::{config::WorkerOptions, local},
};

pub type DownloadSender = UnboundedSender<Command>;
pub type DownloadReceiver = UnboundedReceiver<Command>;

#[derive(Debug)]
pub enum Command {
    Process,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub progress_batch: usize,
    pub page_chunk_size: usize,
}

impl From<&WorkerOptions> for EngineOptions {
    fn from(options: &WorkerOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            retry_delay: Duration::from_secs(options.retry_delay_secs),
            progress_batch: options.progress_batch.max(1),
            page_chunk_size: options.page_chunk_size.max(1),
        }
    }
}

/// Drives one queue item at a time through the fetch, write, verify pipeline.
/// All row writes go through the service; the engine only touches files.
pub struct DownloadWorker<Q, O>
where
    Q: QueueRepository + 'static,
    O: OfflineRepository + 'static,
{
    service: DownloadService<Q, O>,
    download_dir: PathBuf,
    options: EngineOptions,
    metrics: Metrics,
    active: Arc<AtomicBool>,
    tx: DownloadSender,
    rx: DownloadReceiver,
}

impl<Q, O> DownloadWorker<Q, O>
where
    Q: QueueRepository + 'static,
    O: OfflineRepository + 'static,
{
    pub fn new(
        service: DownloadService<Q, O>,
        options: EngineOptions,
        metrics: Metrics,
        active: Arc<AtomicBool>,
        tx: DownloadSender,
        rx: DownloadReceiver,
    ) -> Self {
        let download_dir = PathBuf::new().join(service.download_dir());

        Self {
            service,
            download_dir,
            options,
            metrics,
            active,
            tx,
            rx,
        }
    }

    async fn save_manga_metadata_if_missing(
        &self,
        manga_dir: &Path,
        item: &QueueItem,
    ) -> Result<()> {
        if manga_dir.join(local::METADATA_FILE).exists() {
            return Ok(());
        }

        let details = self
            .service
            .extensions()
            .fetch_manga_details(&item.extension_id, &item.manga_id)
            .await?;

        info!("creating directory: {}", manga_dir.display());
        local::write_manga_metadata(
            manga_dir,
            &local::MangaMetadata {
                extension_id: item.extension_id.clone(),
                manga_id: item.manga_id.clone(),
                title: details.title.clone(),
                authors: details.authors.clone(),
                genres: details.genres.clone(),
                status: details.status.clone(),
                description: details.description.clone(),
                cover_url: details.cover_url.clone(),
            },
        )?;

        // cover art is best effort; a missing cover never fails the chapter
        if let Some(cover_url) = &details.cover_url {
            match self
                .service
                .extensions()
                .fetch_image(&item.extension_id, cover_url)
                .await
            {
                Ok(bytes) => {
                    let cover_path = manga_dir.join(local::cover_file_name(cover_url));
                    if let Err(e) = tokio::fs::write(&cover_path, &bytes).await {
                        error!("failed to write cover {}: {e}", cover_path.display());
                    }
                }
                Err(e) => {
                    error!("failed to fetch cover for {}: {e}", item.manga_id);
                }
            }
        }

        Ok(())
    }

    async fn list_pages(&self, item: &QueueItem) -> Result<Vec<String>> {
        let mut pages = vec![];
        let mut offset = 0;

        loop {
            let chunk = self
                .service
                .extensions()
                .fetch_chapter_pages_chunk(
                    &item.extension_id,
                    &item.manga_id,
                    &item.chapter_id,
                    offset,
                    self.options.page_chunk_size,
                )
                .await?;

            let done = chunk.done || chunk.pages.is_empty();
            offset += chunk.pages.len();
            pages.extend(chunk.pages);

            if done {
                break;
            }
        }

        if pages.is_empty() {
            bail!("chapter {} has no pages", item.chapter_id);
        }

        Ok(pages)
    }

    async fn fetch_page(&self, item: &QueueItem, url: &str) -> Result<bytes::Bytes> {
        let mut attempts = 0;
        loop {
            match self
                .service
                .extensions()
                .fetch_image(&item.extension_id, url)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    error!("failed to download {url}, reason: {e}");
                }
            }

            attempts += 1;
            if attempts >= self.options.max_retries {
                return Err(anyhow!(
                    "failed to download {url} after {} attempts",
                    self.options.max_retries
                ));
            }
            sleep(self.options.retry_delay).await;
        }
    }

    async fn download_chapter(&self, item: &QueueItem) -> Result<CompletedChapter> {
        let manga_dir = local::manga_dir(&self.download_dir, &item.extension_id, &item.manga_slug);
        self.save_manga_metadata_if_missing(&manga_dir, item).await?;

        let pages = self.list_pages(item).await?;
        let total = pages.len() as i64;

        let folder_name = local::chapter_folder_name(
            item.chapter_number,
            item.chapter_title.as_deref(),
            &item.chapter_id,
        );
        let chapter_dir = manga_dir.join(&folder_name);
        let pages_dir = chapter_dir.join(local::PAGES_DIR);
        tokio::fs::create_dir_all(&pages_dir).await?;

        for (index, url) in pages.iter().enumerate() {
            let bytes = self.fetch_page(item, url).await?;
            let page_path = pages_dir.join(page_file_name(index, url));
            tokio::fs::write(&page_path, &bytes).await?;

            self.metrics.record_page(bytes.len() as u64);

            let current = index as i64 + 1;
            if current % self.options.progress_batch as i64 == 0 || current == total {
                self.service
                    .record_progress(&[ProgressUpdate {
                        queue_id: item.id,
                        progress_current: current,
                        progress_total: total,
                    }])
                    .await?;
            }
        }

        // verify every page made it to disk before the chapter is registered
        let written = local::list_page_files(&pages_dir)?.len();
        if written != pages.len() {
            bail!(
                "chapter {} wrote {written} of {} pages",
                item.chapter_id,
                pages.len()
            );
        }

        local::write_chapter_metadata(
            &chapter_dir,
            &local::ChapterMetadata {
                chapter_id: item.chapter_id.clone(),
                number: item.chapter_number,
                title: item.chapter_title.clone(),
                total_pages: pages.len(),
                downloaded_at: Some(chrono::Utc::now()),
            },
        )?;

        Ok(CompletedChapter {
            folder_name,
            total_pages: total,
            size_bytes: local::dir_size(&chapter_dir) as i64,
        })
    }

    async fn process_next(&self) -> Result<bool> {
        let Some(item) = self.service.next_queued().await? else {
            return Ok(false);
        };

        debug!(
            "downloading chapter {} of manga {}",
            item.chapter_id, item.manga_id
        );

        self.active.store(true, Ordering::SeqCst);
        let outcome = self.run_job(&item).await;
        self.active.store(false, Ordering::SeqCst);

        outcome?;

        Ok(true)
    }

    async fn run_job(&self, item: &QueueItem) -> Result<()> {
        self.service.mark_started(item.id).await?;

        let started = Instant::now();
        match self.download_chapter(item).await {
            Ok(completed) => {
                self.metrics.record_chapter(true, started.elapsed());
                self.service.complete_download(item, completed).await?;
                info!(
                    "chapter {} of manga {} downloaded",
                    item.chapter_id, item.manga_id
                );
            }
            Err(e) => {
                self.metrics.record_chapter(false, started.elapsed());
                error!(
                    "failed to download chapter {} of manga {}: {e}",
                    item.chapter_id, item.manga_id
                );
                self.service.fail_download(item.id, &e.to_string()).await?;
            }
        }

        Ok(())
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Process => match self.process_next().await {
                    Ok(true) => {
                        let _ = self.tx.send(Command::Process);
                    }
                    Ok(false) => {
                        debug!("download queue drained");
                    }
                    Err(e) => {
                        error!("download worker error: {e}");
                    }
                },
                Command::Shutdown => break,
            }
        }

        debug!("download worker stopped");
    }
}

fn page_file_name(index: usize, url: &str) -> String {
    let extension = url
        .rsplit('/')
        .next()
        .and_then(|name| name.split(['?', '#']).next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty() && ext.len() <= 4)
        .unwrap_or_else(|| "jpg".to_string());

    format!("{:03}.{extension}", index + 1)
}

pub fn channel() -> (DownloadSender, DownloadReceiver) {
    tokio::sync::mpsc::unbounded_channel::<Command>()
}

pub fn start<Q, O>(
    service: DownloadService<Q, O>,
    options: EngineOptions,
    metrics: Metrics,
    active: Arc<AtomicBool>,
    tx: DownloadSender,
    rx: DownloadReceiver,
) -> JoinHandle<()>
where
    Q: QueueRepository + 'static,
    O: OfflineRepository + 'static,
{
    let worker = DownloadWorker::new(service, options, metrics, active, tx, rx);

    tokio::spawn(worker.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_are_sequential_with_source_extension() {
        assert_eq!(page_file_name(0, "https://x/a/001.png?token=1"), "001.png");
        assert_eq!(page_file_name(9, "https://x/a/p10.webp"), "010.webp");
        assert_eq!(page_file_name(2, "https://x/a/raw"), "003.jpg");
    }
}
