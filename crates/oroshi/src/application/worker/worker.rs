use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::sleep,
};

use crate::{
    application::{
        metrics::Metrics,
        worker::{
            downloads::{self, Command as DownloadCommand, DownloadReceiver, DownloadSender, EngineOptions},
            protocol::{
                CommandResult, InitOptions, WorkerCommand, WorkerError, WorkerEvent,
                WorkerMessage, WorkerReply, WorkerRequest,
            },
            sync::{self, SyncOptions},
        },
    },
    domain::services::{archive::ArchiveService, downloads::DownloadService},
    infrastructure::{
        config::WorkerOptions,
        database::{self, Pool},
        extension::ExtensionManager,
        repositories::{offline::OfflineRepositoryImpl, queue::QueueRepositoryImpl},
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const FATAL_GRACE: Duration = Duration::from_millis(500);

pub type EventReceiver = broadcast::Receiver<WorkerEvent>;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<CommandResult, WorkerError>>>>>;

fn lock_pending(pending: &PendingReplies) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<CommandResult, WorkerError>>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Host-side endpoint of the worker boundary. Commands are correlated to
/// replies by request id; events arrive on a separate broadcast channel.
pub struct WorkerHandle {
    tx: flume::Sender<WorkerMessage>,
    pending: PendingReplies,
    next_request_id: AtomicU64,
    events: broadcast::Sender<WorkerEvent>,
    worker: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn initialize(&self, options: InitOptions) -> Result<(), WorkerError> {
        self.send(|request_id| WorkerMessage::Initialize {
            request_id,
            options: Box::new(options),
        })
        .await
        .map(|_| ())
    }

    pub async fn request(&self, command: WorkerCommand) -> Result<CommandResult, WorkerError> {
        self.send(|request_id| {
            WorkerMessage::Request(WorkerRequest {
                request_id,
                command,
            })
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.request(WorkerCommand::Stop).await.map(|_| ())
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.worker.is_finished()
    }

    async fn send(
        &self,
        build: impl FnOnce(u64) -> WorkerMessage,
    ) -> Result<CommandResult, WorkerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        lock_pending(&self.pending).insert(request_id, reply_tx);

        if self.tx.send(build(request_id)).is_err() {
            lock_pending(&self.pending).remove(&request_id);
            return Err(WorkerError::Unavailable("worker channel closed".to_string()));
        }

        reply_rx
            .await
            .map_err(|_| WorkerError::Unavailable("worker terminated".to_string()))?
    }
}

/// Spawns the worker task and the reply router; the returned handle is the
/// only way to talk to it.
pub fn spawn(extensions: ExtensionManager) -> WorkerHandle {
    let (msg_tx, msg_rx) = flume::unbounded::<WorkerMessage>();
    let (reply_tx, reply_rx) = flume::unbounded::<WorkerReply>();
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let process = WorkerProcess {
        rx: msg_rx,
        reply_tx,
        events: event_tx.clone(),
        extensions,
        state: None,
    };

    let fatal_events = event_tx.clone();
    let worker = tokio::spawn(async move {
        // a panic anywhere below becomes a fatal-error event instead of a
        // silently hung worker
        let run = std::panic::AssertUnwindSafe(process.run()).catch_unwind();
        if let Err(panic) = run.await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown worker fault".to_string());

            error!("worker terminated by uncaught fault: {message}");
            let _ = fatal_events.send(WorkerEvent::FatalError { message });
            sleep(FATAL_GRACE).await;
        }
    });

    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let router_pending = pending.clone();
    tokio::spawn(async move {
        while let Ok(reply) = reply_rx.recv_async().await {
            let sender = lock_pending(&router_pending).remove(&reply.request_id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(reply.result);
                }
                None => warn!("reply for unknown request {}", reply.request_id),
            }
        }

        // worker side is gone; fail whatever is still waiting
        for (_, tx) in lock_pending(&router_pending).drain() {
            let _ = tx.send(Err(WorkerError::Unavailable(
                "worker terminated".to_string(),
            )));
        }
    });

    WorkerHandle {
        tx: msg_tx,
        pending,
        next_request_id: AtomicU64::new(1),
        events: event_tx,
        worker,
    }
}

struct WorkerProcess {
    rx: flume::Receiver<WorkerMessage>,
    reply_tx: flume::Sender<WorkerReply>,
    events: broadcast::Sender<WorkerEvent>,
    extensions: ExtensionManager,
    state: Option<WorkerState>,
}

impl WorkerProcess {
    async fn run(mut self) {
        loop {
            match self.rx.recv_async().await {
                // host dropped the channel; shut down gracefully
                Err(_) => break,
                Ok(WorkerMessage::Initialize {
                    request_id,
                    options,
                }) => {
                    let result = self.initialize(*options).await;
                    let _ = self.reply_tx.send(WorkerReply { request_id, result });
                }
                Ok(WorkerMessage::Request(request)) => {
                    if self.handle_request(request).await {
                        break;
                    }
                }
            }
        }

        if let Some(state) = self.state.as_mut() {
            state.shutdown().await;
        }

        info!("worker stopped");
    }

    /// Returns true when the worker should exit.
    async fn handle_request(&mut self, request: WorkerRequest) -> bool {
        let WorkerRequest {
            request_id,
            command,
        } = request;

        let Some(state) = self.state.as_mut() else {
            let _ = self.reply_tx.send(WorkerReply {
                request_id,
                result: Err(WorkerError::Unavailable(
                    "worker is not initialized".to_string(),
                )),
            });
            return false;
        };

        if matches!(command, WorkerCommand::Stop) {
            state.shutdown().await;
            let _ = self.reply_tx.send(WorkerReply {
                request_id,
                result: Ok(CommandResult::Ack),
            });
            return true;
        }

        // archive work can take a while; it runs detached so the worker keeps
        // answering status and queue commands in the meantime
        match command {
            WorkerCommand::ExportManga {
                extension_id,
                manga_id,
                chapter_ids,
                destination,
            } => {
                let archive = state.archive.clone();
                let reply_tx = self.reply_tx.clone();
                tokio::spawn(async move {
                    let result = archive
                        .export_manga(
                            &extension_id,
                            &manga_id,
                            chapter_ids.as_deref(),
                            &destination,
                        )
                        .await
                        .map(CommandResult::Export)
                        .map_err(WorkerError::from);
                    let _ = reply_tx.send(WorkerReply { request_id, result });
                });
            }
            WorkerCommand::ImportArchive {
                archive_path,
                conflict_resolution,
            } => {
                let archive = state.archive.clone();
                let reply_tx = self.reply_tx.clone();
                tokio::spawn(async move {
                    let result = archive
                        .import_archive(&archive_path, conflict_resolution, |percent| {
                            debug!("import progress: {percent}%")
                        })
                        .await
                        .map(CommandResult::Import)
                        .map_err(WorkerError::from);
                    let _ = reply_tx.send(WorkerReply { request_id, result });
                });
            }
            command => {
                let result = state.dispatch(command).await;
                let _ = self.reply_tx.send(WorkerReply { request_id, result });
            }
        }

        false
    }

    async fn initialize(&mut self, options: InitOptions) -> Result<CommandResult, WorkerError> {
        if self.state.is_some() {
            return Err(WorkerError::Conflict(
                "worker already initialized".to_string(),
            ));
        }

        std::fs::create_dir_all(&options.data_dir)
            .and_then(|_| std::fs::create_dir_all(&options.download_dir))
            .map_err(|e| WorkerError::Internal(format!("failed to create data dirs: {e}")))?;

        let pool = database::establish_connection(&options.db_path, true)
            .await
            .map_err(|e| WorkerError::Internal(format!("failed to open database: {e}")))?;

        let queue_repo = QueueRepositoryImpl::new(pool.clone());
        let offline_repo = OfflineRepositoryImpl::new(pool.clone());

        let (engine_tx, engine_rx) = downloads::channel();

        let service = DownloadService::new(
            queue_repo,
            offline_repo.clone(),
            self.extensions.clone(),
            &options.download_dir,
            Duration::from_secs(options.options.stall_window_secs),
            self.events.clone(),
            engine_tx.clone(),
        );

        let archive = ArchiveService::new(offline_repo.clone(), &options.download_dir);

        self.state = Some(WorkerState {
            service,
            archive,
            offline_repo,
            extensions: self.extensions.clone(),
            metrics: Metrics::new(),
            options: options.options,
            engine_tx,
            engine_rx: Some(engine_rx),
            engine_handle: None,
            sync_handle: None,
            active: Arc::new(AtomicBool::new(false)),
            _pool: pool,
        });

        info!("worker initialized with db {}", options.db_path.display());

        Ok(CommandResult::Ack)
    }
}

struct WorkerState {
    service: DownloadService<QueueRepositoryImpl, OfflineRepositoryImpl>,
    archive: ArchiveService<OfflineRepositoryImpl>,
    offline_repo: OfflineRepositoryImpl,
    extensions: ExtensionManager,
    metrics: Metrics,
    options: WorkerOptions,
    engine_tx: DownloadSender,
    engine_rx: Option<DownloadReceiver>,
    engine_handle: Option<JoinHandle<()>>,
    sync_handle: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
    _pool: Pool,
}

impl WorkerState {
    async fn shutdown(&mut self) {
        if let Some(handle) = self.sync_handle.take() {
            handle.abort();
        }

        if let Some(handle) = self.engine_handle.take() {
            let _ = self.engine_tx.send(DownloadCommand::Shutdown);
            let _ = handle.await;
        }
    }

    async fn dispatch(&mut self, command: WorkerCommand) -> Result<CommandResult, WorkerError> {
        match command {
            WorkerCommand::Start => {
                if self.engine_handle.as_ref().is_none_or(|h| h.is_finished()) {
                    if let Some(rx) = self.engine_rx.take() {
                        self.engine_handle = Some(downloads::start(
                            self.service.clone(),
                            EngineOptions::from(&self.options),
                            self.metrics.clone(),
                            self.active.clone(),
                            self.engine_tx.clone(),
                            rx,
                        ));
                    }
                }

                // resume whatever survived the last run
                let _ = self.engine_tx.send(DownloadCommand::Process);

                Ok(CommandResult::Ack)
            }
            // routed by the process loop before dispatch
            WorkerCommand::Stop
            | WorkerCommand::ExportManga { .. }
            | WorkerCommand::ImportArchive { .. } => Ok(CommandResult::Ack),
            WorkerCommand::Ping => Ok(CommandResult::Pong),
            WorkerCommand::IsActive => {
                Ok(CommandResult::Active(self.active.load(Ordering::SeqCst)))
            }
            WorkerCommand::GetActiveDownloads => Ok(CommandResult::QueueItems(
                self.service.get_active_downloads().await?,
            )),
            WorkerCommand::QueueChapter {
                extension_id,
                manga_id,
                chapter_id,
                options,
            } => Ok(CommandResult::Queued(
                self.service
                    .queue_chapter(&extension_id, &manga_id, &chapter_id, options)
                    .await?,
            )),
            WorkerCommand::QueueManga {
                extension_id,
                manga_id,
                options,
            } => Ok(CommandResult::QueuedMany(
                self.service
                    .queue_manga(&extension_id, &manga_id, options)
                    .await?,
            )),
            WorkerCommand::CancelDownload { queue_id } => {
                self.service.cancel_download(queue_id).await?;
                Ok(CommandResult::Ack)
            }
            WorkerCommand::RetryDownload { queue_id } => Ok(CommandResult::Queued(
                self.service.retry_download(queue_id).await?,
            )),
            WorkerCommand::RetryFrozenDownloads => Ok(CommandResult::RetriedIds(
                self.service.retry_frozen_downloads().await?,
            )),
            WorkerCommand::GetQueuedDownloads => Ok(CommandResult::QueueItems(
                self.service.get_queued_downloads().await?,
            )),
            WorkerCommand::GetDownloadProgress { queue_id } => {
                let (progress_current, progress_total) =
                    self.service.get_download_progress(queue_id).await?;
                Ok(CommandResult::Progress {
                    progress_current,
                    progress_total,
                })
            }
            WorkerCommand::GetStorageStats => Ok(CommandResult::StorageStats(
                self.service.get_storage_stats().await?,
            )),
            WorkerCommand::GetDownloadedManga => Ok(CommandResult::MangaList(
                self.service.get_downloaded_manga().await?,
            )),
            WorkerCommand::GetMangaMetadata {
                extension_id,
                manga_id,
            } => Ok(CommandResult::MangaMetadata(Box::new(
                self.service
                    .get_manga_metadata(&extension_id, &manga_id)
                    .await?,
            ))),
            WorkerCommand::GetDownloadedChapters {
                extension_id,
                manga_id,
            } => Ok(CommandResult::Chapters(
                self.service
                    .get_downloaded_chapters(&extension_id, &manga_id)
                    .await?,
            )),
            WorkerCommand::GetChapterPages {
                extension_id,
                manga_id,
                chapter_id,
            } => Ok(CommandResult::Pages(
                self.service
                    .get_chapter_pages(&extension_id, &manga_id, &chapter_id)
                    .await?,
            )),
            WorkerCommand::IsChapterDownloaded {
                extension_id,
                manga_id,
                chapter_id,
            } => Ok(CommandResult::Flag(
                self.service
                    .is_chapter_downloaded(&extension_id, &manga_id, &chapter_id)
                    .await?,
            )),
            WorkerCommand::DeleteChapter {
                extension_id,
                manga_id,
                chapter_id,
            } => {
                self.service
                    .delete_chapter(&extension_id, &manga_id, &chapter_id)
                    .await?;
                Ok(CommandResult::Ack)
            }
            WorkerCommand::DeleteManga {
                extension_id,
                manga_id,
            } => {
                self.service.delete_manga(&extension_id, &manga_id).await?;
                Ok(CommandResult::Ack)
            }
            WorkerCommand::NukeOfflineData => {
                self.service.nuke_offline_data().await?;
                Ok(CommandResult::Ack)
            }
            WorkerCommand::GetDownloadHistory { limit } => Ok(CommandResult::History(
                self.service.get_download_history(limit).await?,
            )),
            WorkerCommand::DeleteHistoryItem { history_id } => {
                self.service.delete_history_item(history_id).await?;
                Ok(CommandResult::Ack)
            }
            WorkerCommand::ClearDownloadHistory => Ok(CommandResult::Count(
                self.service.clear_download_history().await?,
            )),
            WorkerCommand::ValidateMangaChapterCount {
                extension_id,
                manga_id,
            } => Ok(CommandResult::Validation(
                self.service
                    .validate_manga_chapter_count(&extension_id, &manga_id)
                    .await?,
            )),
            WorkerCommand::StartBackgroundSync {
                ttl_ms,
                concurrency,
                delay_ms,
            } => {
                if self.sync_handle.as_ref().is_some_and(|h| !h.is_finished()) {
                    return Err(WorkerError::Conflict(
                        "background sync already running".to_string(),
                    ));
                }

                self.sync_handle = Some(sync::start(
                    self.offline_repo.clone(),
                    self.extensions.clone(),
                    SyncOptions {
                        ttl: Duration::from_millis(ttl_ms),
                        concurrency,
                        delay: Duration::from_millis(delay_ms),
                    },
                ));

                Ok(CommandResult::Ack)
            }
            WorkerCommand::GetPagePath {
                manga_id,
                chapter_id,
                filename,
            } => Ok(CommandResult::PagePath(
                self.service
                    .get_page_path(&manga_id, &chapter_id, &filename)
                    .await?,
            )),
            WorkerCommand::PauseDownloads => {
                Ok(CommandResult::Count(self.service.pause_downloads().await?))
            }
            WorkerCommand::ResumeDownloads => Ok(CommandResult::Count(
                self.service.resume_downloads().await?,
            )),
            WorkerCommand::GetMetrics => Ok(CommandResult::Metrics(self.metrics.snapshot())),
            WorkerCommand::ResetMetrics => {
                self.metrics.reset();
                Ok(CommandResult::Ack)
            }
        }
    }
}
