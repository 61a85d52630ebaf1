mod common;

use std::time::Duration;

use common::{EXTENSION_ID, MockExtension, spawn_worker, wait_for_event};
use oroshi::{
    application::worker::{
        protocol::{
            CommandResult, InitOptions, QueueChapterOptions, QueueMangaOptions, WorkerCommand,
            WorkerError, WorkerEvent,
        },
        worker,
    },
    domain::{
        entities::queue::DownloadStatus,
        repositories::queue::QueueRepository,
    },
    infrastructure::{
        config::WorkerOptions,
        database,
        extension::ExtensionManager,
        rate_limit::RateLimitOptions,
        repositories::queue::QueueRepositoryImpl,
    },
};

fn queue_chapter_command(chapter_id: &str, priority: i64) -> WorkerCommand {
    WorkerCommand::QueueChapter {
        extension_id: EXTENSION_ID.to_string(),
        manga_id: "m1".to_string(),
        chapter_id: chapter_id.to_string(),
        options: QueueChapterOptions { priority },
    }
}

#[tokio::test]
async fn commands_are_rejected_before_initialization() {
    let extensions = ExtensionManager::new(RateLimitOptions::default());
    let handle = worker::spawn(extensions);

    let result = handle.request(WorkerCommand::Ping).await;
    assert!(matches!(result, Err(WorkerError::Unavailable(_))));
}

#[tokio::test]
async fn initialize_twice_is_a_conflict() {
    let env = spawn_worker(MockExtension::new()).await;

    let result = env
        .handle
        .initialize(InitOptions {
            data_dir: env.dir.path().to_path_buf(),
            db_path: env.db_path(),
            download_dir: env.download_dir(),
            options: WorkerOptions::default(),
        })
        .await;

    assert!(matches!(result, Err(WorkerError::Conflict(_))));
}

#[tokio::test]
async fn chapter_downloads_end_to_end() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 3);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    let result = env
        .handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    let CommandResult::Queued(item) = result else {
        panic!("expected a queued item");
    };

    env.handle.request(WorkerCommand::Start).await.unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadCompleted { queue_id } if *queue_id == item.id)
    })
    .await;

    let manga_dir = env.download_dir().join(EXTENSION_ID).join("Mock Manga");
    assert!(manga_dir.join("metadata.json").exists());
    assert!(manga_dir.join("cover.jpg").exists());

    let chapter_dir = manga_dir.join("1 - One");
    assert!(chapter_dir.join("metadata.json").exists());
    for page in ["001.jpg", "002.jpg", "003.jpg"] {
        assert!(chapter_dir.join("pages").join(page).exists());
    }

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadedChapters {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
        })
        .await
        .unwrap();
    let CommandResult::Chapters(chapters) = result else {
        panic!("expected chapters");
    };
    assert_eq!(chapters.len(), 1);
    assert_eq!(chapters[0].total_pages, 3);

    let result = env
        .handle
        .request(WorkerCommand::IsChapterDownloaded {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
            chapter_id: "c1".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(result, CommandResult::Flag(true)));

    // terminal items live in history, not the queue
    let result = env
        .handle
        .request(WorkerCommand::GetQueuedDownloads)
        .await
        .unwrap();
    let CommandResult::QueueItems(queued) = result else {
        panic!("expected queue items");
    };
    assert!(queued.is_empty());

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadHistory { limit: None })
        .await
        .unwrap();
    let CommandResult::History(history) = result else {
        panic!("expected history");
    };
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DownloadStatus::Completed);

    let result = env.handle.request(WorkerCommand::GetMetrics).await.unwrap();
    let CommandResult::Metrics(metrics) = result else {
        panic!("expected metrics");
    };
    assert_eq!(metrics.pages_downloaded, 3);
    assert_eq!(metrics.chapters_completed, 1);

    env.handle.stop().await.unwrap();
}

#[tokio::test]
async fn failed_chapter_moves_to_history_with_error() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 2)
        .failing_images();
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    let result = env
        .handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    let CommandResult::Queued(item) = result else {
        panic!("expected a queued item");
    };

    env.handle.request(WorkerCommand::Start).await.unwrap();

    let event = wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadFailed { queue_id, .. } if *queue_id == item.id)
    })
    .await;
    let WorkerEvent::DownloadFailed { error, .. } = event else {
        unreachable!();
    };
    assert!(error.contains("attempts"));

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadHistory { limit: None })
        .await
        .unwrap();
    let CommandResult::History(history) = result else {
        panic!("expected history");
    };
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DownloadStatus::Failed);
    assert!(history[0].error_message.is_some());

    let result = env.handle.request(WorkerCommand::GetMetrics).await.unwrap();
    let CommandResult::Metrics(metrics) = result else {
        panic!("expected metrics");
    };
    assert_eq!(metrics.chapters_failed, 1);
}

#[tokio::test]
async fn queue_manga_expands_and_orders_by_priority() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1)
        .with_chapter("m1", "c2", 2.0, "Two", 1)
        .with_chapter("m1", "c3", 3.0, "Three", 1);
    let env = spawn_worker(extension).await;

    let result = env
        .handle
        .request(WorkerCommand::QueueManga {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
            options: QueueMangaOptions {
                priority: 0,
                chapter_ids: Some(vec!["c1".to_string(), "c2".to_string()]),
            },
        })
        .await
        .unwrap();
    let CommandResult::QueuedMany(expanded) = result else {
        panic!("expected expanded items");
    };
    assert_eq!(expanded.len(), 2);

    env.handle
        .request(queue_chapter_command("c3", 5))
        .await
        .unwrap();

    // the highest priority item leads the queue
    let result = env
        .handle
        .request(WorkerCommand::GetQueuedDownloads)
        .await
        .unwrap();
    let CommandResult::QueueItems(queued) = result else {
        panic!("expected queue items");
    };
    assert_eq!(queued.len(), 3);
    assert_eq!(queued[0].chapter_id, "c3");
}

#[tokio::test]
async fn cancelling_an_in_flight_download_is_a_conflict() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1);
    let env = spawn_worker(extension).await;

    let result = env
        .handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    let CommandResult::Queued(item) = result else {
        panic!("expected a queued item");
    };

    // flip the row to downloading through a second connection, as if the
    // engine had claimed it
    let pool = database::establish_connection(env.db_path(), false)
        .await
        .unwrap();
    let repo = QueueRepositoryImpl::new(pool);
    repo.update_queue_status(item.id, DownloadStatus::Downloading, None)
        .await
        .unwrap();

    let result = env
        .handle
        .request(WorkerCommand::CancelDownload { queue_id: item.id })
        .await;
    assert!(matches!(result, Err(WorkerError::Conflict(_))));

    // the frozen scan recovers it once the stall window elapses
    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = env
        .handle
        .request(WorkerCommand::RetryFrozenDownloads)
        .await
        .unwrap();
    let CommandResult::RetriedIds(ids) = result else {
        panic!("expected retried ids");
    };
    assert_eq!(ids, vec![item.id]);

    let requeued = repo.get_queue_item(item.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, DownloadStatus::Queued);

    // a queued item cancels cleanly
    env.handle
        .request(WorkerCommand::CancelDownload { queue_id: item.id })
        .await
        .unwrap();
    assert!(repo.get_queue_item(item.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelling_an_unknown_queue_id_is_not_found() {
    let env = spawn_worker(MockExtension::new()).await;

    let result = env
        .handle
        .request(WorkerCommand::CancelDownload { queue_id: 999 })
        .await;
    assert!(matches!(result, Err(WorkerError::NotFound(_))));
}

#[tokio::test]
async fn deleting_a_manga_cascades_rows_and_files() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 2);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    env.handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    env.handle.request(WorkerCommand::Start).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadCompleted { .. })
    })
    .await;

    env.handle
        .request(WorkerCommand::DeleteManga {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
        })
        .await
        .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::MangaDeleted { .. })
    })
    .await;

    assert!(!env.download_dir().join(EXTENSION_ID).join("Mock Manga").exists());

    let result = env
        .handle
        .request(WorkerCommand::GetMangaMetadata {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
        })
        .await;
    assert!(matches!(result, Err(WorkerError::NotFound(_))));

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadedManga)
        .await
        .unwrap();
    let CommandResult::MangaList(manga) = result else {
        panic!("expected manga list");
    };
    assert!(manga.is_empty());
}

#[tokio::test]
async fn deleting_a_chapter_keeps_the_manga() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1)
        .with_chapter("m1", "c2", 2.0, "Two", 1);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    env.handle
        .request(WorkerCommand::QueueManga {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
            options: QueueMangaOptions::default(),
        })
        .await
        .unwrap();
    env.handle.request(WorkerCommand::Start).await.unwrap();

    for _ in 0..2 {
        wait_for_event(&mut events, |event| {
            matches!(event, WorkerEvent::DownloadCompleted { .. })
        })
        .await;
    }

    env.handle
        .request(WorkerCommand::DeleteChapter {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
            chapter_id: "c1".to_string(),
        })
        .await
        .unwrap();

    let manga_dir = env.download_dir().join(EXTENSION_ID).join("Mock Manga");
    assert!(!manga_dir.join("1 - One").exists());
    assert!(manga_dir.join("2 - Two").exists());

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadedChapters {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
        })
        .await
        .unwrap();
    let CommandResult::Chapters(chapters) = result else {
        panic!("expected chapters");
    };
    assert_eq!(chapters.len(), 1);
    assert_eq!(chapters[0].chapter_id, "c2");
}

#[tokio::test]
async fn page_queries_resolve_stored_files() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 2);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    env.handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    env.handle.request(WorkerCommand::Start).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadCompleted { .. })
    })
    .await;

    let result = env
        .handle
        .request(WorkerCommand::GetChapterPages {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
            chapter_id: "c1".to_string(),
        })
        .await
        .unwrap();
    let CommandResult::Pages(pages) = result else {
        panic!("expected pages");
    };
    assert_eq!(pages.len(), 2);
    assert!(pages[0].ends_with("001.jpg"));

    let result = env
        .handle
        .request(WorkerCommand::GetPagePath {
            manga_id: "m1".to_string(),
            chapter_id: "c1".to_string(),
            filename: "002.jpg".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(result, CommandResult::PagePath(path) if path.ends_with("002.jpg")));

    // path traversal is treated as an unknown page
    let result = env
        .handle
        .request(WorkerCommand::GetPagePath {
            manga_id: "m1".to_string(),
            chapter_id: "c1".to_string(),
            filename: "../metadata.json".to_string(),
        })
        .await;
    assert!(matches!(result, Err(WorkerError::NotFound(_))));
}

#[tokio::test]
async fn validate_chapter_count_flags_missing_chapters() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1)
        .with_chapter("m1", "c2", 2.0, "Two", 1);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    env.handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    env.handle.request(WorkerCommand::Start).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadCompleted { .. })
    })
    .await;

    let result = env
        .handle
        .request(WorkerCommand::ValidateMangaChapterCount {
            extension_id: EXTENSION_ID.to_string(),
            manga_id: "m1".to_string(),
        })
        .await
        .unwrap();
    let CommandResult::Validation(validation) = result else {
        panic!("expected validation");
    };
    assert_eq!(validation.downloaded_chapters, 1);
    assert_eq!(validation.source_chapters, 2);
    assert_eq!(validation.missing_chapters, 1);
    assert!(!validation.complete);
}

#[tokio::test]
async fn nuke_clears_content_but_keeps_history() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1);
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    env.handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    env.handle.request(WorkerCommand::Start).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadCompleted { .. })
    })
    .await;

    env.handle
        .request(WorkerCommand::NukeOfflineData)
        .await
        .unwrap();

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadedManga)
        .await
        .unwrap();
    let CommandResult::MangaList(manga) = result else {
        panic!("expected manga list");
    };
    assert!(manga.is_empty());

    assert_eq!(std::fs::read_dir(env.download_dir()).unwrap().count(), 0);

    let result = env
        .handle
        .request(WorkerCommand::GetDownloadHistory { limit: None })
        .await
        .unwrap();
    let CommandResult::History(history) = result else {
        panic!("expected history");
    };
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn retry_requeues_from_history_after_failure() {
    let extension = MockExtension::new()
        .with_manga("m1", "Mock Manga")
        .with_chapter("m1", "c1", 1.0, "One", 1)
        .failing_images();
    let env = spawn_worker(extension).await;
    let mut events = env.handle.subscribe_events();

    let result = env
        .handle
        .request(queue_chapter_command("c1", 0))
        .await
        .unwrap();
    let CommandResult::Queued(item) = result else {
        panic!("expected a queued item");
    };

    env.handle.request(WorkerCommand::Start).await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadFailed { queue_id, .. } if *queue_id == item.id)
    })
    .await;

    let result = env
        .handle
        .request(WorkerCommand::RetryDownload { queue_id: item.id })
        .await
        .unwrap();
    let CommandResult::Queued(retried) = result else {
        panic!("expected a queued item");
    };
    assert_eq!(retried.chapter_id, "c1");
    assert_eq!(retried.status, DownloadStatus::Queued);

    wait_for_event(&mut events, |event| {
        matches!(event, WorkerEvent::DownloadFailed { queue_id, .. } if *queue_id == retried.id)
    })
    .await;

    // history is append-only; both attempts are recorded
    let result = env
        .handle
        .request(WorkerCommand::GetDownloadHistory { limit: None })
        .await
        .unwrap();
    let CommandResult::History(history) = result else {
        panic!("expected history");
    };
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn worker_answers_queries_while_stopped_engine_is_idle() {
    let env = spawn_worker(MockExtension::new()).await;

    assert!(matches!(
        env.handle.request(WorkerCommand::Ping).await.unwrap(),
        CommandResult::Pong
    ));
    assert!(matches!(
        env.handle.request(WorkerCommand::IsActive).await.unwrap(),
        CommandResult::Active(false)
    ));

    env.handle.stop().await.unwrap();

    // after stop, the worker is gone for good
    let result = env.handle.request(WorkerCommand::Ping).await;
    assert!(matches!(result, Err(WorkerError::Unavailable(_))));
}
