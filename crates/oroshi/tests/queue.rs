use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use oroshi::{
    domain::{
        entities::queue::{DownloadStatus, NewQueueItem, ProgressUpdate},
        repositories::queue::{QueueRepository, QueueRepositoryError},
    },
    infrastructure::{database, repositories::queue::QueueRepositoryImpl},
};

async fn repo() -> (tempfile::TempDir, QueueRepositoryImpl) {
    let dir = tempfile::tempdir().unwrap();
    let pool = database::establish_connection(dir.path().join("queue.db"), true)
        .await
        .unwrap();

    (dir, QueueRepositoryImpl::new(pool))
}

fn new_item(chapter_id: &str, priority: i64) -> NewQueueItem {
    NewQueueItem {
        extension_id: "mockmanga".to_string(),
        manga_id: "m1".to_string(),
        manga_slug: "Mock Manga".to_string(),
        manga_title: Some("Mock Manga".to_string()),
        chapter_id: chapter_id.to_string(),
        chapter_number: Some(1.0),
        chapter_title: Some(format!("Chapter {chapter_id}")),
        priority,
    }
}

#[tokio::test]
async fn queueing_the_same_triple_never_duplicates() {
    let (_dir, repo) = repo().await;

    repo.queue_download(&new_item("c1", 0)).await.unwrap();
    repo.queue_download(&new_item("c1", 3)).await.unwrap();
    let last = repo.queue_download(&new_item("c1", 7)).await.unwrap();

    let queued = repo.get_queued_downloads().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, last.id);
    assert_eq!(queued[0].priority, 7);
    assert_eq!(queued[0].status, DownloadStatus::Queued);
}

#[tokio::test]
async fn next_queued_prefers_priority_then_age() {
    let (_dir, repo) = repo().await;

    repo.queue_download(&new_item("c1", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    repo.queue_download(&new_item("c2", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    repo.queue_download(&new_item("c3", 5)).await.unwrap();

    let next = repo.get_next_queued_download().await.unwrap().unwrap();
    assert_eq!(next.chapter_id, "c3");

    repo.delete_queue_item(next.id).await.unwrap();

    // same priority falls back to the oldest queued
    let next = repo.get_next_queued_download().await.unwrap().unwrap();
    assert_eq!(next.chapter_id, "c1");
}

#[tokio::test]
async fn started_at_is_stamped_exactly_once() {
    let (_dir, repo) = repo().await;

    let item = repo.queue_download(&new_item("c1", 0)).await.unwrap();

    repo.update_queue_status(item.id, DownloadStatus::Downloading, None)
        .await
        .unwrap();
    let first = repo
        .get_queue_item(item.id)
        .await
        .unwrap()
        .unwrap()
        .started_at
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    repo.update_queue_status(item.id, DownloadStatus::Downloading, None)
        .await
        .unwrap();

    let second = repo
        .get_queue_item(item.id)
        .await
        .unwrap()
        .unwrap()
        .started_at
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn completed_at_is_stamped_exactly_once() {
    let (_dir, repo) = repo().await;

    let item = repo.queue_download(&new_item("c1", 0)).await.unwrap();

    repo.update_queue_status(item.id, DownloadStatus::Failed, Some("boom"))
        .await
        .unwrap();
    let first = repo
        .get_queue_item(item.id)
        .await
        .unwrap()
        .unwrap()
        .completed_at
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    repo.update_queue_status(item.id, DownloadStatus::Failed, None)
        .await
        .unwrap();

    let after = repo.get_queue_item(item.id).await.unwrap().unwrap();
    assert_eq!(after.completed_at.unwrap(), first);
    assert_eq!(after.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn progress_batch_is_reflected_on_read() {
    let (_dir, repo) = repo().await;

    let item = repo.queue_download(&new_item("c1", 0)).await.unwrap();

    repo.update_queue_progress_batch(&[ProgressUpdate {
        queue_id: item.id,
        progress_current: 3,
        progress_total: 10,
    }])
    .await
    .unwrap();

    let read = repo.get_queue_item(item.id).await.unwrap().unwrap();
    assert_eq!(read.progress_current, 3);
    assert_eq!(read.progress_total, 10);
    assert!(read.last_progress_at.is_some());
}

#[tokio::test]
async fn move_to_history_requires_a_terminal_item() {
    let (_dir, repo) = repo().await;

    let item = repo.queue_download(&new_item("c1", 0)).await.unwrap();

    let result = repo.move_queue_item_to_history(item.id).await;
    assert!(matches!(result, Err(QueueRepositoryError::NotTerminal(_))));

    repo.update_queue_status(item.id, DownloadStatus::Completed, None)
        .await
        .unwrap();
    repo.move_queue_item_to_history(item.id).await.unwrap();

    // moved, not copied
    assert!(repo.get_queue_item(item.id).await.unwrap().is_none());
    let history = repo.get_download_history(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].queue_id, item.id);
    assert_eq!(history[0].status, DownloadStatus::Completed);
}

#[tokio::test]
async fn requeue_clears_progress_error_and_timestamps() {
    let (_dir, repo) = repo().await;

    let item = repo.queue_download(&new_item("c1", 0)).await.unwrap();
    repo.update_queue_status(item.id, DownloadStatus::Downloading, None)
        .await
        .unwrap();
    repo.update_queue_progress_batch(&[ProgressUpdate {
        queue_id: item.id,
        progress_current: 4,
        progress_total: 9,
    }])
    .await
    .unwrap();

    repo.requeue(item.id).await.unwrap();

    let read = repo.get_queue_item(item.id).await.unwrap().unwrap();
    assert_eq!(read.status, DownloadStatus::Queued);
    assert_eq!(read.progress_current, 0);
    assert!(read.started_at.is_none());
    assert!(read.error_message.is_none());
}

#[tokio::test]
async fn stalled_scan_only_flags_idle_downloading_items() {
    let (_dir, repo) = repo().await;

    let stuck = repo.queue_download(&new_item("c1", 0)).await.unwrap();
    repo.update_queue_status(stuck.id, DownloadStatus::Downloading, None)
        .await
        .unwrap();

    let queued = repo.queue_download(&new_item("c2", 0)).await.unwrap();

    // cutoff in the future catches the idle downloading row, never queued ones
    let stalled = repo
        .get_stalled_downloads(Utc::now() + ChronoDuration::seconds(5))
        .await
        .unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, stuck.id);
    assert_ne!(stalled[0].id, queued.id);

    // cutoff in the past means nothing has stalled yet
    let stalled = repo
        .get_stalled_downloads(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert!(stalled.is_empty());
}

#[tokio::test]
async fn pause_and_resume_toggle_queued_items() {
    let (_dir, repo) = repo().await;

    repo.queue_download(&new_item("c1", 0)).await.unwrap();
    repo.queue_download(&new_item("c2", 0)).await.unwrap();

    assert_eq!(repo.pause_all_downloads().await.unwrap(), 2);
    assert!(repo.get_next_queued_download().await.unwrap().is_none());

    assert_eq!(repo.resume_all_downloads().await.unwrap(), 2);
    assert!(repo.get_next_queued_download().await.unwrap().is_some());
}

#[tokio::test]
async fn history_is_ordered_and_limited() {
    let (_dir, repo) = repo().await;

    for chapter in ["c1", "c2", "c3"] {
        let item = repo.queue_download(&new_item(chapter, 0)).await.unwrap();
        repo.update_queue_status(item.id, DownloadStatus::Completed, None)
            .await
            .unwrap();
        repo.move_queue_item_to_history(item.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let history = repo.get_download_history(Some(2)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].chapter_id, "c3");

    let full = repo.get_download_history(None).await.unwrap();
    assert_eq!(full.len(), 3);

    assert!(repo.delete_history_item(full[0].id).await.unwrap());
    assert_eq!(repo.clear_download_history().await.unwrap(), 2);
}
