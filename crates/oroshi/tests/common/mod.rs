#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;

use oroshi::{
    application::worker::{
        protocol::{InitOptions, WorkerEvent},
        worker::{self, EventReceiver, WorkerHandle},
    },
    infrastructure::{
        config::WorkerOptions,
        extension::ExtensionManager,
        rate_limit::RateLimitOptions,
    },
};
use oroshi_lib::prelude::{ChapterInfo, Extension, MangaDetails, SourceInfo};

pub const EXTENSION_ID: &str = "mockmanga";

/// In-memory source adapter: fixed manga, chapters and page lists, page
/// bytes derived from the url.
pub struct MockExtension {
    info: SourceInfo,
    manga: HashMap<String, MangaDetails>,
    chapters: HashMap<String, Vec<ChapterInfo>>,
    pages: HashMap<(String, String), Vec<String>>,
    fail_images: bool,
}

impl MockExtension {
    pub fn new() -> Self {
        Self {
            info: SourceInfo {
                id: EXTENSION_ID.to_string(),
                name: "Mock Manga".to_string(),
                url: "mock://mockmanga".to_string(),
                version: "1.0.0".to_string(),
            },
            manga: HashMap::new(),
            chapters: HashMap::new(),
            pages: HashMap::new(),
            fail_images: false,
        }
    }

    pub fn failing_images(mut self) -> Self {
        self.fail_images = true;
        self
    }

    pub fn with_manga(mut self, manga_id: &str, title: &str) -> Self {
        self.manga.insert(
            manga_id.to_string(),
            MangaDetails {
                id: manga_id.to_string(),
                title: title.to_string(),
                authors: vec!["Mock Author".to_string()],
                genres: vec!["action".to_string()],
                status: Some("ongoing".to_string()),
                description: Some("a mock manga".to_string()),
                cover_url: Some(format!("mock://{manga_id}/cover.jpg")),
            },
        );
        self
    }

    pub fn with_chapter(
        mut self,
        manga_id: &str,
        chapter_id: &str,
        number: f64,
        title: &str,
        page_count: usize,
    ) -> Self {
        self.chapters
            .entry(manga_id.to_string())
            .or_default()
            .push(ChapterInfo {
                id: chapter_id.to_string(),
                title: Some(title.to_string()),
                number: Some(number),
                scanlator: None,
                uploaded_at: None,
            });

        let pages = (1..=page_count)
            .map(|page| format!("mock://{manga_id}/{chapter_id}/{page:03}.jpg"))
            .collect();
        self.pages
            .insert((manga_id.to_string(), chapter_id.to_string()), pages);

        self
    }
}

#[async_trait]
impl Extension for MockExtension {
    fn get_source_info(&self) -> SourceInfo {
        self.info.clone()
    }

    async fn fetch_manga_details(&self, manga_id: &str) -> Result<MangaDetails> {
        self.manga
            .get(manga_id)
            .cloned()
            .ok_or_else(|| anyhow!("manga {manga_id} not found"))
    }

    async fn fetch_chapter_list(&self, manga_id: &str) -> Result<Vec<ChapterInfo>> {
        self.chapters
            .get(manga_id)
            .cloned()
            .ok_or_else(|| anyhow!("manga {manga_id} not found"))
    }

    async fn fetch_chapter_pages(&self, manga_id: &str, chapter_id: &str) -> Result<Vec<String>> {
        self.pages
            .get(&(manga_id.to_string(), chapter_id.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("chapter {chapter_id} not found"))
    }

    async fn fetch_image(&self, url: &str) -> Result<Bytes> {
        if self.fail_images {
            return Err(anyhow!("image fetch refused"));
        }

        Ok(Bytes::from(format!("image:{url}").into_bytes()))
    }
}

pub fn test_worker_options() -> WorkerOptions {
    WorkerOptions {
        requests_per_second: 100,
        retry_delay_secs: 0,
        max_retries: 2,
        stall_window_secs: 0,
        ..Default::default()
    }
}

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub handle: WorkerHandle,
}

impl TestEnv {
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("offline.db")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }
}

pub async fn spawn_worker(extension: MockExtension) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();

    let extensions = ExtensionManager::new(RateLimitOptions {
        requests_per_second: 100,
        image_concurrency: 10,
    });
    extensions.insert(Arc::new(extension)).await;

    let handle = worker::spawn(extensions);

    handle
        .initialize(InitOptions {
            data_dir: dir.path().to_path_buf(),
            db_path: dir.path().join("offline.db"),
            download_dir: dir.path().join("downloads"),
            options: test_worker_options(),
        })
        .await
        .unwrap();

    TestEnv { dir, handle }
}

pub async fn wait_for_event<F>(events: &mut EventReceiver, predicate: F) -> WorkerEvent
where
    F: Fn(&WorkerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
