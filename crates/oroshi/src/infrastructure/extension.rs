use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio::sync::RwLock;

use oroshi_lib::prelude::{ChapterInfo, Extension, MangaDetails, PageChunk, SourceInfo};

use crate::infrastructure::rate_limit::{RateLimitOptions, RateLimiterRegistry};

/// Registry of source adapters keyed by extension id. Every dispatch goes
/// through the per-source rate limiter: metadata calls take the serialized
/// lane, image fetches the bounded pool.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<Inner>,
}

struct Inner {
    extensions: RwLock<HashMap<String, Arc<dyn Extension>>>,
    limiters: RateLimiterRegistry,
}

impl ExtensionManager {
    pub fn new(options: RateLimitOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                extensions: RwLock::new(HashMap::new()),
                limiters: RateLimiterRegistry::new(options),
            }),
        }
    }

    pub async fn insert(&self, extension: Arc<dyn Extension>) {
        let id = extension.get_source_info().id;
        self.inner.extensions.write().await.insert(id, extension);
    }

    pub async fn remove(&self, extension_id: &str) -> Result<Arc<dyn Extension>> {
        self.inner
            .extensions
            .write()
            .await
            .remove(extension_id)
            .ok_or_else(|| anyhow!("no such source"))
    }

    pub async fn get(&self, extension_id: &str) -> Result<Arc<dyn Extension>> {
        self.inner
            .extensions
            .read()
            .await
            .get(extension_id)
            .cloned()
            .ok_or_else(|| anyhow!("source {extension_id} not exists"))
    }

    pub async fn list(&self) -> Vec<SourceInfo> {
        self.inner
            .extensions
            .read()
            .await
            .values()
            .map(|ext| ext.get_source_info())
            .collect()
    }

    pub async fn fetch_manga_details(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<MangaDetails> {
        let ext = self.get(extension_id).await?;
        let limiter = self.inner.limiters.get(extension_id).await;
        limiter
            .throttle(ext.fetch_manga_details(manga_id), false)
            .await
    }

    pub async fn fetch_chapter_list(
        &self,
        extension_id: &str,
        manga_id: &str,
    ) -> Result<Vec<ChapterInfo>> {
        let ext = self.get(extension_id).await?;
        let limiter = self.inner.limiters.get(extension_id).await;
        limiter
            .throttle(ext.fetch_chapter_list(manga_id), false)
            .await
    }

    pub async fn fetch_chapter_pages(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<String>> {
        let ext = self.get(extension_id).await?;
        let limiter = self.inner.limiters.get(extension_id).await;
        limiter
            .throttle(ext.fetch_chapter_pages(manga_id, chapter_id), false)
            .await
    }

    pub async fn fetch_chapter_pages_chunk(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<PageChunk> {
        let ext = self.get(extension_id).await?;
        let limiter = self.inner.limiters.get(extension_id).await;
        limiter
            .throttle(
                ext.fetch_chapter_pages_chunk(manga_id, chapter_id, offset, limit),
                false,
            )
            .await
    }

    pub async fn fetch_image(&self, extension_id: &str, url: &str) -> Result<Bytes> {
        let ext = self.get(extension_id).await?;
        let limiter = self.inner.limiters.get(extension_id).await;
        limiter.throttle(ext.fetch_image(url), true).await
    }
}
