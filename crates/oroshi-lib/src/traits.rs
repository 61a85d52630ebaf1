use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::models::{ChapterInfo, MangaDetails, PageChunk, SourceInfo};

#[async_trait]
pub trait Extension: Send + Sync {
    fn get_source_info(&self) -> SourceInfo;

    async fn fetch_manga_details(&self, manga_id: &str) -> Result<MangaDetails>;

    async fn fetch_chapter_list(&self, manga_id: &str) -> Result<Vec<ChapterInfo>>;

    async fn fetch_chapter_pages(&self, manga_id: &str, chapter_id: &str) -> Result<Vec<String>>;

    /// Sources that paginate page lists can override this; the default slices
    /// the full list so callers can always iterate in chunks.
    async fn fetch_chapter_pages_chunk(
        &self,
        manga_id: &str,
        chapter_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<PageChunk> {
        let pages = self.fetch_chapter_pages(manga_id, chapter_id).await?;
        let end = (offset + limit).min(pages.len());
        let slice = if offset < pages.len() {
            pages[offset..end].to_vec()
        } else {
            vec![]
        };

        Ok(PageChunk {
            pages: slice,
            offset,
            done: end >= pages.len(),
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Bytes>;
}
