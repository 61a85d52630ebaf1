use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One downloaded manga on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineManga {
    pub id: i64,
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub download_path: String,
    pub downloaded_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub total_size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct NewOfflineManga {
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub download_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineChapter {
    pub id: i64,
    pub offline_manga_id: i64,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub chapter_title: Option<String>,
    pub folder_name: String,
    pub total_pages: i64,
    pub downloaded_at: DateTime<Utc>,
    pub size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct NewOfflineChapter {
    pub offline_manga_id: i64,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub chapter_title: Option<String>,
    pub folder_name: String,
    pub total_pages: i64,
    pub size_bytes: i64,
}

/// A downloaded chapter joined with its owner's location, for cleanup sweeps
#[derive(Debug, Clone)]
pub struct StaleChapter {
    pub download_path: String,
    pub chapter: OfflineChapter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionUsage {
    pub extension_id: String,
    pub size_bytes: i64,
    pub manga_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MangaUsage {
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub size_bytes: i64,
    pub chapter_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_size_bytes: i64,
    pub manga_count: i64,
    pub chapter_count: i64,
    pub page_count: i64,
    pub by_extension: Vec<ExtensionUsage>,
    pub top_manga: Vec<MangaUsage>,
}

/// Result of comparing downloaded chapters against the source's live list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterValidation {
    pub downloaded_chapters: i64,
    pub source_chapters: i64,
    pub missing_chapters: i64,
    pub complete: bool,
}
