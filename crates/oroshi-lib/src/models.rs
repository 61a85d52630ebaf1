use serde::{Deserialize, Serialize};

/// A type represent a source, normalized across adapters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub url: String,
    pub version: String,
}

/// A type represent manga details, normalized across sources
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MangaDetails {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub genres: Vec<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
}

/// A type represent chapter, normalized across sources
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChapterInfo {
    pub id: String,
    pub title: Option<String>,
    pub number: Option<f64>,
    pub scanlator: Option<String>,
    pub uploaded_at: Option<i64>,
}

/// One slice of a chapter's page list, for sources that paginate
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageChunk {
    pub pages: Vec<String>,
    pub offset: usize,
    pub done: bool,
}
