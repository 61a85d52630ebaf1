use serde::{Deserialize, Serialize};

/// Policy applied when importing a manga that already exists locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Skip,
    Overwrite,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReport {
    pub archive_path: String,
    pub size_bytes: u64,
    pub chapter_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub extension_id: String,
    pub manga_id: String,
    pub manga_slug: String,
    pub chapters_imported: usize,
    pub pages_imported: usize,
    pub skipped: bool,
    pub warnings: Vec<String>,
}
