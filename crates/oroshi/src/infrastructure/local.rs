use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use mime_guess::mime;
use serde::{Deserialize, Serialize};

pub const METADATA_FILE: &str = "metadata.json";
pub const PAGES_DIR: &str = "pages";

static COVER_CANDIDATES: [&str; 4] = ["cover.jpg", "cover.png", "cover.jpeg", "cover.webp"];

/// Manga-level metadata stored next to the chapter folders
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MangaMetadata {
    pub extension_id: String,
    pub manga_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChapterMetadata {
    pub chapter_id: String,
    pub number: Option<f64>,
    pub title: Option<String>,
    pub total_pages: usize,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Strip filesystem-hostile characters the same way source names and titles
/// are cleaned before they become folder names.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = name
        .replace(&['\\', '/', ':', '*', '?', '\"', '<', '>', '|'][..], "")
        .trim()
        .to_string();

    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

pub fn manga_dir<P: AsRef<Path>>(root: P, extension_id: &str, manga_slug: &str) -> PathBuf {
    PathBuf::new()
        .join(root)
        .join(sanitize_name(extension_id))
        .join(manga_slug)
}

pub fn chapter_folder_name(number: Option<f64>, title: Option<&str>, chapter_id: &str) -> String {
    match (number, title) {
        (Some(number), Some(title)) => sanitize_name(&format!("{number} - {title}")),
        (Some(number), None) => sanitize_name(&format!("{number}")),
        (None, Some(title)) => sanitize_name(title),
        (None, None) => sanitize_name(chapter_id),
    }
}

pub fn write_manga_metadata(manga_dir: &Path, metadata: &MangaMetadata) -> Result<()> {
    std::fs::create_dir_all(manga_dir)?;
    let mut file = std::fs::File::create(manga_dir.join(METADATA_FILE))?;
    serde_json::to_writer_pretty(&mut file, metadata)?;

    Ok(())
}

pub fn read_manga_metadata(manga_dir: &Path) -> Result<MangaMetadata> {
    let contents = std::fs::read_to_string(manga_dir.join(METADATA_FILE))?;

    Ok(serde_json::from_str(&contents)?)
}

pub fn write_chapter_metadata(chapter_dir: &Path, metadata: &ChapterMetadata) -> Result<()> {
    std::fs::create_dir_all(chapter_dir)?;
    let mut file = std::fs::File::create(chapter_dir.join(METADATA_FILE))?;
    serde_json::to_writer_pretty(&mut file, metadata)?;

    Ok(())
}

pub fn read_chapter_metadata(chapter_dir: &Path) -> Result<ChapterMetadata> {
    let contents = std::fs::read_to_string(chapter_dir.join(METADATA_FILE))?;

    Ok(serde_json::from_str(&contents)?)
}

pub fn is_image_file(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime::IMAGE)
}

/// Page files of a chapter in natural order, so `page-10` sorts after
/// `page-9` instead of after `page-1`.
pub fn list_page_files(pages_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = std::fs::read_dir(pages_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();

    pages.sort_by(|a, b| {
        let a = a.file_name().map(|n| n.to_string_lossy().to_string());
        let b = b.file_name().map(|n| n.to_string_lossy().to_string());
        match (a, b) {
            (Some(a), Some(b)) => human_sort::compare(&a, &b),
            _ => Ordering::Equal,
        }
    });

    Ok(pages)
}

pub fn find_cover(manga_dir: &Path) -> Option<PathBuf> {
    COVER_CANDIDATES
        .iter()
        .map(|name| manga_dir.join(name))
        .find(|path| path.exists())
}

/// Extension for a cover file derived from the source url, constrained to the
/// candidates a reader knows to look for.
pub fn cover_file_name(cover_url: &str) -> &'static str {
    let lowered = cover_url.to_ascii_lowercase();
    let trimmed = lowered.split(['?', '#']).next().unwrap_or_default();
    if trimmed.ends_with(".png") {
        "cover.png"
    } else if trimmed.ends_with(".webp") {
        "cover.webp"
    } else if trimmed.ends_with(".jpeg") {
        "cover.jpeg"
    } else {
        "cover.jpg"
    }
}

pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}
