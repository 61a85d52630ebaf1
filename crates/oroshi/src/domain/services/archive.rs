use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use zip::{ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{
    domain::{
        entities::{
            archive::{ConflictPolicy, ExportReport, ImportReport},
            offline::{NewOfflineChapter, NewOfflineManga, OfflineManga},
        },
        repositories::offline::{OfflineRepository, OfflineRepositoryError},
    },
    infrastructure::local::{
        self, ChapterMetadata, MangaMetadata, METADATA_FILE, PAGES_DIR,
    },
};

const CHAPTERS_DIR: &str = "chapters";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid archive: {errors:?}")]
    Validation {
        errors: Vec<String>,
        warnings: Vec<String>,
    },
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("repository error: {0}")]
    Repository(#[from] OfflineRepositoryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] anyhow::Error),
}

struct ValidChapter {
    folder_name: String,
    path: PathBuf,
    metadata: ChapterMetadata,
    page_files: Vec<PathBuf>,
}

/// Packages a downloaded manga into a portable zip, and the inverse:
/// validates and materializes an archive into the content store.
#[derive(Clone)]
pub struct ArchiveService<O>
where
    O: OfflineRepository,
{
    offline_repo: O,
    download_dir: PathBuf,
}

impl<O> ArchiveService<O>
where
    O: OfflineRepository,
{
    pub fn new<P: AsRef<Path>>(offline_repo: O, download_dir: P) -> Self {
        Self {
            offline_repo,
            download_dir: PathBuf::new().join(download_dir),
        }
    }

    pub async fn export_manga(
        &self,
        extension_id: &str,
        manga_id: &str,
        chapter_ids: Option<&[String]>,
        destination: &Path,
    ) -> Result<ExportReport, ArchiveError> {
        let manga = self
            .offline_repo
            .get_offline_manga(extension_id, manga_id)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("manga {manga_id}")))?;

        let chapters: Vec<_> = self
            .offline_repo
            .get_offline_chapters(manga.id)
            .await?
            .into_iter()
            .filter(|chapter| match chapter_ids {
                Some(ids) => ids.contains(&chapter.chapter_id),
                None => true,
            })
            .collect();

        if chapters.is_empty() {
            return Err(ArchiveError::NotFound(format!(
                "no chapters to export for manga {manga_id}"
            )));
        }

        let manga_dir = Path::new(&manga.download_path);

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut zip = ZipWriter::new(File::create(destination)?);
        let options = SimpleFileOptions::default();

        zip.start_file(METADATA_FILE, options)?;
        zip.write_all(&std::fs::read(manga_dir.join(METADATA_FILE))?)?;

        if let Some(cover) = local::find_cover(manga_dir) {
            if let Some(name) = cover.file_name().map(|n| n.to_string_lossy().to_string()) {
                zip.start_file(&*name, options)?;
                zip.write_all(&std::fs::read(&cover)?)?;
            }
        }

        for chapter in &chapters {
            let chapter_dir = manga_dir.join(&chapter.folder_name);

            zip.start_file(
                format!("{CHAPTERS_DIR}/{}/{METADATA_FILE}", chapter.folder_name),
                options,
            )?;
            zip.write_all(&std::fs::read(chapter_dir.join(METADATA_FILE))?)?;

            for page in local::list_page_files(&chapter_dir.join(PAGES_DIR))? {
                let Some(name) = page.file_name().map(|n| n.to_string_lossy().to_string())
                else {
                    continue;
                };
                zip.start_file(
                    format!("{CHAPTERS_DIR}/{}/{PAGES_DIR}/{name}", chapter.folder_name),
                    options,
                )?;
                zip.write_all(&std::fs::read(&page)?)?;
            }
        }

        zip.finish()?;

        let size_bytes = std::fs::metadata(destination)?.len();

        Ok(ExportReport {
            archive_path: destination.display().to_string(),
            size_bytes,
            chapter_count: chapters.len(),
        })
    }

    pub async fn import_archive<F>(
        &self,
        archive_path: &Path,
        policy: ConflictPolicy,
        on_progress: F,
    ) -> Result<ImportReport, ArchiveError>
    where
        F: Fn(u8),
    {
        // the tempdir guard removes staging on every exit path
        let staging = tempfile::tempdir()?;

        ZipArchive::new(File::open(archive_path)?)?.extract(staging.path())?;
        on_progress(10);

        let (metadata, valid_chapters, warnings) = validate_staging(staging.path())?;
        on_progress(20);

        let existing = self
            .offline_repo
            .get_offline_manga(&metadata.extension_id, &metadata.manga_id)
            .await?;

        let mut metadata = metadata;
        let (manga_slug, target_dir) = match (&existing, policy) {
            (Some(existing), ConflictPolicy::Skip) => {
                return Ok(ImportReport {
                    extension_id: existing.extension_id.clone(),
                    manga_id: existing.manga_id.clone(),
                    manga_slug: existing.manga_slug.clone(),
                    chapters_imported: 0,
                    pages_imported: 0,
                    skipped: true,
                    warnings,
                });
            }
            (Some(existing), ConflictPolicy::Overwrite) => (
                existing.manga_slug.clone(),
                PathBuf::from(&existing.download_path),
            ),
            (Some(_), ConflictPolicy::Rename) => {
                // mint a fresh identity so the original stays untouched
                let suffix = Utc::now().timestamp_millis();
                metadata.manga_id = format!("{}-{suffix}", metadata.manga_id);
                let slug = format!("{}-{suffix}", local::sanitize_name(&metadata.title));
                let dir = local::manga_dir(&self.download_dir, &metadata.extension_id, &slug);
                (slug, dir)
            }
            (None, _) => {
                let slug = local::sanitize_name(&metadata.title);
                let dir = local::manga_dir(&self.download_dir, &metadata.extension_id, &slug);
                (slug, dir)
            }
        };

        local::write_manga_metadata(&target_dir, &metadata)?;

        if let Some(cover) = local::find_cover(staging.path()) {
            if let Some(name) = cover.file_name() {
                std::fs::copy(&cover, target_dir.join(name))?;
            }
        }

        let manga = self
            .offline_repo
            .upsert_offline_manga(&NewOfflineManga {
                extension_id: metadata.extension_id.clone(),
                manga_id: metadata.manga_id.clone(),
                manga_slug: manga_slug.clone(),
                download_path: target_dir.display().to_string(),
            })
            .await?;

        let mut chapters_imported = 0;
        let mut pages_imported = 0;
        let total = valid_chapters.len();

        for (index, chapter) in valid_chapters.iter().enumerate() {
            let (page_count, size_bytes) = materialize_chapter(chapter, &target_dir)?;

            self.offline_repo
                .upsert_offline_chapter(&NewOfflineChapter {
                    offline_manga_id: manga.id,
                    chapter_id: chapter.metadata.chapter_id.clone(),
                    chapter_number: chapter.metadata.number,
                    chapter_title: chapter.metadata.title.clone(),
                    folder_name: chapter.folder_name.clone(),
                    total_pages: page_count as i64,
                    size_bytes: size_bytes as i64,
                })
                .await?;

            chapters_imported += 1;
            pages_imported += page_count;

            let percent = 20 + (80 * (index + 1) / total.max(1)) as u8;
            on_progress(percent.min(100));
        }

        let total_size = local::dir_size(&target_dir) as i64;
        self.offline_repo
            .update_manga_totals(manga.id, total_size, Utc::now())
            .await?;

        Ok(ImportReport {
            extension_id: metadata.extension_id,
            manga_id: metadata.manga_id,
            manga_slug,
            chapters_imported,
            pages_imported,
            skipped: false,
            warnings,
        })
    }
}

/// Structural validation: hard errors only for total invalidity, warnings for
/// partially broken chapters that get skipped.
fn validate_staging(
    staging: &Path,
) -> Result<(MangaMetadata, Vec<ValidChapter>, Vec<String>), ArchiveError> {
    let mut errors = vec![];
    let mut warnings = vec![];

    let metadata = match local::read_manga_metadata(staging) {
        Ok(metadata) => {
            if metadata.title.is_empty() {
                errors.push("metadata.json is missing a title".to_string());
            }
            if metadata.extension_id.is_empty() {
                errors.push("metadata.json is missing an extension_id".to_string());
            }
            if metadata.manga_id.is_empty() {
                errors.push("metadata.json is missing a manga_id".to_string());
            }
            Some(metadata)
        }
        Err(e) => {
            errors.push(format!("missing or unreadable metadata.json: {e}"));
            None
        }
    };

    let chapters_dir = staging.join(CHAPTERS_DIR);
    let mut valid_chapters = vec![];

    if chapters_dir.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(&chapters_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        entries.sort();

        for chapter_path in entries {
            let folder_name = chapter_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let chapter_metadata = match local::read_chapter_metadata(&chapter_path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warnings.push(format!("chapter {folder_name}: unreadable metadata: {e}"));
                    continue;
                }
            };

            let pages_dir = chapter_path.join(PAGES_DIR);
            let page_files = match local::list_page_files(&pages_dir) {
                Ok(pages) if !pages.is_empty() => pages,
                _ => {
                    warnings.push(format!("chapter {folder_name}: no page images"));
                    continue;
                }
            };

            valid_chapters.push(ValidChapter {
                folder_name,
                path: chapter_path,
                metadata: chapter_metadata,
                page_files,
            });
        }
    } else {
        errors.push("archive has no chapters directory".to_string());
    }

    if valid_chapters.is_empty() && errors.is_empty() {
        errors.push("archive contains no importable chapters".to_string());
    }

    match (metadata, errors.is_empty()) {
        (Some(metadata), true) => Ok((metadata, valid_chapters, warnings)),
        (_, _) => Err(ArchiveError::Validation { errors, warnings }),
    }
}

fn materialize_chapter(
    chapter: &ValidChapter,
    manga_dir: &Path,
) -> Result<(usize, u64), ArchiveError> {
    let chapter_dir = manga_dir.join(&chapter.folder_name);
    let pages_dir = chapter_dir.join(PAGES_DIR);
    std::fs::create_dir_all(&pages_dir)?;

    std::fs::copy(
        chapter.path.join(METADATA_FILE),
        chapter_dir.join(METADATA_FILE),
    )?;

    let mut bytes = 0;
    for page in &chapter.page_files {
        let Some(name) = page.file_name() else {
            continue;
        };
        bytes += std::fs::copy(page, pages_dir.join(name))?;
    }

    Ok((chapter.page_files.len(), bytes))
}
