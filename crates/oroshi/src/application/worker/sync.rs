use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    domain::{entities::offline::OfflineManga, repositories::offline::OfflineRepository},
    infrastructure::{extension::ExtensionManager, local},
};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub ttl: Duration,
    pub concurrency: usize,
    pub delay: Duration,
}

/// Opportunistic metadata refresh: walks downloaded manga whose metadata is
/// older than the TTL and re-syncs it from the source, without ever touching
/// the foreground queue.
pub fn start<O>(
    offline_repo: O,
    extensions: ExtensionManager,
    options: SyncOptions,
) -> JoinHandle<()>
where
    O: OfflineRepository + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = refresh_stale_manga(&offline_repo, &extensions, &options).await {
            error!("background metadata sync failed: {e}");
        }
    })
}

async fn refresh_stale_manga<O>(
    offline_repo: &O,
    extensions: &ExtensionManager,
    options: &SyncOptions,
) -> Result<(), anyhow::Error>
where
    O: OfflineRepository + 'static,
{
    let cutoff = Utc::now()
        - chrono::Duration::from_std(options.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));

    let stale: Vec<OfflineManga> = offline_repo
        .get_all_offline_manga()
        .await?
        .into_iter()
        .filter(|manga| manga.last_updated_at < cutoff)
        .collect();

    if stale.is_empty() {
        debug!("no manga metadata to refresh");
        return Ok(());
    }

    info!("refreshing metadata for {} manga", stale.len());

    futures::stream::iter(stale)
        .for_each_concurrent(options.concurrency.max(1), |manga| {
            let offline_repo = offline_repo.clone();
            let extensions = extensions.clone();
            let delay = options.delay;

            async move {
                if let Err(e) = refresh_one(&offline_repo, &extensions, &manga).await {
                    error!("failed to refresh metadata for {}: {e}", manga.manga_id);
                }
                sleep(delay).await;
            }
        })
        .await;

    Ok(())
}

async fn refresh_one<O>(
    offline_repo: &O,
    extensions: &ExtensionManager,
    manga: &OfflineManga,
) -> Result<(), anyhow::Error>
where
    O: OfflineRepository,
{
    let details = extensions
        .fetch_manga_details(&manga.extension_id, &manga.manga_id)
        .await?;

    let manga_dir = Path::new(&manga.download_path);
    local::write_manga_metadata(
        manga_dir,
        &local::MangaMetadata {
            extension_id: manga.extension_id.clone(),
            manga_id: manga.manga_id.clone(),
            title: details.title,
            authors: details.authors,
            genres: details.genres,
            status: details.status,
            description: details.description,
            cover_url: details.cover_url,
        },
    )?;

    offline_repo
        .update_manga_totals(manga.id, local::dir_size(manga_dir) as i64, Utc::now())
        .await?;

    debug!("metadata refreshed for {}", manga.manga_id);

    Ok(())
}
