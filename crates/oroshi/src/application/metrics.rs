use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::domain::entities::metrics::MetricsSnapshot;

/// Cumulative download counters shared between the engine and the command
/// dispatcher; readable and resettable independently of queue state.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    bytes_downloaded: AtomicU64,
    pages_downloaded: AtomicU64,
    chapters_completed: AtomicU64,
    chapters_failed: AtomicU64,
    download_time_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_page(&self, bytes: u64) {
        self.inner.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.inner.pages_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chapter(&self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.inner.chapters_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.chapters_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .download_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_downloaded: self.inner.bytes_downloaded.load(Ordering::Relaxed),
            pages_downloaded: self.inner.pages_downloaded.load(Ordering::Relaxed),
            chapters_completed: self.inner.chapters_completed.load(Ordering::Relaxed),
            chapters_failed: self.inner.chapters_failed.load(Ordering::Relaxed),
            download_time_ms: self.inner.download_time_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.inner.bytes_downloaded.store(0, Ordering::Relaxed);
        self.inner.pages_downloaded.store(0, Ordering::Relaxed);
        self.inner.chapters_completed.store(0, Ordering::Relaxed);
        self.inner.chapters_failed.store(0, Ordering::Relaxed);
        self.inner.download_time_ms.store(0, Ordering::Relaxed);
    }
}
