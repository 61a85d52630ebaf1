use serde::{Deserialize, Serialize};

/// Cumulative download counters, independent of queue state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub bytes_downloaded: u64,
    pub pages_downloaded: u64,
    pub chapters_completed: u64,
    pub chapters_failed: u64,
    pub download_time_ms: u64,
}
