use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Knobs carried by the worker init message; everything the engine, rate
/// limiter and background sync need at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerOptions {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,
    #[serde(default = "default_stall_window_secs")]
    pub stall_window_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_progress_batch")]
    pub progress_batch: usize,
    #[serde(default = "default_page_chunk_size")]
    pub page_chunk_size: usize,
    #[serde(default = "default_sync_ttl_ms")]
    pub sync_ttl_ms: u64,
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default = "default_sync_delay_ms")]
    pub sync_delay_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            image_concurrency: default_image_concurrency(),
            stall_window_secs: default_stall_window_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            progress_batch: default_progress_batch(),
            page_chunk_size: default_page_chunk_size(),
            sync_ttl_ms: default_sync_ttl_ms(),
            sync_concurrency: default_sync_concurrency(),
            sync_delay_ms: default_sync_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip)]
    path: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default)]
    pub worker: WorkerOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: oroshi_home().join("config.yml"),
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            download_path: default_download_path(),
            worker: WorkerOptions::default(),
        }
    }
}

impl Config {
    pub fn open(path: Option<String>) -> Result<Config, anyhow::Error> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => oroshi_home().join("config.yml"),
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => {
                let mut cfg: Self = serde_yml::from_str(&contents)?;
                cfg.path = config_path;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Config {
                    path: config_path,
                    ..Default::default()
                };
                cfg.save()?;
                Ok(cfg)
            }
        }
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_yml::to_string(self)?)?;

        Ok(())
    }
}

fn oroshi_home() -> PathBuf {
    match std::env::var("OROSHI_HOME") {
        Ok(path) => PathBuf::from(path),
        Err(_) => dirs::home_dir().expect("should have home").join(".oroshi"),
    }
}

fn default_data_dir() -> String {
    let path = oroshi_home();
    if !path.exists() {
        let _ = std::fs::create_dir_all(&path);
    }
    path.display().to_string()
}

fn default_database_path() -> String {
    oroshi_home().join("offline.db").display().to_string()
}

fn default_download_path() -> String {
    oroshi_home().join("downloads").display().to_string()
}

fn default_requests_per_second() -> u32 {
    2
}

fn default_image_concurrency() -> usize {
    10
}

fn default_stall_window_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_progress_batch() -> usize {
    5
}

fn default_page_chunk_size() -> usize {
    50
}

fn default_sync_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_sync_concurrency() -> usize {
    2
}

fn default_sync_delay_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_options_defaults() {
        let opts: WorkerOptions = serde_yml::from_str("{}").unwrap();
        assert_eq!(opts.requests_per_second, 2);
        assert_eq!(opts.image_concurrency, 10);
        assert_eq!(opts.stall_window_secs, 30);
        assert_eq!(opts.max_retries, 3);
    }

    #[test]
    fn config_roundtrip() {
        let yaml = "download_path: /tmp/oroshi-dl\nworker:\n  requests_per_second: 5\n";
        let cfg: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(cfg.download_path, "/tmp/oroshi-dl");
        assert_eq!(cfg.worker.requests_per_second, 5);
        assert_eq!(cfg.worker.image_concurrency, 10);
    }
}
