#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::Parser;
use tokio_stream::{StreamExt, wrappers::BroadcastStream, wrappers::errors::BroadcastStreamRecvError};

use oroshi::{
    application::worker::{
        protocol::{InitOptions, WorkerCommand},
        worker,
    },
    infrastructure::{
        config::{Config, GLOBAL_CONFIG},
        extension::ExtensionManager,
        rate_limit::RateLimitOptions,
    },
};

#[derive(Parser)]
struct Opts {
    /// Path to config file
    #[clap(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let mut log_builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        if let Ok(oroshi_log) = std::env::var("OROSHI_LOG") {
            log_builder.parse_filters(&format!("oroshi={oroshi_log}"));
        }
    }
    log_builder.init();

    let opts: Opts = Opts::parse();
    let config =
        GLOBAL_CONFIG.get_or_init(|| Config::open(opts.config).expect("failed to init config"));

    debug!("config: {:?}", config);

    let extensions = ExtensionManager::new(RateLimitOptions {
        requests_per_second: config.worker.requests_per_second,
        image_concurrency: config.worker.image_concurrency,
    });

    // source adapters register here before the worker starts taking commands
    for source in extensions.list().await {
        info!("source loaded: {} ({})", source.name, source.id);
    }

    let handle = worker::spawn(extensions);

    handle
        .initialize(InitOptions {
            data_dir: PathBuf::from(&config.data_dir),
            db_path: PathBuf::from(&config.database_path),
            download_dir: PathBuf::from(&config.download_path),
            options: config.worker.clone(),
        })
        .await?;

    handle.request(WorkerCommand::Start).await?;
    info!("oroshi worker started");

    let mut events = BroadcastStream::new(handle.subscribe_events());

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(event)) => info!("event: {event:?}"),
                    Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                        warn!("dropped {count} events")
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    handle.stop().await?;

    Ok(())
}
