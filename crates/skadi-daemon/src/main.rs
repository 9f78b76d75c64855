mod http;
mod lock;
mod registry;
mod resolver;
mod session;
mod status;
mod store;
mod version_check;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use skadi_proto::channel::{Channel, StreamQuality};
use skadi_proto::config::Config;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::lock::Coordination;
use crate::registry::{RegistryHandle, SessionRegistry};
use crate::resolver::QualityResolver;
use crate::status::{ConsoleStatus, StatusSink};
use crate::store::ChannelStore;

#[derive(Parser, Debug)]
#[command(name = "skadi", version, about = "Launch and supervise live stream players")]
struct Cli {
    /// Channels to open at start-up
    channels: Vec<String>,

    /// Quality token passed to the player for the channels above
    #[arg(short, long, default_value = "best")]
    quality: String,

    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not start the local HTTP control API
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File logging
    let data_dir = skadi_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("skadi.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,skadi_daemon=debug,hyper=warn,reqwest=warn")
            }),
        )
        .init();

    eprintln!("skadi: logging to {}", log_path.display());
    info!("Log file: {:?}", log_path);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(
        "Config loaded from: {:?}",
        cli.config.clone().unwrap_or_else(Config::config_path)
    );

    // Single-instance coordination comes before anything else is started.
    let lock = match lock::acquire(config.lock.port).await {
        Coordination::Primary(lock) => Some(lock),
        Coordination::Secondary => {
            eprintln!("another instance is up");
            info!("Secondary launch, exiting");
            return Ok(());
        }
        Coordination::Unprotected(e) => {
            warn!("Continuing without single-instance protection: {}", e);
            None
        }
    };

    // Status sink: one pump owns the console writer.
    let (status, status_rx) = StatusSink::channel();
    let pump = tokio::spawn(status::run_pump(status_rx, ConsoleStatus));

    if let Some(lock) = &lock {
        info!("Listening for wakeups on {}", lock.local_addr());
        let mut wakeups = lock.subscribe();
        let status = status.clone();
        tokio::spawn(async move {
            loop {
                match wakeups.recv().await {
                    Ok(_) => status.update("Wakeup received"),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let store = Arc::new(ChannelStore::new(
        config.channels.tracked.iter().map(Channel::new),
    ));

    // Registry event channel; every session mutation funnels through it.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let registry = SessionRegistry::new(config.player.clone(), status.clone(), event_tx.clone());
    let registry_task = tokio::spawn(registry.run(event_rx));
    let handle = RegistryHandle::new(event_tx.clone());
    let _removals = registry::forward_removals(&store, event_tx).await;

    let resolver = QualityResolver::new(config.remote.clone())?;

    if config.http.enabled && !cli.no_http {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                registry: handle.clone(),
                store: store.clone(),
                resolver,
                status: status.clone(),
            },
        );
    }

    tokio::spawn(version_check::run(config.version.clone(), status.clone()));

    let quality = StreamQuality::from_token(&cli.quality);
    for name in &cli.channels {
        handle.open(Channel::new(name.as_str()), quality.clone()).await?;
    }

    info!("Skadi initialised, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await?;
    if let Err(e) = registry_task.await {
        warn!("Registry task ended abnormally: {}", e);
    }
    if let Some(lock) = lock {
        lock.release().await;
    }

    drop(status);
    pump.abort();
    Ok(())
}
