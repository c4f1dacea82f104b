//! Coachlink - RV-C bus gateway and panel state sync
//!
//! Runs in one of three modes:
//! - device (default): capture/decode the bus, keep local state, sync via the hub
//! - `--hub`: the relay server every device connects to
//! - `--sniff`: print decoded frames to the terminal

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coachlink::bus::{CaptureProcess, Decoder, Frame, FrameSource, StdinSource};
use coachlink::config::{AppConfig, ConfigWatcher};
use coachlink::hub;
use coachlink::paths::AppPaths;
use coachlink::router::{FrameOrigin, FrameOutcome, Router};
use coachlink::sniffer;
use coachlink::state::{open_database, PersistenceActor, StateActorHandle};
use coachlink::sync::{OfflineQueue, SyncClient};

/// How often the main loop checks for a quiet bus
const HEARTBEAT_CHECK_MS: u64 = 1_000;

/// Coachlink - RV-C bus decoding and multi-device state sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (state and logs are kept next to it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run the sync hub instead of a device
    #[arg(long)]
    hub: bool,

    /// Print decoded bus frames and exit when the source ends
    #[arg(long)]
    sniff: bool,

    /// Read capture lines from stdin instead of spawning the capture process
    #[arg(long)]
    stdin: bool,

    /// Override the configured device id
    #[arg(long, env = "COACHLINK_DEVICE_ID")]
    device_id: Option<String>,

    /// Run standalone without connecting to the hub
    #[arg(long)]
    no_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let paths = AppPaths::detect(args.config.as_deref());
    paths.ensure_directories()?;

    let _log_guard = init_logging(&args.log_level, &paths.logs_dir)?;

    info!("Starting Coachlink v{}...", env!("CARGO_PKG_VERSION"));
    info!(
        "Base directory: {} ({})",
        paths.base_dir().display(),
        if paths.is_portable { "portable" } else { "installed" }
    );

    let (config_watcher, initial_config) = load_config(&paths.config).await?;
    let mut config = (*initial_config).clone();
    if let Some(device_id) = &args.device_id {
        config.device_id = device_id.clone();
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    if args.hub {
        hub::start_server(&config.hub_server, cancel).await?;
        info!("Hub shutdown complete");
        return Ok(());
    }

    let source = open_source(&config, args.stdin)?;

    if args.sniff {
        let Some(source) = source else {
            anyhow::bail!("Sniffer needs a bus source: configure bus.capture or pass --stdin");
        };
        sniffer::run_sniffer(source, Decoder::new(&config.decoder), cancel).await?;
        return Ok(());
    }

    run_device(config, &paths, config_watcher, source, args.no_sync, cancel).await?;

    info!("Coachlink shutdown complete");
    Ok(())
}

/// Load the config file with hot reload, or fall back to defaults if absent
async fn load_config(path: &Path) -> Result<(Option<ConfigWatcher>, Arc<AppConfig>)> {
    if !path.exists() {
        warn!("No configuration at {}, using defaults", path.display());
        let config = AppConfig::default();
        config.validate()?;
        return Ok((None, Arc::new(config)));
    }

    let (watcher, config) = ConfigWatcher::new(path).await?;
    info!("Configuration loaded successfully with hot-reload enabled");
    Ok((Some(watcher), config))
}

fn open_source(config: &AppConfig, stdin: bool) -> Result<Option<Box<dyn FrameSource>>> {
    if stdin {
        return Ok(Some(Box::new(StdinSource::new())));
    }
    match &config.bus.capture {
        Some(capture) => Ok(Some(Box::new(CaptureProcess::spawn(capture)?))),
        None => {
            info!("No local bus capture configured, relying on relayed frames");
            Ok(None)
        }
    }
}

async fn run_device(
    config: AppConfig,
    paths: &AppPaths,
    mut config_watcher: Option<ConfigWatcher>,
    mut source: Option<Box<dyn FrameSource>>,
    no_sync: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let sync_enabled = config.hub.enabled && !no_sync;

    let db = if config.persistence.enabled {
        Some(open_database(paths.database_path())?)
    } else {
        None
    };
    let persistence = db
        .as_ref()
        .map(|db| PersistenceActor::spawn(db.clone(), config.persistence.debounce_ms));

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let store = StateActorHandle::spawn(
        config.device_id.clone(),
        persistence.as_ref().map(|p| p.cmd_tx()),
        sync_enabled.then_some(outbound_tx),
    );
    info!(device_id = %config.device_id, "State store started");

    if let Some(persistence) = &persistence {
        match persistence.load_snapshot().await {
            Ok(Some(snapshot)) => {
                info!(saved_at = snapshot.timestamp, "Restoring saved state");
                snapshot.restore_into(&store);
            }
            Ok(None) => debug!("No saved state to restore"),
            Err(e) => warn!("Failed to load saved state: {:#}", e),
        }
    }

    let (relay_tx, relay_rx) = if sync_enabled && config.hub.relay_raw_frames {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let mut router = Router::new(&config, store.clone(), relay_tx);
    info!("Router initialized");

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
    let sync = if sync_enabled {
        let queue = match &db {
            Some(db) => OfflineQueue::persistent(db, config.hub.offline_queue_capacity)
                .context("Failed to open offline queue")?,
            None => OfflineQueue::in_memory(config.hub.offline_queue_capacity),
        };
        let mut client = SyncClient::new(
            config.device_id.clone(),
            &config.hub,
            store.clone(),
            outbound_rx,
            queue,
        )?
        .with_frame_sink(frames_tx);
        if let Some(relay_rx) = relay_rx {
            client = client.with_relay(relay_rx);
        }
        info!(hub = %config.hub.url, "Hub sync enabled");
        Some(client.spawn(cancel.child_token()))
    } else {
        info!("Hub sync disabled, running standalone");
        drop(frames_tx);
        None
    };

    let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_CHECK_MS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut purge = tokio::time::interval(Duration::from_millis(config.detector.purge_interval_ms));
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Coachlink is running. Press Ctrl+C to exit.");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }

            frame = next_local_frame(&mut source) => {
                match frame {
                    Ok(Some(frame)) => log_outcome(router.process_frame(&frame, FrameOrigin::Local)),
                    Ok(None) => {
                        warn!("Bus source ended, no more local frames");
                        source = None;
                    }
                    Err(e) => {
                        warn!("Bus source failed: {:#}", e);
                        source = None;
                    }
                }
            }

            Some(frame) = frames_rx.recv() => {
                log_outcome(router.process_frame(&frame, FrameOrigin::Relay));
            }

            _ = heartbeat.tick() => {
                router.check_heartbeat();
            }

            _ = purge.tick() => {
                let purged = router.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired duplicate digests");
                }
            }

            Some(new_config) = next_reload(&mut config_watcher) => {
                info!("Configuration file changed, reloading decoder tables");
                if new_config.device_id != config.device_id || new_config.hub.url != config.hub.url {
                    warn!("Identity and hub settings only take effect after a restart");
                }
                router.update_config(&new_config);
                info!("Configuration reloaded");
            }
        }
    }

    info!("Shutting down...");
    let stats = router.stats();
    info!(
        frames = stats.frames,
        decoded = stats.decoded,
        accepted = stats.accepted,
        relayed = stats.relayed,
        "Bus statistics"
    );

    // dropping a capture process kills it
    if let Some(source) = source.take() {
        debug!("Closing bus source {}", source.name());
    }
    if let Some(sync) = sync {
        sync.join().await;
        info!("Hub connection closed");
    }

    if let Some(persistence) = persistence {
        // a save skipped on a full channel would otherwise be lost
        let snapshot = store.snapshot().await;
        if !snapshot.tree.categories.is_empty() {
            if let Err(e) = persistence.save_snapshot(snapshot).await {
                warn!("Failed to queue final snapshot: {:#}", e);
            }
        }
        if let Err(e) = persistence.flush().await {
            warn!("Failed to flush state on shutdown: {:#}", e);
        }
        persistence.shutdown();
    }
    store.shutdown();

    Ok(())
}

async fn next_local_frame(source: &mut Option<Box<dyn FrameSource>>) -> Result<Option<Frame>> {
    match source {
        Some(source) => source.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn next_reload(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

fn log_outcome(outcome: FrameOutcome) {
    if let FrameOutcome::Accepted { category, device_id } = outcome {
        debug!(%category, %device_id, "State updated from bus");
    }
}

/// Console output plus a daily rolling file in `logs_dir`
fn init_logging(level: &str, logs_dir: &Path) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(logs_dir, "coachlink.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    cancel.cancel();
}
