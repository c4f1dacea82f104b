//! Hot reload of the config file
//!
//! Only the decoder and detector sections are applied live; identity and hub
//! settings are read once at startup.
//!
//! The parent directory is watched rather than the file itself, so editors
//! that save by writing a temp file and renaming it over the original are
//! picked up too. A burst of filesystem events yields one reload.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet time after the last event before the file is re-read
const RELOAD_SETTLE_MS: u64 = 100;

/// Watches the config file and yields each successfully parsed revision
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    reload_task: JoinHandle<()>,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `config_path` and start watching it
    pub async fn new(config_path: impl Into<PathBuf>) -> Result<(Self, Arc<AppConfig>)> {
        let config_path = config_path.into();
        let initial_config = load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<()>();
        let (config_tx, rx) = mpsc::channel(4);

        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("Config watch error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if touches_config {
                // notify calls back on its own thread; an unbounded send needs no runtime
                let _ = signal_tx.send(());
            }
        })?;

        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config directory: {}", watch_dir.display()))?;

        let reload_task = tokio::spawn(reload_loop(config_path.clone(), signal_rx, config_tx));

        info!("Watching {} for changes", config_path.display());

        Ok((
            Self {
                _watcher: watcher,
                reload_task,
                rx,
            },
            Arc::new(initial_config),
        ))
    }

    /// Next parsed config revision; `None` once the watcher has stopped
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.reload_task.abort();
    }
}

async fn load(path: &Path) -> Result<AppConfig> {
    AppConfig::load(&path.to_string_lossy()).await
}

/// Collapse change signals and re-read the file after things settle
async fn reload_loop(
    path: PathBuf,
    mut signal_rx: mpsc::UnboundedReceiver<()>,
    config_tx: mpsc::Sender<AppConfig>,
) {
    while signal_rx.recv().await.is_some() {
        tokio::time::sleep(Duration::from_millis(RELOAD_SETTLE_MS)).await;
        let mut coalesced = 0usize;
        while signal_rx.try_recv().is_ok() {
            coalesced += 1;
        }
        debug!(coalesced, "Config file changed");

        match load(&path).await {
            Ok(config) => {
                if config_tx.send(config).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Config change rejected, keeping the running config: {:#}", e),
        }
    }
}
