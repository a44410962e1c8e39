//! Configuration file watcher for hot reload
//!
//! Reloaded settings are published as whole snapshots on a
//! `tokio::sync::watch` channel. Consumers pick up the latest snapshot
//! whenever they are ready for it and never see a partial update.

use crate::config::{ConfigLoader, Settings};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration file watcher
pub struct ConfigWatcher {
    config_path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<Result<Event, notify::Error>>,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, notify::Error> {
        let config_path = config_path.as_ref().to_path_buf();
        let (tx, rx) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Watch the directory so editors that replace the file are still seen
        let watch_path = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(watch_path, RecursiveMode::NonRecursive)?;

        info!(path = ?config_path, "Configuration watcher started");

        Ok(Self {
            config_path,
            _watcher: watcher,
            rx,
        })
    }

    /// Drain pending events, returning true if any touched the config file
    pub fn poll(&self) -> bool {
        let mut changed = false;

        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(event) => {
                    if self.is_relevant_event(&event) {
                        debug!(event = ?event, "Configuration file event");
                        changed = true;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                }
            }
        }

        changed
    }

    fn is_relevant_event(&self, event: &Event) -> bool {
        use notify::EventKind;

        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => event
                .paths
                .iter()
                .any(|p| p == &self.config_path || p.file_name() == self.config_path.file_name()),
            _ => false,
        }
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Re-runs the layered loader on file changes and publishes snapshots
pub struct ReloadManager {
    watcher: ConfigWatcher,
    loader: ConfigLoader,
    tx: watch::Sender<Arc<Settings>>,
}

impl ReloadManager {
    /// Create a reload manager seeded with the snapshot loaded at startup
    pub fn new(loader: ConfigLoader, initial: Arc<Settings>) -> Result<Self, notify::Error> {
        let watcher = ConfigWatcher::new(loader.config_path())?;
        let (tx, _) = watch::channel(initial);
        Ok(Self {
            watcher,
            loader,
            tx,
        })
    }

    /// Receiver for published snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Load once and publish the result if it is valid and different.
    /// A failed load leaves the current snapshot in place.
    pub fn reload(&self) -> bool {
        match self.loader.load() {
            Ok(settings) => {
                if **self.tx.borrow() == settings {
                    debug!("Configuration unchanged after reload");
                    return false;
                }
                self.tx.send_replace(Arc::new(settings));
                info!(path = ?self.watcher.config_path(), "Configuration reloaded");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to reload configuration, keeping previous snapshot");
                false
            }
        }
    }

    /// Start the reload loop in a background task.
    /// The loop ends once every receiver has been dropped.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;

                if self.tx.is_closed() {
                    debug!("No snapshot subscribers left, stopping reload loop");
                    break;
                }

                if self.watcher.poll() {
                    // Give the writer a moment to finish
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    info!("Configuration change detected, reloading");
                    self.reload();
                }
            }
        })
    }
}
