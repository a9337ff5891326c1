//! Configuration File Watcher
//!
//! Reloads the configuration file when it changes on disk and broadcasts the
//! new value to subscribers.

use super::{Config, ConfigManager};
use crate::Result;
use anyhow::{bail, Context};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub config: Arc<Config>,
    pub timestamp: std::time::SystemTime,
    pub file_path: PathBuf,
}

/// Shared state between the watcher handle and the notify callback thread
struct WatchState {
    config_path: PathBuf,
    current: RwLock<Arc<Config>>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
}

impl WatchState {
    /// Load the file and publish it. A file that is missing, unreadable or
    /// invalid leaves the current configuration in place.
    fn reload(&self) -> Result<Arc<Config>> {
        let loaded = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config file: {}", self.config_path.display()))
            .and_then(|content| ConfigManager::load_from_str(&content));

        let config = match loaded {
            Ok(config) => Arc::new(config),
            Err(e) => {
                error!("Failed to reload configuration, keeping current config: {:#}", e);
                return Err(e);
            }
        };

        match self.current.write() {
            Ok(mut current) => *current = config.clone(),
            Err(poisoned) => *poisoned.into_inner() = config.clone(),
        }

        let event = ConfigChangeEvent {
            config: config.clone(),
            timestamp: std::time::SystemTime::now(),
            file_path: self.config_path.clone(),
        };

        if self.change_sender.send(event).is_err() {
            debug!("No subscribers for config change event");
        }

        info!("Configuration reloaded from {}", self.config_path.display());
        Ok(config)
    }

    fn handle_file_event(&self, event: Event) {
        let affects_config = event
            .paths
            .iter()
            .any(|path| path.file_name() == self.config_path.file_name());

        if !affects_config {
            return;
        }

        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                info!("Configuration file changed, reloading...");
                // Editors often write in several steps.
                std::thread::sleep(std::time::Duration::from_millis(100));
                let _ = self.reload();
            }
            EventKind::Remove(_) => {
                warn!("Configuration file was removed: {}", self.config_path.display());
            }
            _ => debug!("Ignoring file event type: {:?}", event.kind),
        }
    }
}

/// Configuration file watcher
pub struct ConfigWatcher {
    state: Arc<WatchState>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Load the file and start watching its directory
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let (change_sender, _) = broadcast::channel(16);
        let initial = ConfigManager::load_from_file(&config_path)?;

        let state = Arc::new(WatchState {
            config_path,
            current: RwLock::new(Arc::new(initial)),
            change_sender,
        });

        let callback_state = state.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => callback_state.handle_file_event(event),
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        // Watching the file itself misses editors that replace it.
        let parent_dir = match watched_dir(&state.config_path) {
            Some(dir) => dir,
            None => bail!("Configuration file has no parent directory: {}", state.config_path.display()),
        };
        watcher
            .watch(parent_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", parent_dir.display()))?;

        info!("Started watching configuration directory: {}", parent_dir.display());

        Ok(Self {
            state,
            _watcher: watcher,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.state.config_path
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        match self.state.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> BroadcastStream<ConfigChangeEvent> {
        BroadcastStream::new(self.state.change_sender.subscribe())
    }

    /// Force reload the configuration
    pub fn reload(&self) -> Result<Arc<Config>> {
        info!("Force reloading configuration from: {}", self.state.config_path.display());
        self.state.reload()
    }
}

fn watched_dir(path: &Path) -> Option<&Path> {
    match path.parent() {
        Some(dir) if dir.as_os_str().is_empty() => Some(Path::new(".")),
        other => other,
    }
}
