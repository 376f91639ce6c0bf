//! File-based ConfigStore implementation

use async_trait::async_trait;
use futures::stream;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use attrmesh_core::{
    Error, Result,
    config::ConfigDocument,
    config_store::{ConfigChange, ConfigChangeStream, ConfigStore},
};

/// How often the watcher thread checks whether its stream was dropped
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration store backed by one file on disk
///
/// Files ending in `.toml` are read as TOML, anything else as YAML. Edits are
/// picked up with the `notify` crate.
#[derive(Debug)]
pub struct FileConfigStore {
    config_path: PathBuf,
    /// Bumped on every observed change
    version: Arc<AtomicU32>,
}

fn expand_home(path: PathBuf) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path);
    };
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
    Ok(home.join(rest))
}

impl FileConfigStore {
    /// Create a store for `config_path`, expanding a leading `~`
    ///
    /// # Errors
    /// - `Error::ConfigNotFound` if the file doesn't exist
    pub async fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = expand_home(config_path.into())?;

        if !tokio::fs::try_exists(&config_path).await? {
            return Err(Error::ConfigNotFound);
        }

        info!("Initialized FileConfigStore for {:?}", config_path);

        Ok(Self {
            config_path,
            version: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    fn is_toml(&self) -> bool {
        self.config_path.extension().and_then(|s| s.to_str()) == Some("toml")
    }

    fn parse(&self, contents: &str) -> Result<ConfigDocument> {
        if self.is_toml() {
            toml::from_str(contents).map_err(|e| {
                error!("Failed to parse TOML config: {}", e);
                Error::Config(format!("Invalid TOML: {}", e))
            })
        } else if contents.trim().is_empty() {
            Ok(ConfigDocument::default())
        } else {
            serde_yaml::from_str(contents).map_err(|e| {
                error!("Failed to parse YAML config: {}", e);
                Error::Config(format!("Invalid YAML: {}", e))
            })
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_document(&self) -> Result<ConfigDocument> {
        let contents = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| {
                error!("Failed to read config file: {}", e);
                Error::Io(e)
            })?;

        let document = self.parse(&contents)?;
        debug!(
            handlers = document.handlers.len(),
            instances = document.instances.len(),
            rules = document.rules.len(),
            "Read config file"
        );
        Ok(document)
    }

    async fn watch_changes(&self) -> Result<ConfigChangeStream<'static>> {
        let (tx, rx) = mpsc::channel(100);

        let config_path = self.config_path.clone();
        let version = Arc::clone(&self.version);

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            // std::result::Result, our Result takes one parameter
            let mut watcher = match RecommendedWatcher::new(
                move |res: std::result::Result<Event, notify::Error>| {
                    if let Err(e) = notify_tx.send(res) {
                        error!("Failed to send file watch event: {}", e);
                    }
                },
                notify::Config::default(),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to create file watcher: {}", e);
                    return;
                }
            };

            if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
                error!("Failed to watch config file: {}", e);
                return;
            }

            info!("Watching config file for changes: {:?}", config_path);

            loop {
                let event_result = match notify_rx.recv_timeout(WATCH_POLL_INTERVAL) {
                    Ok(event_result) => event_result,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if tx.is_closed() {
                            break;
                        }
                        continue;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                };

                let item = match event_result {
                    Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                        let version = version.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(ConfigChange {
                            timestamp: chrono::Utc::now(),
                            version,
                        })
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("File watch error: {}", e);
                        Err(Error::Internal(format!("File watch error: {}", e)))
                    }
                };

                if tx.blocking_send(item).is_err() {
                    break;
                }
            }

            debug!("Config change stream closed, stopped watching {:?}", config_path);
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(Box::pin(stream))
    }
}
