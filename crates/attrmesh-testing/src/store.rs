//! In-memory configuration store

use async_trait::async_trait;
use attrmesh_core::{
    Result,
    config::ConfigDocument,
    config_store::{ConfigChange, ConfigChangeStream, ConfigStore},
};
use futures::stream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Config store holding a document in memory
///
/// Every `update` notifies the streams returned by `watch_changes`.
pub struct MemoryConfigStore {
    document: Mutex<ConfigDocument>,
    version: AtomicU32,
    changes: broadcast::Sender<ConfigChange>,
}

impl MemoryConfigStore {
    pub fn new(document: ConfigDocument) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            document: Mutex::new(document),
            version: AtomicU32::new(1),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConfigDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the document and notify watchers
    pub fn update(&self, document: ConfigDocument) {
        *self.lock() = document;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        // No receivers just means nobody is watching yet.
        let _ = self.changes.send(ConfigChange {
            timestamp: chrono::Utc::now(),
            version,
        });
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of active change streams
    pub fn watchers(&self) -> usize {
        self.changes.receiver_count()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_document(&self) -> Result<ConfigDocument> {
        Ok(self.lock().clone())
    }

    async fn watch_changes(&self) -> Result<ConfigChangeStream<'static>> {
        let rx = self.changes.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) => return Some((Ok(change), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
