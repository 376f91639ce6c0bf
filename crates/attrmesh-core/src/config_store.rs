//! Configuration store trait
//!
//! The `ConfigStore` trait abstracts where configuration documents come from.
//! The runtime loads the current document and then reapplies it whenever the
//! store reports a change.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{Result, config::ConfigDocument};

/// Type alias for configuration change streams
pub type ConfigChangeStream<'a> = BoxStream<'a, Result<ConfigChange>>;

/// Configuration change notification
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Timestamp of the change
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Configuration version
    pub version: u32,
}

/// Configuration store trait
///
/// # Example
/// ```no_run
/// # use attrmesh_core::config_store::ConfigStore;
/// # async fn example(store: &dyn ConfigStore) -> attrmesh_core::Result<()> {
/// let doc = store.get_document().await?;
/// println!("{} rules", doc.rules.len());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the current configuration document
    ///
    /// # Errors
    /// - `Error::ConfigNotFound` if the configuration doesn't exist
    /// - `Error::Config` if the document can't be parsed
    async fn get_document(&self) -> Result<ConfigDocument>;

    /// Watch for configuration changes
    ///
    /// The stream emits whenever the stored document changes. Consumers are
    /// expected to call `get_document` again to pick up the new contents.
    async fn watch_changes(&self) -> Result<ConfigChangeStream<'static>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_change_creation() {
        let change = ConfigChange {
            timestamp: chrono::Utc::now(),
            version: 1,
        };

        assert_eq!(change.version, 1);
    }
}
