//! Generation-aware handler table
//!
//! A `HandlerTable` holds the live handlers of one configuration snapshot.
//! Building a table from a new snapshot reuses every handler of the previous
//! table whose configuration signature is unchanged, so a configuration change
//! only rebuilds the handlers that actually changed.

use attrmesh_core::{
    adapter::{AdapterInfo, Env, Handler},
    config::{HandlerConfig, Snapshot},
    directory::{HandlerDirectory, HandlerEntry},
    pool::WorkerPool,
};
use attrmesh_observability::Metrics;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::env::HandlerEnv;

/// Configuration signature of a handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// Hash the adapter name together with the canonical JSON of the params
    pub fn compute(config: &HandlerConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.adapter.name.as_bytes());
        hasher.update([0u8]);
        // serde_json maps are ordered, so the rendering is canonical.
        hasher.update(config.params.to_string().as_bytes());
        Signature(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
struct TableEntry {
    name: String,
    handler: Arc<dyn Handler>,
    adapter: Arc<AdapterInfo>,
    signature: Signature,
}

/// Live handlers of one snapshot, keyed by fully-qualified handler name
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: HashMap<String, TableEntry>,
}

impl HandlerTable {
    /// Table with no handlers
    pub fn empty() -> Self {
        Self::default()
    }

    /// Instantiate every handler referenced by the rules of `snapshot`
    ///
    /// Handlers of `old` with an equal signature are carried over as-is.
    /// Handlers that fail to build are logged, counted and left out.
    pub fn new(old: &HandlerTable, snapshot: &Snapshot, pool: &WorkerPool, metrics: &Metrics) -> Self {
        let mut entries = HashMap::new();

        for rule in &snapshot.rules {
            for action in &rule.actions {
                let config = &action.handler;
                if entries.contains_key(&config.name) {
                    continue;
                }

                let signature = Signature::compute(config);
                if let Some(previous) = old.entries.get(&config.name)
                    && previous.signature == signature
                {
                    debug!(handler = %config.name, "Reusing handler with unchanged configuration");
                    entries.insert(config.name.clone(), previous.clone());
                    continue;
                }

                let env: Arc<dyn Env> = Arc::new(HandlerEnv::new(config.name.clone(), pool.clone()));
                match config.adapter.builder.build(&config.params, env) {
                    Ok(handler) => {
                        debug!(handler = %config.name, adapter = %config.adapter.name, "Built handler");
                        entries.insert(
                            config.name.clone(),
                            TableEntry {
                                name: config.name.clone(),
                                handler,
                                adapter: Arc::clone(&config.adapter),
                                signature,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(
                            handler = %config.name,
                            adapter = %config.adapter.name,
                            error = %e,
                            "Unable to build handler"
                        );
                        metrics.handler_build_failures.inc();
                    }
                }
            }
        }

        Self { entries }
    }

    /// Close every handler of `old` that `current` does not reuse
    ///
    /// Returns the number of handlers closed.
    pub fn cleanup(current: &HandlerTable, old: &HandlerTable, metrics: &Metrics) -> usize {
        let mut closed = 0;
        for (name, entry) in &old.entries {
            let reused = current
                .entries
                .get(name)
                .is_some_and(|e| std::ptr::addr_eq(Arc::as_ptr(&e.handler), Arc::as_ptr(&entry.handler)));
            if reused {
                continue;
            }

            match entry.handler.close() {
                Ok(()) => info!(handler = %name, "Closed handler"),
                Err(e) => warn!(handler = %name, error = %e, "Error closing handler"),
            }
            metrics.handlers_closed.inc();
            closed += 1;
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted handler names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.entries.get(name).map(|e| &e.signature)
    }
}

impl HandlerDirectory for HandlerTable {
    fn get(&self, name: &str) -> Option<HandlerEntry> {
        self.entries.get(name).map(|e| HandlerEntry {
            name: e.name.clone(),
            handler: Arc::clone(&e.handler),
            adapter: Arc::clone(&e.adapter),
        })
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use attrmesh_core::{
        Error, Result,
        adapter::{AdapterRegistry, HandlerBuilder},
        config::ConfigDocument,
        template::{DynamicTemplate, TemplateRegistry, Variety},
    };
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        pub Builder {}

        impl HandlerBuilder for Builder {
            fn build(&self, params: &serde_json::Value, env: Arc<dyn Env>) -> Result<Arc<dyn Handler>>;
        }
    }

    struct ClosingHandler {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for ClosingHandler {
        fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn document(threshold: i64) -> ConfigDocument {
        let yaml = format!(
            r#"
handlers:
  - name: hcheck1
    adapter: acheck
    params:
      threshold: {threshold}
instances:
  - name: icheck1
    template: tcheck
rules:
  - name: r1
    actions:
      - handler: hcheck1.acheck
        instances: [icheck1.tcheck]
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn snapshot(id: i64, threshold: i64, builder: MockBuilder) -> Snapshot {
        let mut templates = TemplateRegistry::new();
        templates.register(Arc::new(DynamicTemplate::new("tcheck", Variety::Check)));
        let adapters: AdapterRegistry = [AdapterInfo {
            name: "acheck".to_string(),
            description: String::new(),
            supported_templates: vec!["tcheck".to_string()],
            builder: Arc::new(builder),
        }]
        .into_iter()
        .collect();
        Snapshot::resolve(id, &document(threshold), &templates, &adapters)
    }

    fn closing_builder(closed: &Arc<AtomicUsize>, times: usize) -> MockBuilder {
        let closed = Arc::clone(closed);
        let mut builder = MockBuilder::new();
        builder.expect_build().times(times).returning(move |_, env| {
            assert_eq!(env.handler_name(), "hcheck1.acheck.istio-system");
            Ok(Arc::new(ClosingHandler {
                closed: Arc::clone(&closed),
            }) as Arc<dyn Handler>)
        });
        builder
    }

    #[tokio::test]
    async fn test_builds_referenced_handlers() {
        let metrics = Metrics::new().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let s = snapshot(1, 5, closing_builder(&closed, 1));

        let table = HandlerTable::new(&HandlerTable::empty(), &s, &WorkerPool::new(1), &metrics);

        assert_eq!(table.names(), vec!["hcheck1.acheck.istio-system".to_string()]);
        let entry = table.get("hcheck1.acheck.istio-system").unwrap();
        assert_eq!(entry.adapter.name, "acheck");
        assert!(table.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_reuses_handler_with_same_signature() {
        let metrics = Metrics::new().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(1);

        let first = HandlerTable::new(&HandlerTable::empty(), &snapshot(1, 5, closing_builder(&closed, 1)), &pool, &metrics);
        // Same params: the builder must not be called again.
        let second = HandlerTable::new(&first, &snapshot(2, 5, closing_builder(&closed, 0)), &pool, &metrics);

        let a = first.get("hcheck1.acheck.istio-system").unwrap();
        assert!(a.same_handler(&second.get("hcheck1.acheck.istio-system").unwrap().handler));

        assert_eq!(HandlerTable::cleanup(&second, &first, &metrics), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_closes_changed_handlers() {
        let metrics = Metrics::new().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(1);

        let first = HandlerTable::new(&HandlerTable::empty(), &snapshot(1, 5, closing_builder(&closed, 1)), &pool, &metrics);
        let second = HandlerTable::new(&first, &snapshot(2, 6, closing_builder(&closed, 1)), &pool, &metrics);

        assert_ne!(
            first.signature("hcheck1.acheck.istio-system"),
            second.signature("hcheck1.acheck.istio-system")
        );
        assert_eq!(HandlerTable::cleanup(&second, &first, &metrics), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.handlers_closed.get(), 1);

        // Dropping everything closes the rest.
        assert_eq!(HandlerTable::cleanup(&HandlerTable::empty(), &second, &metrics), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_build_failure_is_counted() {
        let metrics = Metrics::new().unwrap();
        let mut builder = MockBuilder::new();
        builder
            .expect_build()
            .times(1)
            .returning(|_, _| Err(Error::Handler("bad params".to_string())));

        let table = HandlerTable::new(&HandlerTable::empty(), &snapshot(1, 5, builder), &WorkerPool::new(1), &metrics);

        assert!(table.is_empty());
        assert_eq!(metrics.handler_build_failures.get(), 1);
    }
}
