//! Configuration generations and hot swap

use attrmesh_core::{
    Error, Result,
    adapter::AdapterRegistry,
    config::{ConfigDocument, Snapshot},
    config_store::ConfigStore,
    expr::CompilerFactory,
    pool::WorkerPool,
    template::TemplateRegistry,
};
use attrmesh_dispatcher::Dispatcher;
use attrmesh_handler::HandlerTable;
use attrmesh_observability::{Metrics, logging};
use attrmesh_routing::{RoutingTable, build_table};
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

/// The generation currently being served
struct Generation {
    next_id: i64,
    handlers: Arc<HandlerTable>,
}

/// Owns the dispatcher and moves it from one configuration to the next
///
/// Constructing a runtime installs the global log subscriber described by
/// its logging configuration, unless one is already installed.
pub struct Runtime {
    config: RuntimeConfig,
    templates: TemplateRegistry,
    adapters: AdapterRegistry,
    compilers: CompilerFactory,
    metrics: Metrics,
    dispatcher: Arc<Dispatcher>,
    handler_pool: WorkerPool,
    generation: Mutex<Generation>,
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        templates: TemplateRegistry,
        adapters: AdapterRegistry,
        compilers: CompilerFactory,
        metrics: Metrics,
    ) -> Self {
        if logging::init(&config.logging) {
            debug!(level = %config.logging.level, json = config.logging.json, "Installed log subscriber");
        }

        let dispatcher = Dispatcher::new(
            config.identity_attribute.clone(),
            WorkerPool::new(config.dispatch_workers),
            config.debug_info,
            metrics.clone(),
        );

        Self {
            handler_pool: WorkerPool::new(config.handler_workers),
            config,
            templates,
            adapters,
            compilers,
            metrics,
            dispatcher: Arc::new(dispatcher),
            generation: Mutex::new(Generation {
                next_id: 0,
                handlers: Arc::new(HandlerTable::empty()),
            }),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handler table of the generation being served
    pub fn handlers(&self) -> Arc<HandlerTable> {
        let generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&generation.handlers)
    }

    /// Install `doc` as the next generation
    ///
    /// Returns the drain task of the superseded generation, which resolves to
    /// the number of handlers it closed.
    pub fn apply_document(&self, doc: &ConfigDocument) -> JoinHandle<usize> {
        // Held across the build so concurrent applies install in id order.
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());

        let id = generation.next_id;
        generation.next_id += 1;

        let snapshot = Snapshot::resolve(id, doc, &self.templates, &self.adapters);
        let handlers = Arc::new(HandlerTable::new(
            &generation.handlers,
            &snapshot,
            &self.handler_pool,
            &self.metrics,
        ));
        // Typed by this snapshot's attributes, not the previous generation's.
        let compiler = (self.compilers)(&snapshot.attributes);
        let table = build_table(
            &snapshot,
            handlers.as_ref(),
            compiler.as_ref(),
            &self.config.default_namespace,
            self.config.debug_info,
            &self.metrics,
        );

        let old_table = self.dispatcher.change_route(Arc::new(table));
        let old_handlers = std::mem::replace(&mut generation.handlers, Arc::clone(&handlers));
        drop(generation);

        info!(
            snapshot = id,
            handlers = handlers.len(),
            rules = snapshot.rules.len(),
            "Applied configuration"
        );

        tokio::spawn(drain(
            old_table,
            handlers,
            old_handlers,
            self.config.drain_grace_period(),
            self.config.drain_poll_interval(),
            self.metrics.clone(),
        ))
    }

    /// Apply the store's document and follow its changes
    pub async fn start_listening(self: &Arc<Self>, store: Arc<dyn ConfigStore>) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(Error::AlreadyListening);
        }

        // Subscribe before the initial load so no change falls in between.
        let mut changes = store.watch_changes().await?;
        let doc = store.get_document().await?;
        self.apply_document(&doc);

        let runtime: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };

                match change {
                    Ok(change) => match store.get_document().await {
                        Ok(doc) => {
                            info!(version = change.version, "Configuration changed");
                            runtime.apply_document(&doc);
                        }
                        Err(e) => warn!(error = %e, "Failed to load configuration, keeping current routes"),
                    },
                    Err(e) => warn!(error = %e, "Configuration watch error"),
                }
            }
            debug!("Stopped watching configuration");
        }));

        Ok(())
    }

    /// Stop following configuration changes
    ///
    /// Returns whether a watch task was running.
    pub async fn stop_listening(&self) -> bool {
        match self.listener.lock().await.take() {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }
}

/// Wait for `old_table` to go idle, then close the handlers `current` dropped
async fn drain(
    old_table: Arc<RoutingTable>,
    current: Arc<HandlerTable>,
    old: Arc<HandlerTable>,
    grace_period: Duration,
    poll_interval: Duration,
    metrics: Metrics,
) -> usize {
    tokio::time::sleep(grace_period).await;

    loop {
        let refs = old_table.get_refs();
        if refs <= 0 {
            break;
        }
        debug!(table = old_table.id(), refs, "Waiting for routing table to drain");
        tokio::time::sleep(poll_interval).await;
    }

    let closed = HandlerTable::cleanup(&current, &old, &metrics);
    info!(table = old_table.id(), closed, "Drained routing table");
    closed
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
