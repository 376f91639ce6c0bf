//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for attrmesh:
//! - Routing table build degradations (bad matches, missing handlers, bad instances)
//! - Handler table lifecycle (build failures, closed handlers)
//! - Route changes
//! - Per-destination dispatch counts, errors and latency

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

const DESTINATION_LABELS: &[&str] = &["handler", "adapter", "template"];

/// Metrics collector for attrmesh
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Routing table build counters
    /// Rules skipped because their match clause could not be used
    pub match_errors: IntCounter,
    /// Actions skipped because their handler was not available
    pub unsatisfied_action_handlers: IntCounter,
    /// Instances skipped because their builder or mapper failed
    pub instance_build_errors: IntCounter,

    // Handler table counters
    /// Handlers whose adapter failed to build them
    pub handler_build_failures: IntCounter,
    /// Handlers closed after a configuration change
    pub handlers_closed: IntCounter,

    /// Routing tables installed
    pub route_changes: IntCounter,

    // Dispatch metrics
    /// Handler invocations
    pub dispatch_total: IntCounterVec,
    /// Handler invocations that failed
    pub dispatch_errors: IntCounterVec,
    /// Handler invocation duration
    pub dispatch_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let match_errors = IntCounter::with_opts(Opts::new(
            "attrmesh_build_match_errors_total",
            "Rules skipped due to match clause errors while building a routing table",
        ))?;

        let unsatisfied_action_handlers = IntCounter::with_opts(Opts::new(
            "attrmesh_build_unsatisfied_action_handlers_total",
            "Rule actions skipped because their handler was unavailable",
        ))?;

        let instance_build_errors = IntCounter::with_opts(Opts::new(
            "attrmesh_build_instance_errors_total",
            "Instances skipped because their builder or mapper could not be created",
        ))?;

        let handler_build_failures = IntCounter::with_opts(Opts::new(
            "attrmesh_handler_build_failures_total",
            "Handlers that failed to build",
        ))?;

        let handlers_closed = IntCounter::with_opts(Opts::new(
            "attrmesh_handlers_closed_total",
            "Handlers closed after being superseded",
        ))?;

        let route_changes = IntCounter::with_opts(Opts::new(
            "attrmesh_route_changes_total",
            "Routing tables installed in the dispatcher",
        ))?;

        let dispatch_total = IntCounterVec::new(
            Opts::new("attrmesh_dispatch_total", "Total number of handler dispatches"),
            DESTINATION_LABELS,
        )?;

        let dispatch_errors = IntCounterVec::new(
            Opts::new(
                "attrmesh_dispatch_errors_total",
                "Total number of failed handler dispatches",
            ),
            DESTINATION_LABELS,
        )?;

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "attrmesh_dispatch_duration_seconds",
                "Handler dispatch duration in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            DESTINATION_LABELS,
        )?;

        registry.register(Box::new(match_errors.clone()))?;
        registry.register(Box::new(unsatisfied_action_handlers.clone()))?;
        registry.register(Box::new(instance_build_errors.clone()))?;
        registry.register(Box::new(handler_build_failures.clone()))?;
        registry.register(Box::new(handlers_closed.clone()))?;
        registry.register(Box::new(route_changes.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_errors.clone()))?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            match_errors,
            unsatisfied_action_handlers,
            instance_build_errors,
            handler_build_failures,
            handlers_closed,
            route_changes,
            dispatch_total,
            dispatch_errors,
            dispatch_duration_seconds,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Counters for one (handler, adapter, template) destination
    pub fn destination_counters(
        &self,
        handler: &str,
        adapter: &str,
        template: &str,
    ) -> DestinationCounters {
        let labels = [handler, adapter, template];
        DestinationCounters {
            total: self.dispatch_total.with_label_values(&labels),
            errors: self.dispatch_errors.with_label_values(&labels),
            duration: self.dispatch_duration_seconds.with_label_values(&labels),
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Pre-resolved dispatch metrics of a single destination
#[derive(Clone)]
pub struct DestinationCounters {
    total: IntCounter,
    errors: IntCounter,
    duration: Histogram,
}

impl DestinationCounters {
    /// Record one handler invocation
    pub fn record(&self, elapsed: Duration, failed: bool) {
        self.total.inc();
        if failed {
            self.errors.inc();
        }
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }
}

impl std::fmt::Debug for DestinationCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationCounters")
            .field("total", &self.total.get())
            .field("errors", &self.errors.get())
            .finish()
    }
}
