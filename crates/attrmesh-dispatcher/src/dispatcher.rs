//! Request dispatch against the current routing table
//!
//! Each call derives a namespace from the identity attribute, looks up the
//! destinations of the call's variety in the current routing table and
//! invokes the handlers whose instance groups match the request. Handler
//! invocations of one call run concurrently on the worker pool; their results
//! are read back in table order, so combined statuses and error lists do not
//! depend on completion order.

use attrmesh_core::{
    DispatchErrors, Error, Result,
    adapter::{CheckResult, Instance, QuotaArgs, QuotaMethodArgs, QuotaResult},
    attribute::{Bag, MutableBag},
    panic_message,
    pool::WorkerPool,
    template::{InstanceBuilder, Variety},
};
use attrmesh_observability::Metrics;
use attrmesh_routing::{Destination, InstanceGroup, RoutingTable};
use futures::FutureExt;
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::result::{combine_check_results, combine_quota_results};
use crate::session::{Session, namespace_of};
use crate::state::{DispatchState, DispatchStatePool};

/// Dispatches requests to the handlers selected by the routing table
pub struct Dispatcher {
    /// Attribute whose value encodes the caller's namespace
    identity_attribute: String,
    pool: WorkerPool,
    table: RwLock<Arc<RoutingTable>>,
    states: DispatchStatePool,
    debug_info: bool,
    metrics: Metrics,
    next_session: AtomicU64,
}

/// Keeps a routing table referenced for the duration of a call
///
/// The reference is released on drop, which also covers errors, recovered
/// panics and callers dropping the call's future.
struct TableGuard {
    table: Arc<RoutingTable>,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        self.table.dec_ref();
    }
}

/// Build an instance, turning a panicking builder into an error
fn build_instance(builder: &InstanceBuilder, bag: &dyn Bag) -> Result<Instance> {
    std::panic::catch_unwind(AssertUnwindSafe(|| builder(bag)))
        .unwrap_or_else(|payload| Err(Error::HandlerPanic(panic_message(payload.as_ref()))))
}

fn matching_groups<'t>(
    destination: &'t Destination,
    bag: &'t dyn Bag,
) -> impl Iterator<Item = &'t InstanceGroup> + 't {
    destination
        .instance_groups
        .iter()
        .filter(move |group| group.matches(bag))
}

impl Dispatcher {
    /// Create a dispatcher starting out with the empty routing table
    pub fn new(
        identity_attribute: impl Into<String>,
        pool: WorkerPool,
        debug_info: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            identity_attribute: identity_attribute.into(),
            pool,
            table: RwLock::new(Arc::new(RoutingTable::empty())),
            states: DispatchStatePool::default(),
            debug_info,
            metrics,
            next_session: AtomicU64::new(1),
        }
    }

    /// Install a new routing table, returning the one it replaces
    ///
    /// Calls started after this returns use `new_table`. Calls already in
    /// flight keep their reference to the previous table; the caller decides
    /// when the previous table has drained.
    pub fn change_route(&self, new_table: Arc<RoutingTable>) -> Arc<RoutingTable> {
        let new_id = new_table.id();
        if self.debug_info {
            debug!(table = %new_table, "Installing routing table");
        }

        let old = {
            let mut current = self.table.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, new_table)
        };

        self.metrics.route_changes.inc();
        info!(old = old.id(), new = new_id, "Changed routing table");
        old
    }

    /// The routing table new calls are dispatched against
    pub fn current_table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn identity_attribute(&self) -> &str {
        &self.identity_attribute
    }

    fn acquire_table(&self) -> TableGuard {
        let current = self.table.read().unwrap_or_else(|e| e.into_inner());
        // Counted before the lock is released, so a concurrent change_route
        // never observes a drained table that is about to be used.
        current.inc_ref();
        TableGuard {
            table: Arc::clone(&current),
        }
    }

    fn new_session(
        &self,
        variety: Variety,
        namespace: String,
        table: &RoutingTable,
        quota_args: QuotaArgs,
    ) -> Arc<Session> {
        let session = Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            variety,
            namespace,
            table_id: table.id(),
            quota_args,
        };
        debug!(
            session = session.id,
            %variety,
            namespace = %session.namespace,
            table = session.table_id,
            "Dispatching"
        );
        Arc::new(session)
    }

    /// Run one handler invocation on the pool with panic containment
    async fn invoke<T>(
        &self,
        destination: &Destination,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = self
            .pool
            .run(AssertUnwindSafe(call).catch_unwind())
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(
                    handler = %destination.handler_name,
                    template = %destination.template.name(),
                    panic = %message,
                    "Recovered panic during handler dispatch"
                );
                Err(Error::HandlerPanic(message))
            });

        destination.counters.record(start.elapsed(), result.is_err());
        if let Err(e) = &result {
            debug!(handler = %destination.handler_name, error = %e, "Handler dispatch failed");
        }
        result
    }

    /// States for every instance of every matching group, in table order
    fn per_instance_states(
        &self,
        session: &Arc<Session>,
        table: &RoutingTable,
        bag: &dyn Bag,
    ) -> Vec<DispatchState> {
        let destinations = table.get_destinations(session.variety, &session.namespace);
        let mut states = Vec::with_capacity(
            destinations
                .entries()
                .iter()
                .map(|d| d.max_instances())
                .sum(),
        );

        for destination in destinations.entries() {
            for group in matching_groups(destination, bag) {
                for (i, builder) in group.builders.iter().enumerate() {
                    let mut state = self
                        .states
                        .get(Some(Arc::clone(session)), Some(Arc::clone(destination)));
                    state.quota_args = session.quota_args.clone();
                    state.mapper = group.mappers.get(i).cloned();
                    match build_instance(builder, bag) {
                        Ok(instance) => state.instance = Some(instance),
                        Err(e) => state.err = Some(e),
                    }
                    states.push(state);
                }
            }
        }
        states
    }

    /// Collect the errors of a finished call, in encounter order
    fn take_errors(states: &mut [DispatchState]) -> DispatchErrors {
        let mut errors = DispatchErrors::new();
        for state in states.iter_mut() {
            if let Some(e) = state.err.take() {
                errors.push(e);
            }
        }
        errors
    }

    fn recycle(&self, states: Vec<DispatchState>) {
        for state in states {
            self.states.put(state);
        }
    }

    /// Admission check against every matching check handler
    ///
    /// Fails with the collected errors if any instance could not be built or
    /// any handler failed; otherwise returns the combined result.
    pub async fn check(&self, bag: &dyn Bag) -> Result<CheckResult> {
        let namespace = namespace_of(bag, &self.identity_attribute)?;
        let guard = self.acquire_table();
        let session = self.new_session(Variety::Check, namespace, &guard.table, QuotaArgs::default());

        let states = self.per_instance_states(&session, &guard.table, bag);
        let mut states = join_all(states.into_iter().map(|s| self.check_attempt(s, bag))).await;

        let errors = Self::take_errors(&mut states);
        let result = if errors.is_empty() {
            Ok(combine_check_results(
                states.iter().map(|s| (s.friendly_name(), &s.check_result)),
            ))
        } else {
            Err(Error::Dispatch(errors))
        };
        self.recycle(states);
        result
    }

    async fn check_attempt(&self, mut state: DispatchState, bag: &dyn Bag) -> DispatchState {
        let (Some(destination), Some(instance)) = (state.destination.clone(), state.instance.take())
        else {
            return state;
        };

        match self
            .invoke(&destination, destination.handler.check(bag, instance))
            .await
        {
            Ok(result) => state.check_result = result,
            Err(e) => state.err = Some(e),
        }
        state
    }

    /// Quota allocation against every matching quota handler
    pub async fn quota(&self, bag: &dyn Bag, args: &QuotaMethodArgs) -> Result<QuotaResult> {
        let namespace = namespace_of(bag, &self.identity_attribute)?;
        let guard = self.acquire_table();
        let session = self.new_session(Variety::Quota, namespace, &guard.table, QuotaArgs::from(args));

        let states = self.per_instance_states(&session, &guard.table, bag);
        let mut states = join_all(states.into_iter().map(|s| self.quota_attempt(s))).await;

        let errors = Self::take_errors(&mut states);
        let result = if errors.is_empty() {
            Ok(combine_quota_results(
                states.iter().map(|s| (s.friendly_name(), &s.quota_result)),
            ))
        } else {
            Err(Error::Dispatch(errors))
        };
        self.recycle(states);
        result
    }

    async fn quota_attempt(&self, mut state: DispatchState) -> DispatchState {
        let (Some(destination), Some(instance)) = (state.destination.clone(), state.instance.take())
        else {
            return state;
        };

        let args = state.quota_args.clone();
        match self
            .invoke(&destination, destination.handler.quota(instance, args))
            .await
        {
            Ok(result) => state.quota_result = result,
            Err(e) => state.err = Some(e),
        }
        state
    }

    /// Telemetry to every matching report handler
    ///
    /// The instances of one destination are sent in a single batch. A failing
    /// destination does not stop the others; all errors are returned together.
    pub async fn report(&self, bag: &dyn Bag) -> Result<()> {
        let namespace = namespace_of(bag, &self.identity_attribute)?;
        let guard = self.acquire_table();
        let session = self.new_session(Variety::Report, namespace, &guard.table, QuotaArgs::default());

        let destinations = guard.table.get_destinations(Variety::Report, &session.namespace);
        let mut batches = Vec::with_capacity(destinations.count());
        for destination in destinations.entries() {
            let mut state = self
                .states
                .get(Some(Arc::clone(&session)), Some(Arc::clone(destination)));
            for group in matching_groups(destination, bag) {
                for builder in &group.builders {
                    match build_instance(builder, bag) {
                        Ok(instance) => state.instances.push(instance),
                        Err(e) => {
                            state.err = Some(e);
                            break;
                        }
                    }
                }
                if state.err.is_some() {
                    break;
                }
            }

            if state.instances.is_empty() && state.err.is_none() {
                self.states.put(state);
                continue;
            }
            batches.push(state);
        }

        let mut states = join_all(batches.into_iter().map(|s| self.report_attempt(s))).await;
        let errors = Self::take_errors(&mut states);
        self.recycle(states);
        errors.into_result()
    }

    async fn report_attempt(&self, mut state: DispatchState) -> DispatchState {
        let Some(destination) = state.destination.clone() else {
            return state;
        };
        if state.err.is_some() {
            return state;
        }

        // The batch stays in the pooled state and is cleared when it is recycled.
        let result = self
            .invoke(&destination, destination.handler.report(&state.instances))
            .await;
        if let Err(e) = result {
            state.err = Some(e);
        }
        state
    }

    /// Run every matching attribute generator and write the mapped outputs
    ///
    /// Outputs of successful generators are written to `output` in table
    /// order even when another generator fails; nothing is rolled back.
    pub async fn preprocess(&self, bag: &dyn Bag, output: &mut MutableBag) -> Result<()> {
        let namespace = namespace_of(bag, &self.identity_attribute)?;
        let guard = self.acquire_table();
        let session = self.new_session(
            Variety::AttributeGenerator,
            namespace,
            &guard.table,
            QuotaArgs::default(),
        );

        let states = self.per_instance_states(&session, &guard.table, bag);
        let mut states = join_all(states.into_iter().map(|s| self.preprocess_attempt(s))).await;

        for state in states.iter_mut() {
            if let Some(generated) = state.output_bag.take() {
                output.merge(&generated);
            }
        }

        let errors = Self::take_errors(&mut states);
        self.recycle(states);
        errors.into_result()
    }

    async fn preprocess_attempt(&self, mut state: DispatchState) -> DispatchState {
        let (Some(destination), Some(instance)) = (state.destination.clone(), state.instance.take())
        else {
            return state;
        };

        let handler = Arc::clone(&destination.handler);
        let mapper = state.mapper.clone();
        let generate = async move {
            let generated = handler.generate_attributes(instance).await?;
            match mapper {
                Some(mapper) => mapper.map(&generated),
                None => Ok(MutableBag::new()),
            }
        };

        match self.invoke(&destination, generate).await {
            Ok(mapped) => state.output_bag = Some(mapped),
            Err(e) => state.err = Some(e),
        }
        state
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity_attribute", &self.identity_attribute)
            .field("table", &self.current_table().id())
            .field("max_workers", &self.pool.max_workers())
            .field("debug_info", &self.debug_info)
            .finish()
    }
}
