//! Pooled per-attempt scratch records
//!
//! Every handler invocation of a dispatch call carries a `DispatchState`
//! from the moment its instance is built until its result is combined.
//! Records are recycled through a `DispatchStatePool` so the hot path does
//! not reallocate the instance vector on every call.

use attrmesh_core::{
    Error,
    adapter::{CheckResult, Instance, QuotaArgs, QuotaResult},
    attribute::MutableBag,
    template::OutputMapper,
};
use attrmesh_routing::Destination;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::session::Session;

/// Scratch record of a single dispatch attempt
#[derive(Debug, Default)]
pub struct DispatchState {
    pub session: Option<Arc<Session>>,
    pub destination: Option<Arc<Destination>>,

    /// Instance of a check, quota or attribute generation attempt
    pub instance: Option<Instance>,
    /// Batched instances of a report attempt
    pub instances: Vec<Instance>,

    pub quota_args: QuotaArgs,
    pub mapper: Option<Arc<OutputMapper>>,

    pub check_result: CheckResult,
    pub quota_result: QuotaResult,
    /// Mapped attributes produced by attribute generation
    pub output_bag: Option<MutableBag>,
    pub err: Option<Error>,
}

impl DispatchState {
    /// Reset every field, keeping the capacity of `instances`
    pub fn clear(&mut self) {
        self.session = None;
        self.destination = None;
        self.instance = None;
        self.instances.clear();
        self.quota_args = QuotaArgs::default();
        self.mapper = None;
        self.check_result = CheckResult::default();
        self.quota_result = QuotaResult::default();
        self.output_bag = None;
        self.err = None;
    }

    /// Name used for this attempt in combined results
    pub fn friendly_name(&self) -> &str {
        self.destination
            .as_ref()
            .map(|d| d.friendly_name.as_str())
            .unwrap_or_default()
    }
}

/// Free list of dispatch states
#[derive(Clone)]
pub struct DispatchStatePool {
    pool: Arc<Mutex<Vec<DispatchState>>>,
    max_capacity: usize,
}

impl DispatchStatePool {
    /// Create a pool keeping at most `max_capacity` idle states
    pub fn new(max_capacity: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(Vec::with_capacity(max_capacity))),
            max_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DispatchState>> {
        // States are cleared before they enter the pool, so a poisoned list is still valid.
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a cleared state bound to a session and destination
    pub fn get(
        &self,
        session: Option<Arc<Session>>,
        destination: Option<Arc<Destination>>,
    ) -> DispatchState {
        let mut state = self.lock().pop().unwrap_or_default();
        state.session = session;
        state.destination = destination;
        state
    }

    /// Clear a state and return it to the pool
    pub fn put(&self, mut state: DispatchState) {
        state.clear();

        let mut pool = self.lock();
        if pool.len() < self.max_capacity {
            pool.push(state);
        }
    }

    /// Number of idle states
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for DispatchStatePool {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrmesh_core::template::Variety;

    fn session() -> Arc<Session> {
        Arc::new(Session {
            id: 1,
            variety: Variety::Check,
            namespace: "istio-system".to_string(),
            table_id: 1,
            quota_args: QuotaArgs::default(),
        })
    }

    fn assert_cleared(state: &DispatchState) {
        assert!(state.session.is_none());
        assert!(state.destination.is_none());
        assert!(state.instance.is_none());
        assert!(state.instances.is_empty());
        assert_eq!(state.quota_args, QuotaArgs::default());
        assert!(state.mapper.is_none());
        assert_eq!(state.check_result, CheckResult::default());
        assert_eq!(state.quota_result, QuotaResult::default());
        assert!(state.output_bag.is_none());
        assert!(state.err.is_none());
    }

    #[test]
    fn test_pool_returns_cleared_states() {
        let pool = DispatchStatePool::new(100);

        // Prime the pool
        let states: Vec<_> = (0..100).map(|_| pool.get(None, None)).collect();
        for state in states {
            pool.put(state);
        }
        assert_eq!(pool.len(), 100);

        let states: Vec<_> = (0..100)
            .map(|_| {
                let mut state = pool.get(Some(session()), None);
                state.instance = Some(Instance::new("instanc", "tcheck"));
                state.err = Some(Error::Handler("err".to_string()));
                state
            })
            .collect();
        for state in states {
            pool.put(state);
        }

        for _ in 0..100 {
            assert_cleared(&pool.get(None, None));
        }
    }

    #[test]
    fn test_get_sets_identity_fields() {
        let pool = DispatchStatePool::default();
        let state = pool.get(Some(session()), None);
        assert_eq!(state.session.as_deref().map(|s| s.id), Some(1));
        assert_eq!(state.friendly_name(), "");
    }

    #[test]
    fn test_clear_keeps_instance_capacity() {
        let mut state = DispatchState {
            instance: Some(Instance::new("instance", "tcheck")),
            session: Some(session()),
            quota_result: QuotaResult {
                amount: 64,
                ..Default::default()
            },
            check_result: CheckResult {
                valid_use_count: 32,
                ..Default::default()
            },
            err: Some(Error::Handler("err".to_string())),
            output_bag: Some(MutableBag::new()),
            quota_args: QuotaArgs {
                best_effort: true,
                ..Default::default()
            },
            mapper: Some(Arc::new(OutputMapper::default())),
            instances: vec![Instance::default(); 10],
            ..Default::default()
        };

        state.clear();

        assert_cleared(&state);
        assert!(state.instances.capacity() >= 10);
    }

    #[test]
    fn test_pool_max_capacity() {
        let pool = DispatchStatePool::new(3);
        for _ in 0..5 {
            pool.put(DispatchState::default());
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_pool_concurrent_access() {
        use std::thread;

        let pool = DispatchStatePool::new(10);
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let state = pool.get(None, None);
                        pool.put(state);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() <= 10);
    }
}
