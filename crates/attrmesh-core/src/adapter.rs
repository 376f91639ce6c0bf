//! Adapter and handler contracts
//!
//! An adapter is a factory for handlers. A handler is a live, configured
//! back-end that accepts instances for one or more templates. Which entry
//! point is used depends on the variety of the template an instance belongs to.

use crate::{
    Error, Result,
    attribute::{Bag, MutableBag, Value},
    status::Status,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A per-template value built from a request's attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instance {
    /// Fully-qualified instance name
    pub name: String,
    /// Name of the template the instance was built for
    pub template: String,
    /// Field values, keyed by field name
    pub fields: BTreeMap<String, Value>,
}

impl Instance {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Struct{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Result of a check call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Status of the check
    pub status: Status,
    /// How long the result may be cached
    pub valid_duration: Duration,
    /// How many uses the result is valid for
    pub valid_use_count: i32,
}

/// Result of a quota allocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaResult {
    pub status: Status,
    pub valid_duration: Duration,
    /// Amount granted
    pub amount: i64,
}

/// Arguments handed to a quota handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaArgs {
    pub deduplication_id: String,
    pub quota_amount: i64,
    pub best_effort: bool,
}

/// Arguments of a quota call as received by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaMethodArgs {
    /// Used to deduplicate retried quota requests
    pub deduplication_id: String,
    /// Amount of quota requested
    pub amount: i64,
    /// If true, a partial grant is acceptable
    pub best_effort: bool,
}

impl From<&QuotaMethodArgs> for QuotaArgs {
    fn from(args: &QuotaMethodArgs) -> Self {
        QuotaArgs {
            deduplication_id: args.deduplication_id.clone(),
            quota_amount: args.amount,
            best_effort: args.best_effort,
        }
    }
}

/// A configured back-end
///
/// Each entry point serves one template variety. Adapters implement only the
/// entry points for the varieties they support; the rest report `Unsupported`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Admission check for a single instance
    async fn check(&self, _bag: &dyn Bag, _instance: Instance) -> Result<CheckResult> {
        Err(Error::Unsupported("check"))
    }

    /// Telemetry for a batch of instances
    async fn report(&self, _instances: &[Instance]) -> Result<()> {
        Err(Error::Unsupported("report"))
    }

    /// Quota allocation for a single instance
    async fn quota(&self, _instance: Instance, _args: QuotaArgs) -> Result<QuotaResult> {
        Err(Error::Unsupported("quota"))
    }

    /// Attribute generation for a single instance
    async fn generate_attributes(&self, _instance: Instance) -> Result<MutableBag> {
        Err(Error::Unsupported("attribute generation"))
    }

    /// Release resources held by the handler
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Services offered by the runtime to a handler
pub trait Env: Send + Sync {
    /// Fully-qualified name of the handler this environment belongs to
    fn handler_name(&self) -> &str;

    /// Run a short-lived unit of work on the handler pool
    fn schedule_work(&self, work: BoxFuture<'static, ()>);

    /// Run a long-lived background task on the handler pool
    fn schedule_daemon(&self, work: BoxFuture<'static, ()>);
}

/// Builds handlers for an adapter from handler parameters
pub trait HandlerBuilder: Send + Sync {
    fn build(&self, params: &serde_json::Value, env: Arc<dyn Env>) -> Result<Arc<dyn Handler>>;
}

/// Static description of an adapter
#[derive(Clone)]
pub struct AdapterInfo {
    /// Adapter name, used as the handler kind in configuration
    pub name: String,
    pub description: String,
    /// Names of the templates handlers of this adapter accept
    pub supported_templates: Vec<String>,
    pub builder: Arc<dyn HandlerBuilder>,
}

impl AdapterInfo {
    pub fn supports(&self, template: &str) -> bool {
        self.supported_templates.iter().any(|t| t == template)
    }
}

impl fmt::Debug for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterInfo")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("supported_templates", &self.supported_templates)
            .finish()
    }
}

/// Known adapters, keyed by name
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<AdapterInfo>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: AdapterInfo) {
        self.adapters.insert(info.name.clone(), Arc::new(info));
    }

    pub fn get(&self, name: &str) -> Option<Arc<AdapterInfo>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl FromIterator<AdapterInfo> for AdapterRegistry {
    fn from_iter<I: IntoIterator<Item = AdapterInfo>>(iter: I) -> Self {
        let mut registry = AdapterRegistry::new();
        for info in iter {
            registry.register(info);
        }
        registry
    }
}
