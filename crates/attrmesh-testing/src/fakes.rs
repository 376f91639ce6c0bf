//! Fake templates, adapters and handlers
//!
//! Behaviour is configured per template through [`FakeTemplateSettings`].
//! Templates and handlers look the settings up by template name, so one
//! handler serving several templates behaves differently for each of them.

use async_trait::async_trait;
use attrmesh_core::{
    Error, Result,
    adapter::{
        AdapterInfo, AdapterRegistry, CheckResult, Env, Handler, HandlerBuilder, Instance, QuotaArgs,
        QuotaResult,
    },
    attribute::{Bag, MutableBag},
    config::{ConfigDocument, Snapshot},
    expr::{AttributeManifest, CompilerFactory, Expression, ExpressionCompiler},
    template::{DynamicTemplate, InstanceBuilder, Template, TemplateRegistry, Variety},
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

use crate::{CallLog, TestExpressionCompiler};

/// Holds a handler call until the test releases it
///
/// The handler signals on entry, then blocks until `release` is called.
#[derive(Debug)]
pub struct Gate {
    received: Semaphore,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.received.add_permits(1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }

    /// Wait until a handler call is blocked on the gate
    pub async fn wait_received(&self) {
        if let Ok(permit) = self.received.acquire().await {
            permit.forget();
        }
    }

    /// Let one blocked call continue
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

/// Behaviour of one fake template and of handlers dispatching its instances
#[derive(Debug, Clone)]
pub struct FakeTemplateSettings {
    pub name: String,
    pub variety: Variety,
    /// Fail while the routing table compiles the instance params
    pub error_at_create_builder: bool,
    /// Fail every time an instance is built at dispatch
    pub error_at_create_instance: bool,
    pub error_on_dispatch: bool,
    pub panic_on_dispatch: bool,
    pub check_result: CheckResult,
    /// Check results by instance name, overriding `check_result`
    pub check_results: BTreeMap<String, CheckResult>,
    pub quota_result: QuotaResult,
    /// Quota results by instance name, overriding `quota_result`
    pub quota_results: BTreeMap<String, QuotaResult>,
    /// Result bag of attribute generation
    pub output_attrs: MutableBag,
    pub gate: Option<Arc<Gate>>,
}

impl FakeTemplateSettings {
    pub fn new(name: impl Into<String>, variety: Variety) -> Self {
        Self {
            name: name.into(),
            variety,
            error_at_create_builder: false,
            error_at_create_instance: false,
            error_on_dispatch: false,
            panic_on_dispatch: false,
            check_result: CheckResult::default(),
            check_results: BTreeMap::new(),
            quota_result: QuotaResult::default(),
            quota_results: BTreeMap::new(),
            output_attrs: MutableBag::new(),
            gate: None,
        }
    }

    fn check_result_for(&self, instance: &str) -> CheckResult {
        self.check_results
            .get(instance)
            .cloned()
            .unwrap_or_else(|| self.check_result.clone())
    }

    fn quota_result_for(&self, instance: &str) -> QuotaResult {
        self.quota_results
            .get(instance)
            .cloned()
            .unwrap_or_else(|| self.quota_result.clone())
    }
}

type SettingsMap = Arc<HashMap<String, Arc<FakeTemplateSettings>>>;

/// Template wrapping [`DynamicTemplate`] with call logging and fault injection
pub struct FakeTemplate {
    settings: Arc<FakeTemplateSettings>,
    inner: DynamicTemplate,
    log: CallLog,
}

impl FakeTemplate {
    pub fn new(settings: Arc<FakeTemplateSettings>, log: CallLog) -> Self {
        Self {
            inner: DynamicTemplate::new(settings.name.clone(), settings.variety),
            settings,
            log,
        }
    }
}

impl Template for FakeTemplate {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn variety(&self) -> Variety {
        self.settings.variety
    }

    fn create_instance_builder(
        &self,
        instance_name: &str,
        params: &serde_json::Value,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<InstanceBuilder> {
        self.log.record(format!(
            "[{}] create_instance_builder => instance: '{}'",
            self.settings.name, instance_name
        ));
        if self.settings.error_at_create_builder {
            return Err(Error::InstanceBuild(
                "error at create instance builder, as expected".to_string(),
            ));
        }

        let inner = self.inner.create_instance_builder(instance_name, params, compiler)?;
        let settings = Arc::clone(&self.settings);
        let log = self.log.clone();
        let name = instance_name.to_string();
        Ok(Arc::new(move |bag: &dyn Bag| {
            log.record(format!(
                "[{}] build_instance => name: '{}', bag: '{}'",
                settings.name,
                name,
                MutableBag::from_bag(bag)
            ));
            if settings.error_at_create_instance {
                return Err(Error::InstanceBuild("error at create instance, as expected".to_string()));
            }
            inner(bag)
        }))
    }

    fn create_output_expressions(
        &self,
        params: &serde_json::Value,
        manifest: &AttributeManifest,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<HashMap<String, Arc<dyn Expression>>> {
        self.inner.create_output_expressions(params, manifest, compiler)
    }
}

/// Handler that answers from the settings of each instance's template
pub struct FakeHandler {
    name: String,
    settings: SettingsMap,
    log: CallLog,
    closed: AtomicBool,
}

impl FakeHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Apply the gate and the injected failures of a template
    async fn enter(&self, template: &str, kind: &str) -> Result<Option<Arc<FakeTemplateSettings>>> {
        let Some(settings) = self.settings.get(template).cloned() else {
            return Ok(None);
        };
        if let Some(gate) = &settings.gate {
            gate.pass().await;
        }
        if settings.panic_on_dispatch {
            panic!("panic at dispatch {}, as expected", kind);
        }
        if settings.error_on_dispatch {
            return Err(Error::Handler(format!("error at dispatch {}, as expected", kind)));
        }
        Ok(Some(settings))
    }
}

#[async_trait]
impl Handler for FakeHandler {
    async fn check(&self, _bag: &dyn Bag, instance: Instance) -> Result<CheckResult> {
        self.log.record(format!("[{}] check => instance: '{}' {}", self.name, instance.name, instance));
        let settings = self.enter(&instance.template, "check").await?;
        Ok(settings.map(|s| s.check_result_for(&instance.name)).unwrap_or_default())
    }

    async fn report(&self, instances: &[Instance]) -> Result<()> {
        let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        self.log.record(format!("[{}] report => instances: {:?}", self.name, names));
        if let Some(first) = instances.first() {
            self.enter(&first.template, "report").await?;
        }
        Ok(())
    }

    async fn quota(&self, instance: Instance, args: QuotaArgs) -> Result<QuotaResult> {
        self.log.record(format!(
            "[{}] quota => instance: '{}', amount: {}, dedup: '{}', best_effort: {}",
            self.name, instance.name, args.quota_amount, args.deduplication_id, args.best_effort
        ));
        let settings = self.enter(&instance.template, "quota").await?;
        Ok(settings.map(|s| s.quota_result_for(&instance.name)).unwrap_or_default())
    }

    async fn generate_attributes(&self, instance: Instance) -> Result<MutableBag> {
        self.log.record(format!(
            "[{}] generate_attributes => instance: '{}' {}",
            self.name, instance.name, instance
        ));
        let settings = self.enter(&instance.template, "attribute generation").await?;
        Ok(settings.map(|s| s.output_attrs.clone()).unwrap_or_default())
    }

    fn close(&self) -> Result<()> {
        self.log.record(format!("[{}] close", self.name));
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Adapter building [`FakeHandler`]s
#[derive(Clone)]
pub struct FakeAdapter {
    name: String,
    templates: Vec<String>,
    settings: SettingsMap,
    log: CallLog,
    error_at_build: bool,
}

impl FakeAdapter {
    pub fn info(self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            description: format!("fake adapter {}", self.name),
            supported_templates: self.templates.clone(),
            builder: Arc::new(self),
        }
    }
}

impl HandlerBuilder for FakeAdapter {
    fn build(&self, _params: &serde_json::Value, env: Arc<dyn Env>) -> Result<Arc<dyn Handler>> {
        self.log
            .record(format!("[{}] build => handler: '{}'", self.name, env.handler_name()));
        if self.error_at_build {
            return Err(Error::Handler("error at handler build, as expected".to_string()));
        }
        Ok(Arc::new(FakeHandler {
            name: env.handler_name().to_string(),
            settings: Arc::clone(&self.settings),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Registries of the standard fakes sharing one call log
///
/// | adapter  | template | variety             |
/// |----------|----------|---------------------|
/// | `acheck` | `tcheck` | check               |
/// | `areport`| `treport`| report              |
/// | `aquota` | `tquota` | quota               |
/// | `apa`    | `tapa`   | attribute generator |
pub struct Harness {
    pub log: CallLog,
    pub templates: TemplateRegistry,
    pub adapters: AdapterRegistry,
}

const STANDARD: [(&str, &str, Variety); 4] = [
    ("acheck", "tcheck", Variety::Check),
    ("areport", "treport", Variety::Report),
    ("aquota", "tquota", Variety::Quota),
    ("apa", "tapa", Variety::AttributeGenerator),
];

impl Harness {
    /// Standard fakes, with `overrides` replacing the settings of the
    /// templates they name
    pub fn new(overrides: Vec<FakeTemplateSettings>) -> Self {
        Self::build(overrides, &[])
    }

    /// Like [`Harness::new`], with the named adapters failing to build handlers
    pub fn with_failing_adapters(overrides: Vec<FakeTemplateSettings>, failing: &[&str]) -> Self {
        Self::build(overrides, failing)
    }

    fn build(overrides: Vec<FakeTemplateSettings>, failing: &[&str]) -> Self {
        let log = CallLog::new();
        let mut by_name: HashMap<String, Arc<FakeTemplateSettings>> = STANDARD
            .iter()
            .map(|(_, t, v)| (t.to_string(), Arc::new(FakeTemplateSettings::new(*t, *v))))
            .collect();
        for settings in overrides {
            by_name.insert(settings.name.clone(), Arc::new(settings));
        }

        let mut templates = TemplateRegistry::new();
        for settings in by_name.values() {
            templates.register(Arc::new(FakeTemplate::new(Arc::clone(settings), log.clone())));
        }

        let settings: SettingsMap = Arc::new(by_name);
        let adapters = STANDARD
            .iter()
            .map(|(adapter, template, _)| {
                FakeAdapter {
                    name: adapter.to_string(),
                    templates: vec![template.to_string()],
                    settings: Arc::clone(&settings),
                    log: log.clone(),
                    error_at_build: failing.contains(adapter),
                }
                .info()
            })
            .collect();

        Self {
            log,
            templates,
            adapters,
        }
    }

    pub fn snapshot(&self, id: i64, doc: &ConfigDocument) -> Snapshot {
        Snapshot::resolve(id, doc, &self.templates, &self.adapters)
    }

    /// Compiler typed by the document's attribute manifest
    pub fn compiler(doc: &ConfigDocument) -> TestExpressionCompiler {
        TestExpressionCompiler::new(doc.attributes.clone())
    }

    /// Factory building a [`TestExpressionCompiler`] per manifest
    pub fn compiler_factory() -> CompilerFactory {
        Arc::new(|manifest: &AttributeManifest| -> Arc<dyn ExpressionCompiler> {
            Arc::new(TestExpressionCompiler::new(manifest.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrmesh_core::status::{Code, Status};
    use futures::future::BoxFuture;

    struct NamedEnv(&'static str);

    impl Env for NamedEnv {
        fn handler_name(&self) -> &str {
            self.0
        }
        fn schedule_work(&self, _work: BoxFuture<'static, ()>) {}
        fn schedule_daemon(&self, _work: BoxFuture<'static, ()>) {}
    }

    fn handler(h: &Harness, adapter: &str) -> Arc<dyn Handler> {
        h.adapters
            .get(adapter)
            .unwrap()
            .builder
            .build(&serde_json::Value::Null, Arc::new(NamedEnv("h1.acheck.istio-system")))
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_uses_template_settings() {
        let mut settings = FakeTemplateSettings::new("tcheck", Variety::Check);
        settings.check_result.status = Status::with_message(Code::DataLoss, "details");
        let h = Harness::new(vec![settings]);

        let result = handler(&h, "acheck")
            .check(&MutableBag::new(), Instance::new("i1", "tcheck"))
            .await
            .unwrap();

        assert_eq!(result.status.code, Code::DataLoss);
        assert_eq!(
            h.log.entries(),
            vec![
                "[acheck] build => handler: 'h1.acheck.istio-system'".to_string(),
                "[h1.acheck.istio-system] check => instance: 'i1' Struct{}".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_error() {
        let mut settings = FakeTemplateSettings::new("treport", Variety::Report);
        settings.error_on_dispatch = true;
        let h = Harness::new(vec![settings]);

        let err = handler(&h, "areport")
            .report(&[Instance::new("i1", "treport")])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "error at dispatch report, as expected");
    }

    #[tokio::test]
    async fn test_failing_adapter() {
        let h = Harness::with_failing_adapters(vec![], &["aquota"]);
        let built = h
            .adapters
            .get("aquota")
            .unwrap()
            .builder
            .build(&serde_json::Value::Null, Arc::new(NamedEnv("h")));
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn test_gate_blocks_until_released() {
        let gate = Gate::new();
        let mut settings = FakeTemplateSettings::new("tcheck", Variety::Check);
        settings.gate = Some(Arc::clone(&gate));
        let h = Harness::new(vec![settings]);
        let handler = handler(&h, "acheck");

        let call = tokio::spawn(async move {
            handler
                .check(&MutableBag::new(), Instance::new("i1", "tcheck"))
                .await
        });

        gate.wait_received().await;
        assert!(!call.is_finished());
        gate.release();
        assert!(call.await.unwrap().is_ok());
    }
}
