use attrmesh_core::{
    Error,
    adapter::{CheckResult, QuotaMethodArgs, QuotaResult},
    attribute::{Bag, MutableBag, Value},
    config::{ConfigDocument, DEFAULT_NAMESPACE},
    pool::WorkerPool,
    status::{Code, Status},
    template::Variety,
};
use attrmesh_dispatcher::Dispatcher;
use attrmesh_handler::HandlerTable;
use attrmesh_observability::Metrics;
use attrmesh_routing::{RoutingTable, build_table};
use attrmesh_testing::{FakeTemplateSettings, Gate, Harness, fixtures::*};
use std::sync::Arc;
use std::time::Duration;

const HCHECK1: &str = "hcheck1.acheck.istio-system";
const HCHECK2: &str = "hcheck2.acheck.istio-system";

fn table_for(harness: &Harness, id: i64, doc: &ConfigDocument, metrics: &Metrics) -> RoutingTable {
    let snapshot = harness.snapshot(id, doc);
    let handlers = HandlerTable::new(&HandlerTable::empty(), &snapshot, &WorkerPool::new(4), metrics);
    build_table(&snapshot, &handlers, &Harness::compiler(doc), DEFAULT_NAMESPACE, true, metrics)
}

fn setup(overrides: Vec<FakeTemplateSettings>, parts: &[&str]) -> (Arc<Dispatcher>, Harness) {
    let harness = Harness::new(overrides);
    let metrics = Metrics::new().unwrap();
    let table = table_for(&harness, 1, &document(parts).unwrap(), &metrics);

    let dispatcher = Dispatcher::new("ident", WorkerPool::new(16), true, metrics);
    dispatcher.change_route(Arc::new(table));
    harness.log.clear();
    (Arc::new(dispatcher), harness)
}

fn bag(ident: &str) -> MutableBag {
    [("ident", ident)].into_iter().collect()
}

fn settings(name: &str, variety: Variety) -> FakeTemplateSettings {
    FakeTemplateSettings::new(name, variety)
}

#[tokio::test]
async fn test_basic_check() {
    let (d, h) = setup(vec![], &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1]);

    let result = d.check(&bag("dest.istio-system")).await.unwrap();

    assert_eq!(result, CheckResult::default());
    assert_eq!(
        h.log.filtered("[hcheck1"),
        vec!["[hcheck1.acheck.istio-system] check => instance: 'icheck1.tcheck.istio-system' Struct{}".to_string()]
    );
    assert_eq!(h.log.filtered("[tcheck] build_instance").len(), 1);
    assert_eq!(d.current_table().get_refs(), 0);
}

#[tokio::test]
async fn test_check_instance_fields() {
    let (d, h) = setup(
        vec![],
        &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK_IDENT, RULE_CHECK_IDENT],
    );

    d.check(&bag("dest.istio-system")).await.unwrap();

    assert_eq!(
        h.log.filtered("[hcheck1"),
        vec![
            "[hcheck1.acheck.istio-system] check => instance: 'icheckident.tcheck.istio-system' Struct{ident: dest.istio-system}"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn test_check_error() {
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.error_on_dispatch = true;
    let (d, _h) = setup(vec![tcheck], &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1]);

    let err = d.check(&bag("dest.istio-system")).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "1 error occurred:\n\n* error at dispatch check, as expected"
    );
    assert_eq!(d.current_table().get_refs(), 0);
}

#[tokio::test]
async fn test_check_instance_build_error() {
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.error_at_create_instance = true;
    let (d, h) = setup(vec![tcheck], &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1]);

    let err = d.check(&bag("dest.istio-system")).await.unwrap_err();
    assert!(err.to_string().contains("error at create instance, as expected"));
    // The handler is never reached.
    assert!(h.log.filtered("[hcheck1").is_empty());
}

#[tokio::test]
async fn test_check_results_take_minimums() {
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.check_results.insert(
        "icheck1.tcheck.istio-system".to_string(),
        CheckResult {
            valid_use_count: 10,
            valid_duration: Duration::from_secs(60),
            ..Default::default()
        },
    );
    tcheck.check_results.insert(
        "icheck2.tcheck.istio-system".to_string(),
        CheckResult {
            valid_use_count: 20,
            valid_duration: Duration::from_millis(1),
            ..Default::default()
        },
    );
    let (d, _h) = setup(
        vec![tcheck],
        &[
            ATTRIBUTES,
            HANDLER_ACHECK1,
            HANDLER_ACHECK2,
            INSTANCE_CHECK1,
            INSTANCE_CHECK2,
            RULE_CHECK1,
            RULE_CHECK2,
        ],
    );

    let result = d.check(&bag("dest.istio-system")).await.unwrap();
    assert_eq!(
        result,
        CheckResult {
            status: Status::ok(),
            valid_use_count: 10,
            valid_duration: Duration::from_millis(1),
        }
    );
}

#[tokio::test]
async fn test_check_statuses_combine_in_table_order() {
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.check_results.insert(
        "icheck1.tcheck.istio-system".to_string(),
        CheckResult {
            status: Status::with_message(Code::DataLoss, "msg1"),
            ..Default::default()
        },
    );
    tcheck.check_results.insert(
        "icheck2.tcheck.istio-system".to_string(),
        CheckResult {
            status: Status::with_message(Code::DeadlineExceeded, "msg2"),
            ..Default::default()
        },
    );
    let (d, _h) = setup(
        vec![tcheck],
        &[
            ATTRIBUTES,
            HANDLER_ACHECK1,
            HANDLER_ACHECK2,
            INSTANCE_CHECK1,
            INSTANCE_CHECK2,
            RULE_CHECK1,
            RULE_CHECK2,
        ],
    );

    let result = d.check(&bag("dest.istio-system")).await.unwrap();
    assert_eq!(result.status.code, Code::DataLoss);
    assert_eq!(
        result.status.message,
        format!("{}:msg1, {}:msg2", HCHECK1, HCHECK2)
    );
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.panic_on_dispatch = true;
    let (d, h) = setup(
        vec![tcheck],
        &[
            ATTRIBUTES,
            HANDLER_ACHECK1,
            HANDLER_AREPORT1,
            INSTANCE_CHECK1,
            INSTANCE_REPORT1,
            INSTANCE_REPORT2,
            RULE_CHECK1,
            RULE_REPORT1,
        ],
    );

    for _ in 0..2 {
        let err = d.check(&bag("dest.istio-system")).await.unwrap_err();
        assert!(err.to_string().contains("panic during handler dispatch:"));
        assert!(err.to_string().contains("panic at dispatch check, as expected"));
    }
    assert_eq!(d.current_table().get_refs(), 0);

    // Unrelated calls keep working.
    d.report(&bag("dest.istio-system")).await.unwrap();
    assert_eq!(h.log.filtered("[hreport1").len(), 1);
}

#[tokio::test]
async fn test_identity_attribute_must_be_a_string() {
    let (d, h) = setup(
        vec![],
        &[
            ATTRIBUTES,
            HANDLER_ACHECK1,
            HANDLER_AQUOTA1,
            HANDLER_AREPORT1,
            INSTANCE_CHECK1,
            INSTANCE_QUOTA1,
            INSTANCE_REPORT1,
            INSTANCE_REPORT2,
            RULE_CHECK1,
            RULE_QUOTA1,
            RULE_REPORT1,
        ],
    );
    let mut bag = MutableBag::new();
    bag.set("ident", 23i64);

    let expected = "identity parameter is not a string: 'ident'";
    assert_eq!(d.check(&bag).await.unwrap_err().to_string(), expected);
    assert_eq!(d.report(&bag).await.unwrap_err().to_string(), expected);
    assert_eq!(
        d.quota(&bag, &QuotaMethodArgs::default())
            .await
            .unwrap_err()
            .to_string(),
        expected
    );
    let err = d.preprocess(&bag, &mut MutableBag::new()).await.unwrap_err();
    assert!(matches!(err, Error::IdentityNotString(_)));

    assert!(h.log.is_empty());
}

#[tokio::test]
async fn test_match_condition_gates_dispatch() {
    let (d, h) = setup(
        vec![],
        &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1_MATCH_FOO],
    );

    let mut request = bag("dest.istio-system");
    request.set("destination.name", "barf");
    assert_eq!(d.check(&request).await.unwrap(), CheckResult::default());
    assert!(h.log.filtered("[hcheck1").is_empty());

    request.set("destination.name", "foobar");
    d.check(&request).await.unwrap();
    assert_eq!(h.log.filtered("[hcheck1").len(), 1);
}

#[tokio::test]
async fn test_namespace_sees_default_destinations_first() {
    let (d, h) = setup(
        vec![],
        &[
            ATTRIBUTES,
            HANDLER_ACHECK1,
            HANDLER_ACHECK2,
            INSTANCE_CHECK1,
            INSTANCE_CHECK2,
            RULE_CHECK1,
            RULE_CHECK2_NS2,
        ],
    );

    d.check(&bag("dest.ns2")).await.unwrap();
    let calls: Vec<String> = h
        .log
        .filtered("[hcheck")
        .into_iter()
        .map(|entry| entry.split(']').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        calls,
        vec![format!("[{}", HCHECK1), format!("[{}", HCHECK2)]
    );

    h.log.clear();
    d.check(&bag("dest.other")).await.unwrap();
    assert_eq!(h.log.filtered("[hcheck").len(), 1);
    assert_eq!(h.log.filtered(&format!("[{}", HCHECK1)).len(), 1);
}

#[tokio::test]
async fn test_report_batches_instances_per_destination() {
    let (d, h) = setup(
        vec![],
        &[
            ATTRIBUTES,
            HANDLER_AREPORT1,
            INSTANCE_REPORT1,
            INSTANCE_REPORT2,
            RULE_REPORT1,
        ],
    );

    d.report(&bag("dest.istio-system")).await.unwrap();

    assert_eq!(
        h.log.filtered("[hreport1"),
        vec![
            "[hreport1.areport.istio-system] report => instances: [\"ireport1.treport.istio-system\", \"ireport2.treport.istio-system\"]"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn test_report_is_best_effort() {
    let mut treport = settings("treport", Variety::Report);
    treport.error_on_dispatch = true;
    let (d, h) = setup(
        vec![treport],
        &[
            ATTRIBUTES,
            HANDLER_AREPORT1,
            HANDLER_AREPORT2,
            INSTANCE_REPORT1,
            INSTANCE_REPORT2,
            RULE_REPORT1,
            RULE_REPORT2,
        ],
    );

    let err = d.report(&bag("dest.istio-system")).await.unwrap_err();

    // Both destinations were invoked and both failures are reported.
    assert_eq!(h.log.filtered("[hreport1").len(), 1);
    assert_eq!(h.log.filtered("[hreport2").len(), 1);
    assert_eq!(
        err.to_string(),
        "2 errors occurred:\n\n* error at dispatch report, as expected\n* error at dispatch report, as expected"
    );
}

#[tokio::test]
async fn test_quota_passes_arguments() {
    let mut tquota = settings("tquota", Variety::Quota);
    tquota.quota_result = QuotaResult {
        amount: 64,
        valid_duration: Duration::from_secs(5),
        ..Default::default()
    };
    let (d, h) = setup(
        vec![tquota],
        &[ATTRIBUTES, HANDLER_AQUOTA1, INSTANCE_QUOTA1, RULE_QUOTA1],
    );

    let args = QuotaMethodArgs {
        deduplication_id: "42".to_string(),
        amount: 64,
        best_effort: true,
    };
    let result = d.quota(&bag("dest.istio-system"), &args).await.unwrap();

    assert_eq!(result.amount, 64);
    assert_eq!(result.valid_duration, Duration::from_secs(5));
    assert_eq!(
        h.log.filtered("[hquota1"),
        vec![
            "[hquota1.aquota.istio-system] quota => instance: 'iquota1.tquota.istio-system', amount: 64, dedup: '42', best_effort: true"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn test_quota_results_combine() {
    let mut tquota = settings("tquota", Variety::Quota);
    tquota.quota_results.insert(
        "iquota1.tquota.istio-system".to_string(),
        QuotaResult {
            amount: 32,
            valid_duration: Duration::from_secs(60),
            ..Default::default()
        },
    );
    tquota.quota_results.insert(
        "iquota2.tquota.istio-system".to_string(),
        QuotaResult {
            amount: 64,
            valid_duration: Duration::from_secs(1),
            status: Status::with_message(Code::ResourceExhausted, "exhausted"),
        },
    );
    let (d, _h) = setup(
        vec![tquota],
        &[
            ATTRIBUTES,
            HANDLER_AQUOTA1,
            HANDLER_AQUOTA2,
            INSTANCE_QUOTA1,
            INSTANCE_QUOTA2,
            RULE_QUOTA1,
            RULE_QUOTA2,
        ],
    );

    let result = d
        .quota(&bag("dest.istio-system"), &QuotaMethodArgs::default())
        .await
        .unwrap();
    assert_eq!(result.amount, 32);
    assert_eq!(result.valid_duration, Duration::from_secs(1));
    assert_eq!(result.status.code, Code::ResourceExhausted);
    assert_eq!(result.status.message, "hquota2.aquota.istio-system:exhausted");
}

#[tokio::test]
async fn test_quota_error() {
    let mut tquota = settings("tquota", Variety::Quota);
    tquota.error_on_dispatch = true;
    let (d, _h) = setup(
        vec![tquota],
        &[ATTRIBUTES, HANDLER_AQUOTA1, INSTANCE_QUOTA1, RULE_QUOTA1],
    );

    let err = d
        .quota(&bag("dest.istio-system"), &QuotaMethodArgs::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "1 error occurred:\n\n* error at dispatch quota, as expected"
    );
}

#[tokio::test]
async fn test_preprocess_writes_mapped_attributes() {
    let mut tapa = settings("tapa", Variety::AttributeGenerator);
    tapa.output_attrs.set("generated_attr", "generated");
    let (d, h) = setup(vec![tapa], &[ATTRIBUTES, HANDLER_APA1, INSTANCE_APA1, RULE_APA1]);

    let mut output = MutableBag::new();
    d.preprocess(&bag("dest.istio-system"), &mut output).await.unwrap();

    assert_eq!(output.get("generated.attr"), Some(Value::from("generated")));
    assert_eq!(output.len(), 1);
    assert_eq!(h.log.filtered("[hapa1").len(), 1);
}

#[tokio::test]
async fn test_preprocess_error() {
    let mut tapa = settings("tapa", Variety::AttributeGenerator);
    tapa.error_on_dispatch = true;
    let (d, _h) = setup(vec![tapa], &[ATTRIBUTES, HANDLER_APA1, INSTANCE_APA1, RULE_APA1]);

    let mut output = MutableBag::new();
    let err = d
        .preprocess(&bag("dest.istio-system"), &mut output)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "1 error occurred:\n\n* error at dispatch attribute generation, as expected"
    );
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_preprocess_missing_output_fails() {
    // The handler result lacks `generated_attr`, so the mapper cannot evaluate.
    let (d, _h) = setup(vec![], &[ATTRIBUTES, HANDLER_APA1, INSTANCE_APA1, RULE_APA1]);

    let mut output = MutableBag::new();
    let err = d
        .preprocess(&bag("dest.istio-system"), &mut output)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("lookup failed: 'generated_attr'"));
}

#[tokio::test]
async fn test_in_flight_check_finishes_on_previous_table() {
    let gate = Gate::new();
    let mut tcheck = settings("tcheck", Variety::Check);
    tcheck.gate = Some(Arc::clone(&gate));
    let (d, h) = setup(vec![tcheck], &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1]);

    let in_flight = {
        let d = Arc::clone(&d);
        tokio::spawn(async move { d.check(&bag("dest.istio-system")).await })
    };
    gate.wait_received().await;

    // The new generation drops the check handler altogether.
    let metrics = Metrics::new().unwrap();
    let doc = document(&[ATTRIBUTES, HANDLER_AREPORT1, INSTANCE_REPORT1, INSTANCE_REPORT2, RULE_REPORT1]).unwrap();
    let old = d.change_route(Arc::new(table_for(&h, 2, &doc, &metrics)));

    assert_eq!(old.id(), 1);
    assert_eq!(old.get_refs(), 1);
    assert_eq!(d.current_table().id(), 2);

    // New calls see the new generation.
    assert_eq!(d.check(&bag("dest.istio-system")).await.unwrap(), CheckResult::default());
    assert_eq!(h.log.filtered("[hcheck1").len(), 1);
    assert_eq!(old.get_refs(), 1);

    gate.release();
    let result = in_flight.await.unwrap().unwrap();
    assert_eq!(result, CheckResult::default());
    assert_eq!(old.get_refs(), 0);
    assert_eq!(d.current_table().get_refs(), 0);
}

#[tokio::test]
async fn test_destination_counters_are_recorded() {
    let (d, _h) = setup(vec![], &[ATTRIBUTES, HANDLER_ACHECK1, INSTANCE_CHECK1, RULE_CHECK1]);

    d.check(&bag("dest.istio-system")).await.unwrap();
    d.check(&bag("dest.istio-system")).await.unwrap();

    let table = d.current_table();
    let destination = &table.get_destinations(Variety::Check, DEFAULT_NAMESPACE).entries()[0];
    assert_eq!(destination.counters.total(), 2);
    assert_eq!(destination.counters.errors(), 0);
}
