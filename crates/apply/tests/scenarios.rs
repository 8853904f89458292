#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_apply::{reconcile_batch, BatchItem, FaultCause, Phase, ReconcileError, Reconciler, ReconcilerConfig};
use tether_core::{AttrValue, ChangeKind, CompositeIdentity, ResourceSpec};
use tether_remote::{ControlPlane, Operation, RemoteError, Sandbox};
use tether_schema::catalog::{PRIVATE_NETWORK, PRIVATE_NETWORK_ENDPOINT, PROJECT, SERVICE, SERVICE_INSTANCE, SERVICE_LIMITS};

const SVC: &str = "11111111-1111-4111-8111-111111111111";
const ENV: &str = "22222222-2222-4222-8222-222222222222";

fn sandbox() -> Arc<Sandbox> { Arc::new(Sandbox::railway().unwrap()) }

fn config() -> ReconcilerConfig { ReconcilerConfig { call_timeout: Duration::from_secs(5), batch_concurrency: 4 } }

fn reconciler(sb: &Arc<Sandbox>, kind: &str) -> Reconciler {
    let remote: Arc<dyn ControlPlane> = sb.clone();
    Reconciler::new(sb.catalog().get(kind).unwrap(), remote, config())
}

fn network(name: &str) -> ResourceSpec {
    ResourceSpec::new()
        .with("name", json!(name))
        .with("project_id", json!("p1"))
        .with("environment_id", json!("e1"))
        .with("tags", json!([]))
}

fn endpoint(network_id: &str, service_name: &str) -> ResourceSpec {
    ResourceSpec::new()
        .with("private_network_id", json!(network_id))
        .with("service_id", json!(SVC))
        .with("environment_id", json!(ENV))
        .with("service_name", json!(service_name))
}

fn limits(memory_gb: f64) -> ResourceSpec {
    ResourceSpec::new().with("service_id", json!(SVC)).with("environment_id", json!(ENV)).with("memory_gb", json!(memory_gb))
}

#[tokio::test]
async fn new_network_is_created_with_server_dns_name() {
    let sb = sandbox();
    let r = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap();
    assert_eq!(r.change_kind, ChangeKind::Created);
    assert!(r.drift.is_empty());
    let state = r.canonical_state.unwrap();
    assert_eq!(state.present("dns_name"), Some(&json!("internal.railway.internal")));
    assert_eq!(state.present("id").and_then(|v| v.as_str()), Some(r.identity.as_str()));
    assert_eq!(sb.calls(PRIVATE_NETWORK, Operation::CreateOrGet), 1);
}

#[tokio::test]
async fn same_spec_again_is_unchanged_without_any_write() {
    let sb = sandbox();
    let rec = reconciler(&sb, PRIVATE_NETWORK);
    let first = rec.reconcile(&network("internal"), None).await.unwrap();
    let prior = first.canonical().unwrap();
    let second = rec.reconcile(&network("internal"), Some(&prior)).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Unchanged);
    assert_eq!(second.identity, first.identity);
    assert_eq!(second.canonical_state, first.canonical_state);
    assert_eq!(sb.calls(PRIVATE_NETWORK, Operation::CreateOrGet), 1);
    assert_eq!(sb.calls(PRIVATE_NETWORK, Operation::Update), 0);
}

#[tokio::test]
async fn endpoint_service_name_change_replaces_with_new_identity() {
    let sb = sandbox();
    let net = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap();
    let ep = reconciler(&sb, PRIVATE_NETWORK_ENDPOINT);

    let first = ep.reconcile(&endpoint(net.identity.as_str(), "api"), None).await.unwrap();
    assert_eq!(first.change_kind, ChangeKind::Created);
    let state = first.canonical_state.clone().unwrap();
    assert_eq!(state.present("dns_name"), Some(&json!("api.railway.internal")));
    assert!(state.present("private_ips").is_some());

    let prior = first.canonical().unwrap();
    let second = ep.reconcile(&endpoint(net.identity.as_str(), "api-v2"), Some(&prior)).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Replaced);
    assert_ne!(second.identity, first.identity);
    assert_eq!(sb.calls(PRIVATE_NETWORK_ENDPOINT, Operation::Delete), 1);
    assert_eq!(sb.count(PRIVATE_NETWORK_ENDPOINT), 1);
    assert_eq!(second.canonical_state.unwrap().present("service_name"), Some(&json!("api-v2")));
}

#[tokio::test]
async fn vanished_instance_is_reported_removed() {
    let sb = sandbox();
    let rec = reconciler(&sb, PRIVATE_NETWORK);
    let first = rec.reconcile(&network("internal"), None).await.unwrap();
    assert!(sb.remove_out_of_band(PRIVATE_NETWORK, &CompositeIdentity::single(first.identity.as_str())));

    let prior = first.canonical().unwrap();
    let second = rec.reconcile(&network("internal"), Some(&prior)).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Removed);
    assert!(second.canonical_state.is_none());
    assert!(second.canonical().is_none());
}

#[tokio::test]
async fn network_rename_replaces_and_warns_about_siblings() {
    let sb = sandbox();
    let rec = reconciler(&sb, PRIVATE_NETWORK);
    let first = rec.reconcile(&network("internal"), None).await.unwrap();
    rec.reconcile(&network("sibling"), None).await.unwrap();
    assert_eq!(sb.count(PRIVATE_NETWORK), 2);

    let prior = first.canonical().unwrap();
    let second = rec.reconcile(&network("internal-2"), Some(&prior)).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Replaced);
    assert_eq!(second.warnings.len(), 1);
    assert!(second.warnings[0].contains("siblings"), "{}", second.warnings[0]);
    // Coarse deletion took the sibling with it.
    assert_eq!(sb.count(PRIVATE_NETWORK), 1);
}

#[tokio::test]
async fn mutable_change_on_kind_without_update_fails_before_any_call() {
    let sb = sandbox();
    let rec = reconciler(&sb, PRIVATE_NETWORK);
    let prior = rec.reconcile(&network("internal"), None).await.unwrap().canonical().unwrap();
    let reads = sb.calls(PRIVATE_NETWORK, Operation::Read);

    let err = rec.reconcile(&network("internal").with("tags", json!(["prod"])), Some(&prior)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotSupported { .. }), "{:?}", err);
    assert!(!err.is_retryable());
    assert_eq!(sb.calls(PRIVATE_NETWORK, Operation::Update), 0);
    assert_eq!(sb.calls(PRIVATE_NETWORK, Operation::Read), reads);
}

#[tokio::test]
async fn write_only_changes_never_drift_and_local_value_wins() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_LIMITS);

    let first = rec.reconcile(&limits(2.0), None).await.unwrap();
    assert_eq!(first.change_kind, ChangeKind::Created);
    assert_eq!(first.identity.as_str(), format!("{}:{}", SVC, ENV));
    assert_eq!(first.canonical_state.as_ref().unwrap().present("memory_gb"), Some(&json!(2.0)));

    let second = rec.reconcile(&limits(4.0), first.canonical().as_ref()).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Updated);
    assert!(second.drift.is_empty());
    let id = CompositeIdentity::new([SVC, ENV]);
    assert_eq!(sb.raw(SERVICE_LIMITS, &id).unwrap().get("memory_gb"), Some(&json!(4.0)));

    // Someone changes the value remotely; it cannot be read back, so local state stands.
    sb.set_out_of_band(SERVICE_LIMITS, &id, "memory_gb", json!(8.0));
    let third = rec.reconcile(&limits(4.0), second.canonical().as_ref()).await.unwrap();
    assert_eq!(third.change_kind, ChangeKind::Unchanged);
    assert!(third.drift.is_empty());
    assert_eq!(third.canonical_state.unwrap().present("memory_gb"), Some(&json!(4.0)));
}

#[tokio::test]
async fn mutable_out_of_band_change_is_reported_as_drift() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_INSTANCE);
    let desired = ResourceSpec::new().with("service_id", json!(SVC)).with("environment_id", json!(ENV)).with("start_command", json!("run"));
    let first = rec.reconcile(&desired, None).await.unwrap();

    sb.set_out_of_band(SERVICE_INSTANCE, &CompositeIdentity::new([SVC, ENV]), "start_command", json!("hacked"));
    let second = rec.reconcile(&desired, first.canonical().as_ref()).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Unchanged);
    assert_eq!(second.drift, vec!["start_command".to_string()]);
    assert_eq!(second.canonical_state.unwrap().present("start_command"), Some(&json!("hacked")));
}

#[tokio::test]
async fn redeploy_runs_after_apply_but_not_on_noop() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_INSTANCE);
    let desired = ResourceSpec::new()
        .with("service_id", json!(SVC))
        .with("environment_id", json!(ENV))
        .with("source_image", json!("nginx:1.27"))
        .with("redeploy", json!(true));

    let first = rec.reconcile(&desired, None).await.unwrap();
    assert_eq!(sb.actions().len(), 1);
    assert_eq!(sb.actions()[0].action, "redeploy");
    // Kept locally, never sent.
    assert_eq!(first.canonical_state.as_ref().unwrap().present("redeploy"), Some(&json!(true)));
    let id = CompositeIdentity::new([SVC, ENV]);
    assert!(sb.raw(SERVICE_INSTANCE, &id).unwrap().get("redeploy").is_none());

    rec.reconcile(&desired, first.canonical().as_ref()).await.unwrap();
    assert_eq!(sb.actions().len(), 1);
}

#[tokio::test]
async fn redeploy_defaults_on_and_can_be_turned_off() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_INSTANCE);
    let base = ResourceSpec::new().with("service_id", json!(SVC)).with("environment_id", json!(ENV));

    let first = rec.reconcile(&base.clone().with("start_command", json!("run")), None).await.unwrap();
    assert_eq!(sb.actions().len(), 1);
    let second = rec.reconcile(&base.clone().with("start_command", json!("run --prod")), first.canonical().as_ref()).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Updated);
    assert_eq!(sb.actions().len(), 2);

    // Toggling only the flag is not a remote change.
    let quiet = base.clone().with("start_command", json!("run --prod")).with("redeploy", json!(false));
    let third = rec.reconcile(&quiet, second.canonical().as_ref()).await.unwrap();
    assert_eq!(third.change_kind, ChangeKind::Unchanged);
    assert_eq!(sb.calls(SERVICE_INSTANCE, Operation::Update), 1);

    let fourth = rec.reconcile(&quiet.clone().with("start_command", json!("serve")), third.canonical().as_ref()).await.unwrap();
    assert_eq!(fourth.change_kind, ChangeKind::Updated);
    assert_eq!(sb.actions().len(), 2);
}

#[tokio::test]
async fn service_instance_needs_an_existing_service() {
    let sb = sandbox();
    let desired = ResourceSpec::new().with("service_id", json!(SVC)).with("environment_id", json!(ENV));
    let err = reconciler(&sb, SERVICE_INSTANCE).reconcile(&desired, None).await.unwrap_err();
    match err {
        ReconcileError::Faulted { phase, operation, cause: FaultCause::Remote(RemoteError::NotFound(_)) } => {
            assert_eq!(phase, Phase::Applying);
            assert_eq!(operation, Operation::CreateOrGet);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn write_only_unknown_falls_back_to_prior_value() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_INSTANCE);
    let base = ResourceSpec::new().with("service_id", json!(SVC)).with("environment_id", json!(ENV));
    let first = rec.reconcile(&base.clone().with("pre_deploy_command", json!(["npm run migrate"])), None).await.unwrap();

    let second = rec.reconcile(&base.with("pre_deploy_command", AttrValue::Unknown), first.canonical().as_ref()).await.unwrap();
    assert_eq!(second.change_kind, ChangeKind::Unchanged);
    assert_eq!(second.canonical_state.unwrap().present("pre_deploy_command"), Some(&json!(["npm run migrate"])));
}

#[tokio::test]
async fn import_reads_existing_instances() {
    let sb = sandbox();
    sb.register_service_instance(SVC, ENV);
    let rec = reconciler(&sb, SERVICE_INSTANCE);

    let r = rec.import_by_identity(&format!("{}:{}", SVC, ENV)).await.unwrap();
    assert_eq!(r.change_kind, ChangeKind::Unchanged);
    let state = r.canonical_state.unwrap();
    assert_eq!(state.present("service_id"), Some(&json!(SVC)));
    assert_eq!(state.present("environment_id"), Some(&json!(ENV)));

    let err = rec.import_by_identity("only-one-part").await.unwrap_err();
    assert!(matches!(err, ReconcileError::MalformedIdentity(_)), "{:?}", err);

    let missing = reconciler(&sb, PRIVATE_NETWORK).import_by_identity("no-such-network").await.unwrap();
    assert_eq!(missing.change_kind, ChangeKind::Removed);
}

#[tokio::test]
async fn lookup_reads_projects_and_services_by_id() {
    let sb = sandbox();
    let project_id = "33333333-3333-4333-8333-333333333333";
    let mut attrs = tether_core::WirePayload::new();
    attrs.insert("id".into(), json!(project_id));
    attrs.insert("name".into(), json!("demo"));
    attrs.insert("is_public".into(), json!(false));
    sb.seed(PROJECT, attrs).unwrap();

    let r = reconciler(&sb, PROJECT).lookup(project_id).await.unwrap();
    assert_eq!(r.change_kind, ChangeKind::Unchanged);
    assert_eq!(r.identity.as_str(), project_id);
    let state = r.canonical_state.unwrap();
    assert_eq!(state.present("name"), Some(&json!("demo")));
    assert_eq!(state.present("is_public"), Some(&json!(false)));

    let err = reconciler(&sb, PROJECT).lookup("demo").await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidSpec(_)), "{:?}", err);
    assert_eq!(sb.calls(PROJECT, Operation::Read), 1);

    let missing = reconciler(&sb, SERVICE).lookup(SVC).await.unwrap();
    assert_eq!(missing.change_kind, ChangeKind::Removed);

    let err = reconciler(&sb, PRIVATE_NETWORK).lookup(project_id).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotSupported { .. }), "{:?}", err);
    let err = reconciler(&sb, PROJECT).reconcile(&ResourceSpec::new().with("id", json!(project_id)), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotSupported { .. }), "{:?}", err);
}

#[tokio::test]
async fn destroy_follows_the_deletion_strategy() {
    let sb = sandbox();
    let net = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap();
    let ep = reconciler(&sb, PRIVATE_NETWORK_ENDPOINT);
    let created = ep.reconcile(&endpoint(net.identity.as_str(), "api"), None).await.unwrap();

    let gone = ep.destroy(&created.canonical().unwrap()).await.unwrap();
    assert_eq!(gone.change_kind, ChangeKind::Removed);
    assert_eq!(sb.count(PRIVATE_NETWORK_ENDPOINT), 0);

    sb.register_service_instance(SVC, ENV);
    let lim = reconciler(&sb, SERVICE_LIMITS);
    let created = lim.reconcile(&limits(1.0), None).await.unwrap();
    let abandoned = lim.destroy(&created.canonical().unwrap()).await.unwrap();
    assert_eq!(abandoned.change_kind, ChangeKind::Removed);
    assert_eq!(sb.calls(SERVICE_LIMITS, Operation::Delete), 0);
}

#[tokio::test]
async fn scoped_delete_of_a_missing_instance_is_reported() {
    let sb = sandbox();
    let net = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap();
    let ep = reconciler(&sb, PRIVATE_NETWORK_ENDPOINT);
    let created = ep.reconcile(&endpoint(net.identity.as_str(), "api"), None).await.unwrap();
    assert!(sb.remove_out_of_band(PRIVATE_NETWORK_ENDPOINT, &CompositeIdentity::single(created.identity.as_str())));

    let gone = ep.destroy(&created.canonical().unwrap()).await.unwrap();
    assert_eq!(gone.change_kind, ChangeKind::Removed);
    assert_eq!(gone.warnings.len(), 1);
    assert!(gone.warnings[0].contains("not found remotely"), "{:?}", gone.warnings);
}

#[tokio::test]
async fn slow_remote_faults_with_retryable_timeout() {
    let sb = sandbox();
    sb.set_latency(Some(Duration::from_millis(200)));
    let remote: Arc<dyn ControlPlane> = sb.clone();
    let cfg = ReconcilerConfig { call_timeout: Duration::from_millis(20), batch_concurrency: 1 };
    let rec = Reconciler::new(sb.catalog().get(PRIVATE_NETWORK).unwrap(), remote, cfg);

    let err = rec.reconcile(&network("internal"), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Faulted { phase: Phase::Applying, cause: FaultCause::TimedOut(_), .. }), "{:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn transient_read_failure_faults_in_observing() {
    let sb = sandbox();
    sb.fail_next(Operation::Read, RemoteError::Transient("connection reset".into()));
    let err = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Faulted { phase: Phase::Observing, operation: Operation::Read, .. }), "{:?}", err);
    assert!(err.is_retryable());
    // The create went through; a retry converges on the same instance.
    let again = reconciler(&sb, PRIVATE_NETWORK).reconcile(&network("internal"), None).await.unwrap();
    assert_eq!(again.change_kind, ChangeKind::Created);
    assert_eq!(sb.count(PRIVATE_NETWORK), 1);
}

#[tokio::test]
async fn batch_results_keep_input_order() {
    let sb = sandbox();
    sb.set_latency(Some(Duration::from_millis(2)));
    let names = ["a", "b", "c", "d", "e"];
    let items = names
        .iter()
        .map(|n| BatchItem { reconciler: reconciler(&sb, PRIVATE_NETWORK), desired: network(n), prior: None })
        .collect();
    let results = reconcile_batch(items, 2).await;
    let got: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().canonical_state.unwrap().present("name").unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(got, names);
    assert_eq!(sb.count(PRIVATE_NETWORK), 5);
}
