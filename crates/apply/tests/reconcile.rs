#![forbid(unsafe_code)]

use std::sync::Arc;

use kman_apply::{diff, NotReadyReason, Plan, Readiness, ReadinessState, ReadinessTracker, Reconciler, Updated};
use kman_core::{CallContext, EngineConfig, Error, IgnoreFields, Manifest, ResourceIdentity};
use kman_kubehub::{DynamicClient, MemoryCluster, RestMapper, RestMapping};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn setup() -> (Arc<MemoryCluster>, Reconciler) {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::with_builtin_kinds());
    let cfg = EngineConfig { mapping_backoff_ms: 1, conflict_retries: 3, ..Default::default() };
    let mapper = Arc::new(RestMapper::new(cluster.clone(), &cfg));
    (cluster.clone(), Reconciler::new(DynamicClient::new(mapper, cluster, cfg)))
}

const CM1: &str = "kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: bar\n";

#[tokio::test]
async fn configmap_is_created_identified_and_ready() {
    let (_, r) = setup();
    let ctx = CallContext::background();
    let created = r.create(&ctx, &Manifest::decode(CM1).unwrap()).await.expect("create");

    // the identity keeps the manifest's empty namespace; the server placed it in "default"
    assert_eq!(created.id.namespace, None);
    assert_eq!(created.id.encode(), "/v1/ConfigMap/cm1");
    assert_eq!(created.object["metadata"]["namespace"], "default");
    let decoded = ResourceIdentity::decode(&created.id.encode()).unwrap();
    assert_eq!(decoded, created.id);
    assert_eq!((decoded.group_version.as_str(), decoded.kind.as_str(), decoded.name.as_str()), ("v1", "ConfigMap", "cm1"));

    assert_eq!(r.readiness(&ctx, &created.id).await.unwrap(), Readiness::Ready);
}

#[tokio::test]
async fn cluster_scoped_identity_has_empty_namespace() {
    let (_, r) = setup();
    let ctx = CallContext::background();
    let ns = Manifest::decode("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n").unwrap();
    let created = r.create(&ctx, &ns).await.unwrap();
    assert_eq!(created.id.encode(), "/v1/Namespace/team-a");
    assert_eq!(ResourceIdentity::decode("/v1/Namespace/team-a").unwrap().namespace, None);
}

#[tokio::test]
async fn ignored_labels_are_neither_diffed_nor_stripped() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let desired = Manifest::decode(CM1).unwrap();
    let created = r.create(&ctx, &desired).await.unwrap();
    cluster.modify(&created.id, |obj| {
        obj["metadata"]["labels"] = json!({"injected": "true"});
    });
    let ignore = IgnoreFields::parse(&[".metadata.labels"]).unwrap();

    assert_eq!(r.plan(&ctx, &created.id, &desired, &ignore).await.unwrap(), Plan::NoOp);

    let changed = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\n  labels:\n    app: x\ndata:\n  foo: baz\n").unwrap();
    let out = r.update(&ctx, &created.id, &changed, &ignore).await.unwrap();
    let Updated::Patched(live) = out else { panic!("expected a patch") };
    assert_eq!(live["data"]["foo"], "baz");
    assert_eq!(live["metadata"]["labels"], json!({"injected": "true"}));
}

#[tokio::test]
async fn update_is_idempotent() {
    let (_, r) = setup();
    let ctx = CallContext::background();
    let v1 = Manifest::decode(CM1).unwrap();
    let created = r.create(&ctx, &v1).await.unwrap();
    let v2 = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: bar\n  port: \"8080\"\n").unwrap();

    let first = r.update(&ctx, &created.id, &v2, &IgnoreFields::none()).await.unwrap();
    assert!(matches!(first, Updated::Patched(_)));
    let live = r.read(&ctx, &created.id).await.unwrap().unwrap();
    assert!(diff(v2.as_value(), &live, &IgnoreFields::none()).is_empty());
    assert_eq!(r.update(&ctx, &created.id, &v2, &IgnoreFields::none()).await.unwrap(), Updated::Unchanged);
}

#[tokio::test]
async fn fields_owned_by_others_survive_updates() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let created = r.create(&ctx, &Manifest::decode(CM1).unwrap()).await.unwrap();
    cluster.modify(&created.id, |obj| {
        obj["metadata"]["finalizers"] = json!(["example.com/protect"]);
        obj["data"]["added-by-controller"] = json!("1");
    });
    let v2 = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: qux\n").unwrap();
    let Updated::Patched(live) = r.update(&ctx, &created.id, &v2, &IgnoreFields::none()).await.unwrap() else {
        panic!("expected a patch")
    };
    assert_eq!(live["metadata"]["finalizers"], json!(["example.com/protect"]));
    assert_eq!(live["data"], json!({"foo": "qux", "added-by-controller": "1"}));
}

#[tokio::test]
async fn load_balancer_service_becomes_ready_once_ingress_is_assigned() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let svc = Manifest::decode(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: lb\n  namespace: web\nspec:\n  type: LoadBalancer\n  ports:\n  - port: 80\n",
    )
    .unwrap();
    let created = r.create(&ctx, &svc).await.unwrap();
    cluster.set_status(&created.id, json!({"loadBalancer": {}}));

    let mut tracker = ReadinessTracker::new();
    let live = r.read(&ctx, &created.id).await.unwrap().unwrap();
    assert_eq!(tracker.observe(&live, r.viewers()), &ReadinessState::NotReady(NotReadyReason::LoadBalancerPending));

    cluster.set_status(&created.id, json!({"loadBalancer": {"ingress": [{"hostname": "lb.example.net"}]}}));
    let live = r.read(&ctx, &created.id).await.unwrap().unwrap();
    assert_eq!(tracker.observe(&live, r.viewers()), &ReadinessState::Ready);
    assert!(tracker.is_terminal());
}

#[tokio::test]
async fn replica_check_outranks_phase() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let gvk = kman_core::Gvk::new("example.com", "v1", "Database");
    cluster.install(RestMapping::new(&gvk, "databases", true));
    let db = Manifest::decode("apiVersion: example.com/v1\nkind: Database\nmetadata:\n  name: db\nspec:\n  size: 1\n").unwrap();
    let created = r.create(&ctx, &db).await.unwrap();
    cluster.set_status(&created.id, json!({"phase": "Failed", "readyReplicas": 0}));
    assert_eq!(r.readiness(&ctx, &created.id).await.unwrap(), Readiness::NotReady(NotReadyReason::NoReadyReplicas));
}

#[tokio::test]
async fn scaled_custom_resource_without_ready_count_is_ready() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    cluster.install(RestMapping::new(&kman_core::Gvk::new("example.com", "v1", "Database"), "databases", true));
    let db = Manifest::decode("apiVersion: example.com/v1\nkind: Database\nmetadata:\n  name: db\n").unwrap();
    let created = r.create(&ctx, &db).await.unwrap();
    cluster.set_status(&created.id, json!({"replicas": 3, "phase": "Running"}));
    assert_eq!(r.readiness(&ctx, &created.id).await.unwrap(), Readiness::Ready);
}

#[tokio::test]
async fn create_collision_is_surfaced() {
    let (_, r) = setup();
    let ctx = CallContext::background();
    let m = Manifest::decode(CM1).unwrap();
    r.create(&ctx, &m).await.unwrap();
    let err = r.create(&ctx, &m).await.unwrap_err();
    assert!(err.is_already_exists(), "{err}");
    assert_eq!(err.status().map(|s| s.code), Some(409));
}

#[tokio::test]
async fn conflicts_are_retried_with_a_fresh_read() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let created = r.create(&ctx, &Manifest::decode(CM1).unwrap()).await.unwrap();
    let v2 = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: two\n").unwrap();

    cluster.inject_conflicts(2);
    assert!(matches!(r.update(&ctx, &created.id, &v2, &IgnoreFields::none()).await.unwrap(), Updated::Patched(_)));

    let v3 = Manifest::decode("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: cm1\ndata:\n  foo: three\n").unwrap();
    cluster.inject_conflicts(10);
    let err = r.update(&ctx, &created.id, &v3, &IgnoreFields::none()).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
}

#[tokio::test]
async fn deleting_twice_succeeds() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let created = r.create(&ctx, &Manifest::decode(CM1).unwrap()).await.unwrap();
    r.delete(&ctx, &created.id).await.unwrap();
    r.delete(&ctx, &created.id).await.unwrap();
    assert!(cluster.is_empty());
    assert!(matches!(r.readiness(&ctx, &created.id).await, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn crd_installed_after_start_is_reconciled() {
    let (cluster, r) = setup();
    let ctx = CallContext::background();
    let widget = Manifest::decode("apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n").unwrap();
    let err = r.create(&ctx, &widget).await.unwrap_err();
    assert!(matches!(err, Error::MappingNotFound { .. }), "{err}");

    cluster.install(RestMapping::new(widget.gvk(), "widgets", false));
    let created = r.create(&ctx, &widget).await.unwrap();
    assert_eq!(created.id.encode(), "/example.com/v1/Widget/w");
}
