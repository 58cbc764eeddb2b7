#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use kube::core::DynamicObject;
use serde_json::json;

use kmirror_core::mem::{MemStore, StaticResolver};
use kmirror_core::meta::has_finalizer;
use kmirror_core::{ChangeEvent, KindDescriptor, KindId, KindRegistry, LabelSelector, MirrorResult, ObjectStore, Scope, FINALIZER};
use kmirror_sync::{run_once, Engine, Filter, FinalizerGuard, Outcome, Pipeline};

fn core(kind: &str, plural: &str) -> KindDescriptor {
    KindDescriptor::new(KindId::new("", "v1", kind), plural, Scope::Namespaced)
}

fn from_raw(raw: serde_json::Value) -> DynamicObject {
    serde_json::from_value(raw).expect("valid object")
}

fn filter() -> Filter { Filter::new("team-a", vec![], LabelSelector::everything()) }

#[tokio::test]
async fn service_is_mirrored_without_allocated_addresses() {
    let svc = core("Service", "services");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    let obj = source.insert(&svc, from_raw(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "frontend", "namespace": "team-a", "labels": { "app": "frontend" } },
        "spec": {
            "type": "NodePort",
            "clusterIP": "10.96.12.7",
            "clusterIPs": ["10.96.12.7"],
            "selector": { "app": "frontend" },
            "ports": [{ "port": 80, "targetPort": 8080, "nodePort": 31080, "protocol": "TCP" }]
        }
    })));
    let engine = Engine::new(source.clone(), target.clone(), "team-b");
    assert!(matches!(engine.reconcile(&svc, obj).await.unwrap(), Outcome::Created));

    let mirror = target.object(&svc, "team-b", "frontend").expect("mirrored");
    let spec = &mirror.data["spec"];
    assert!(spec.get("clusterIP").is_none());
    assert!(spec.get("clusterIPs").is_none());
    assert_eq!(spec["ports"][0]["nodePort"], 0);
    assert_eq!(spec["ports"][0]["port"], 80);
    assert_eq!(spec["selector"], json!({ "app": "frontend" }));
    assert_eq!(mirror.metadata.labels, Some([("app".to_string(), "frontend".to_string())].into_iter().collect()));
}

#[tokio::test]
async fn service_account_is_mirrored_without_token_refs() {
    let sa = core("ServiceAccount", "serviceaccounts");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    let obj = source.insert(&sa, from_raw(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": "deployer", "namespace": "team-a" },
        "secrets": [{ "name": "deployer-token-7x9qz" }],
        "automountServiceAccountToken": false
    })));
    Engine::new(source.clone(), target.clone(), "team-b").reconcile(&sa, obj).await.unwrap();
    let mirror = target.object(&sa, "team-b", "deployer").expect("mirrored");
    assert!(mirror.data.get("secrets").is_none());
    assert_eq!(mirror.data["automountServiceAccountToken"], false);
}

/// Store wrapper that appends every write to a journal shared between source and target.
struct Journaled {
    label: &'static str,
    inner: Arc<MemStore>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Journaled {
    fn note(&self, op: &str, name: &str) { self.journal.lock().unwrap().push(format!("{}:{}:{}", self.label, op, name)); }
}

#[async_trait::async_trait]
impl ObjectStore for Journaled {
    async fn get(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<DynamicObject> {
        self.inner.get(kind, namespace, name).await
    }
    async fn list(&self, kind: &KindDescriptor, namespace: &str) -> MirrorResult<Vec<DynamicObject>> {
        self.inner.list(kind, namespace).await
    }
    async fn create(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        self.note("create", obj.metadata.name.as_deref().unwrap_or(""));
        self.inner.create(kind, namespace, obj).await
    }
    async fn update(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        self.note("update", obj.metadata.name.as_deref().unwrap_or(""));
        self.inner.update(kind, namespace, obj).await
    }
    async fn delete(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<()> {
        self.note("delete", name);
        self.inner.delete(kind, namespace, name).await
    }
}

#[tokio::test]
async fn target_is_deleted_before_source_finalizer_is_released() {
    let cm = core("ConfigMap", "configmaps");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let src_store = Arc::new(Journaled { label: "source", inner: source.clone(), journal: journal.clone() });
    let dst_store = Arc::new(Journaled { label: "target", inner: target.clone(), journal: journal.clone() });
    let engine = Engine::new(src_store.clone(), dst_store, "team-b");
    let guard = FinalizerGuard::new(src_store);

    let obj = source.insert(&cm, from_raw(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "feature-flags", "namespace": "team-a" },
        "data": { "beta": "on" }
    })));
    assert!(guard.ensure(&cm, &obj).await.unwrap());
    let stamped = source.object(&cm, "team-a", "feature-flags").unwrap();
    engine.reconcile(&cm, stamped).await.unwrap();
    assert!(target.object(&cm, "team-b", "feature-flags").is_some());

    // user deletes the source; the marker holds it in terminating state
    source.delete(&cm, "team-a", "feature-flags").await.unwrap();
    let terminating = source.object(&cm, "team-a", "feature-flags").expect("held by finalizer");
    assert!(has_finalizer(&terminating.metadata));
    journal.lock().unwrap().clear();

    let released = match engine.reconcile(&cm, terminating).await.unwrap() {
        Outcome::Retired(o) => o,
        other => panic!("expected retirement, got {:?}", other),
    };
    assert!(!released.metadata.finalizers.unwrap_or_default().iter().any(|f| f == FINALIZER));
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["target:delete:feature-flags".to_string(), "source:update:feature-flags".to_string()]
    );
    assert!(target.object(&cm, "team-b", "feature-flags").is_none());
    assert!(source.object(&cm, "team-a", "feature-flags").is_none());
}

#[tokio::test]
async fn bootstrap_mirrors_preexisting_objects_except_controlled_ones() {
    let cm = core("ConfigMap", "configmaps");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    for name in ["alpha", "beta", "gamma"] {
        source.insert(&cm, from_raw(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "team-a" },
            "data": { "owner": name }
        })));
    }
    source.insert(&cm, from_raw(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "generated",
            "namespace": "team-a",
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": "web",
                "uid": "5d3c1b7e-0000-0000-0000-000000000001",
                "controller": true
            }]
        },
        "data": {}
    })));
    let registry: KindRegistry = vec![cm.clone()].into_iter().collect();
    let resolver = StaticResolver::new().with(cm.clone(), true);
    let engine = Engine::new(source.clone(), target.clone(), "team-b");
    let report = run_once(&registry, &resolver, source.as_ref(), &filter(), &engine).await;

    let total = report.total();
    assert_eq!((total.listed, total.admitted, total.created), (4, 3, 3));
    let mut mirrored: Vec<String> = target.objects(&cm, "team-b").iter().filter_map(|o| o.metadata.name.clone()).collect();
    mirrored.sort();
    assert_eq!(mirrored, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn live_lifecycle_through_pipeline() {
    let cm = core("ConfigMap", "configmaps");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    let engine = Arc::new(Engine::new(source.clone(), target.clone(), "team-b"));
    let raw = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "limits", "namespace": "team-a" },
        "data": { "cpu": "1" }
    });

    // create
    let v1 = source.insert(&cm, from_raw(raw.clone()));
    let stats = Pipeline::new(filter(), FinalizerGuard::new(source.clone()), engine.clone())
        .start(futures::stream::iter(vec![ChangeEvent::applied(cm.clone(), v1)]))
        .join()
        .await;
    assert_eq!(stats.producer.finalizers_added, 1);
    assert_eq!(target.object(&cm, "team-b", "limits").unwrap().data["data"]["cpu"], "1");

    // update the stamped object, then delete it
    let mut v2 = source.object(&cm, "team-a", "limits").unwrap();
    v2.data["data"]["cpu"] = json!("2");
    let v2 = source.update(&cm, "team-a", &v2).await.unwrap();
    source.delete(&cm, "team-a", "limits").await.unwrap();
    let terminating = source.object(&cm, "team-a", "limits").unwrap();

    let events = vec![ChangeEvent::applied(cm.clone(), v2), ChangeEvent::applied(cm.clone(), terminating)];
    let stats = Pipeline::new(filter(), FinalizerGuard::new(source.clone()), engine)
        .start(futures::stream::iter(events))
        .join()
        .await;
    assert_eq!(stats.consumer.outcomes.get("updated"), Some(&1));
    assert_eq!(stats.consumer.outcomes.get("retired"), Some(&1));
    assert_eq!(stats.producer.finalizers_added, 0);
    assert!(target.object(&cm, "team-b", "limits").is_none());
    assert!(source.object(&cm, "team-a", "limits").is_none());
}

#[tokio::test]
async fn source_held_by_foreign_finalizer_loses_its_mirror() {
    let cm = core("ConfigMap", "configmaps");
    let source = Arc::new(MemStore::new());
    let target = Arc::new(MemStore::new());
    let engine = Arc::new(Engine::new(source.clone(), target.clone(), "team-b"));
    let obj = source.insert(&cm, from_raw(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "quota", "namespace": "team-a", "finalizers": ["backup.example.io/hold"] },
        "data": { "pods": "10" }
    })));
    // the stamp is lost to a concurrent writer, so only the foreign finalizer remains
    source.conflict_next_update();
    let stats = Pipeline::new(filter(), FinalizerGuard::new(source.clone()), engine.clone())
        .start(futures::stream::iter(vec![ChangeEvent::applied(cm.clone(), obj)]))
        .join()
        .await;
    assert_eq!(stats.producer.finalizer_errors, 1);
    assert!(target.object(&cm, "team-b", "quota").is_some());

    source.delete(&cm, "team-a", "quota").await.unwrap();
    let terminating = source.object(&cm, "team-a", "quota").expect("held by foreign finalizer");
    assert!(!has_finalizer(&terminating.metadata));
    let stats = Pipeline::new(filter(), FinalizerGuard::new(source.clone()), engine)
        .start(futures::stream::iter(vec![ChangeEvent::applied(cm.clone(), terminating)]))
        .join()
        .await;
    assert_eq!(stats.consumer.outcomes.get("removed"), Some(&1));
    assert!(target.object(&cm, "team-b", "quota").is_none());
    let still = source.object(&cm, "team-a", "quota").expect("not ours to release");
    assert_eq!(still.metadata.finalizers, Some(vec!["backup.example.io/hold".to_string()]));
}
