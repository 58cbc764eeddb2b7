//! kmirror kubehub: kube client bootstrap, discovery-backed capability resolver, dynamic
//! object store and the merged per-kind watch stream.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, TypeMeta},
    discovery::{verbs, ApiCapabilities, Discovery, Scope as KubeScope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use metrics::counter;
use tracing::{debug, info, warn};

use kmirror_core::{
    CapabilityResolver, ChangeEvent, KindDescriptor, KindId, MirrorError, MirrorResult, ObjectStore, Scope,
};

const FIELD_MANAGER: &str = "kmirror";

/// Build a client from an explicit kubeconfig and/or context, or infer one (in-cluster or `~/.kube/config`).
pub async fn get_kube_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")?
        }
        None if context.is_some() => Config::from_kubeconfig(&opts).await.context("loading kubeconfig context")?,
        None => Config::infer().await.context("inferring kube config")?,
    };
    debug!(cluster = %config.cluster_url, ctx = ?context, "kube config loaded");
    Client::try_from(config).context("building kube client")
}

/// Capability resolver backed by a single discovery run. Every served version is kept.
pub struct KubeResolver {
    kinds: Vec<(KindDescriptor, ApiCapabilities)>,
}

impl KubeResolver {
    pub async fn discover(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client).run().await.context("running API discovery")?;
        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let scope = match caps.scope {
                        KubeScope::Namespaced => Scope::Namespaced,
                        KubeScope::Cluster => Scope::Cluster,
                    };
                    let id = KindId::new(ar.group.clone(), ar.version.clone(), ar.kind.clone());
                    kinds.push((KindDescriptor::new(id, ar.plural.clone(), scope), caps));
                }
            }
        }
        kinds.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        info!(count = kinds.len(), "discovery complete");
        Ok(Self { kinds })
    }
}

impl CapabilityResolver for KubeResolver {
    fn kinds(&self) -> Vec<KindDescriptor> { self.kinds.iter().map(|(d, _)| d.clone()).collect() }

    fn is_watchable(&self, id: &KindId) -> bool {
        self.kinds
            .iter()
            .find(|(d, _)| &d.id == id)
            .map(|(_, caps)| caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH))
            .unwrap_or(false)
    }

    fn resolve(&self, id: &KindId) -> MirrorResult<KindDescriptor> {
        self.kinds
            .iter()
            .find(|(d, _)| &d.id == id)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| MirrorError::Resolution(format!("GVK not found: {}", id)))
    }
}

/// Translate kube errors into the store error taxonomy.
pub fn map_kube_err(e: kube::Error, what: &str) -> MirrorError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => MirrorError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => MirrorError::Conflict(format!("{}: {}", what, ae.message)),
        kube::Error::SerdeError(se) => MirrorError::Serialization(se),
        other => MirrorError::Store(format!("{}: {}", what, other)),
    }
}

/// [`ObjectStore`] over `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, kind: &KindDescriptor, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        if kind.namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }

    fn post_params() -> PostParams {
        PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() }
    }
}

fn what(kind: &KindDescriptor, namespace: &str, name: &str) -> String { format!("{} {}/{}", kind.id, namespace, name) }

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<DynamicObject> {
        self.api(kind, namespace).get(name).await.map_err(|e| map_kube_err(e, &what(kind, namespace, name)))
    }

    async fn list(&self, kind: &KindDescriptor, namespace: &str) -> MirrorResult<Vec<DynamicObject>> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(e, &what(kind, namespace, "*")))?;
        Ok(list.items.into_iter().map(|o| with_types(kind, o)).collect())
    }

    async fn create(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        let name = obj.metadata.name.as_deref().unwrap_or("");
        self.api(kind, namespace)
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| map_kube_err(e, &what(kind, namespace, name)))
    }

    async fn update(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        let name = obj.metadata.name.as_deref().unwrap_or("");
        self.api(kind, namespace)
            .replace(name, &Self::post_params(), obj)
            .await
            .map_err(|e| map_kube_err(e, &what(kind, namespace, name)))
    }

    async fn delete(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(e, &what(kind, namespace, name)))
    }
}

/// List responses and some watch payloads omit apiVersion/kind; fill them from the descriptor.
pub fn with_types(kind: &KindDescriptor, mut obj: DynamicObject) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: kind.id.api_version(), kind: kind.id.kind.clone() });
    }
    obj
}

/// Flatten one watcher event into change events, in order.
pub fn events_from(kind: &KindDescriptor, ev: Event<DynamicObject>) -> Vec<ChangeEvent> {
    match ev {
        Event::Applied(o) => vec![ChangeEvent::applied(kind.clone(), with_types(kind, o))],
        Event::Deleted(o) => vec![ChangeEvent::deleted(kind.clone(), with_types(kind, o))],
        Event::Restarted(list) => {
            debug!(gvk = %kind.id, count = list.len(), "watch restart");
            list.into_iter().map(|o| ChangeEvent::applied(kind.clone(), with_types(kind, o))).collect()
        }
    }
}

/// Start one watcher per namespaced kind in `namespace` and merge them into a single stream.
///
/// Watch errors are logged and retried with the watcher's default backoff; they never end
/// the stream. Cluster-scoped kinds are not watched.
pub fn watch_kinds(client: Client, kinds: &[KindDescriptor], namespace: &str) -> BoxStream<'static, ChangeEvent> {
    let streams: Vec<BoxStream<'static, ChangeEvent>> = kinds
        .iter()
        .filter_map(|k| {
            if !k.namespaced() {
                debug!(gvk = %k.id, "not watching cluster-scoped kind");
                return None;
            }
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &k.api_resource());
            let kind = k.clone();
            info!(gvk = %kind.id, ns = %namespace, "watcher started");
            let s = watcher::watcher(api, watcher::Config::default())
                .default_backoff()
                .filter_map(move |res| {
                    let kind = kind.clone();
                    async move {
                        match res {
                            Ok(ev) => Some(stream::iter(events_from(&kind, ev))),
                            Err(e) => {
                                counter!("watch_errors_total", 1u64);
                                warn!(gvk = %kind.id, error = %e, "watch error; retrying with backoff");
                                None
                            }
                        }
                    }
                })
                .flatten()
                .boxed();
            Some(s)
        })
        .collect();
    stream::select_all(streams).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_core::ChangeKind;
    use kube::core::ErrorResponse;

    fn svc() -> KindDescriptor { KindDescriptor::new(KindId::new("", "v1", "Service"), "services", Scope::Namespaced) }

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} happened", reason), reason: reason.into(), code })
    }

    fn bare(name: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &svc().api_resource()).within("src");
        o.types = None;
        o
    }

    #[test]
    fn maps_api_status_codes() {
        assert!(map_kube_err(api_err(404, "NotFound"), "x").is_not_found());
        assert!(map_kube_err(api_err(409, "Conflict"), "x").is_conflict());
        assert!(matches!(map_kube_err(api_err(500, "InternalError"), "x"), MirrorError::Store(_)));
    }

    #[test]
    fn fills_missing_type_meta() {
        let o = with_types(&svc(), bare("web"));
        let t = o.types.expect("types");
        assert_eq!(t.api_version, "v1");
        assert_eq!(t.kind, "Service");
    }

    #[test]
    fn restart_expands_to_applied_events_in_order() {
        let evs = events_from(&svc(), Event::Restarted(vec![bare("a"), bare("b"), bare("c")]));
        let names: Vec<_> = evs.iter().map(|e| e.object.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(evs.iter().all(|e| e.change == ChangeKind::Applied));
        let del = events_from(&svc(), Event::Deleted(bare("a")));
        assert_eq!(del.len(), 1);
        assert_eq!(del[0].change, ChangeKind::Deleted);
    }
}
