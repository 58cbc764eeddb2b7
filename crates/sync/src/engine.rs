//! Mirror sync engine: the create / patch / retire state machine, one object at a time.
//!
//! The engine keeps no per-object state. Each call reads the target, decides, and issues
//! at most one write per store (plus a finalizer release on legacy targets), so replaying
//! the same input is harmless.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, TypeMeta};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, error, info};

use kmirror_core::meta::{has_finalizer, is_terminating, name_of};
use kmirror_core::{KindDescriptor, MirrorResult, ObjectStore, FINALIZER};

use crate::finalizer::FinalizerGuard;
use crate::sanitize::sanitize;

/// What a single reconcile did.
#[derive(Debug, Clone)]
pub enum Outcome {
    Created,
    Updated,
    /// Target already matches; no write issued.
    Unchanged,
    /// The sanitizer refused to mirror this object.
    Vetoed,
    /// Target exists but carries no payload; nothing to reconcile.
    EmptyTarget,
    /// Target deleted and the marker released on the source; carries the persisted source.
    Retired(DynamicObject),
    /// Target deleted; the source carried no marker, so nothing was released.
    Removed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Vetoed => "vetoed",
            Outcome::EmptyTarget => "empty_target",
            Outcome::Retired(_) => "retired",
            Outcome::Removed => "removed",
        }
    }
}

pub struct Engine {
    source: Arc<dyn ObjectStore>,
    target: Arc<dyn ObjectStore>,
    target_namespace: String,
}

impl Engine {
    pub fn new(source: Arc<dyn ObjectStore>, target: Arc<dyn ObjectStore>, target_namespace: impl Into<String>) -> Self {
        Self { source, target, target_namespace: target_namespace.into() }
    }

    /// Bring the mirror of `obj` in line with it. Deletion always wins over upsert.
    pub async fn reconcile(&self, kind: &KindDescriptor, obj: DynamicObject) -> MirrorResult<Outcome> {
        if is_terminating(&obj.metadata) {
            self.retire(kind, obj).await
        } else {
            self.upsert(kind, obj).await
        }
    }

    /// Create or patch the mirror copy.
    pub async fn upsert(&self, kind: &KindDescriptor, obj: DynamicObject) -> MirrorResult<Outcome> {
        let name = name_of(&obj).to_string();
        let Some(src) = sanitize(&kind.id, obj) else {
            counter!("mirror_vetoed_total", 1u64);
            debug!(gvk = %kind.id, name = %name, "sanitizer vetoed mirroring");
            return Ok(Outcome::Vetoed);
        };
        match self.target.get(kind, &self.target_namespace, &name).await {
            Err(e) if e.is_not_found() => self.create(kind, src).await,
            Err(e) => Err(e),
            Ok(existing) => self.patch(kind, src, existing).await,
        }
    }

    async fn create(&self, kind: &KindDescriptor, src: DynamicObject) -> MirrorResult<Outcome> {
        let obj = mirrored(kind, src, &self.target_namespace, None);
        self.target.create(kind, &self.target_namespace, &obj).await?;
        counter!("mirror_created_total", 1u64);
        info!(gvk = %kind.id, ns = %self.target_namespace, name = %name_of(&obj), "created mirror");
        Ok(Outcome::Created)
    }

    async fn patch(&self, kind: &KindDescriptor, src: DynamicObject, existing: DynamicObject) -> MirrorResult<Outcome> {
        if is_empty(&existing) {
            error!(gvk = %kind.id, ns = %self.target_namespace, name = %name_of(&src), "empty object");
            return Ok(Outcome::EmptyTarget);
        }
        let obj = mirrored(kind, src, &self.target_namespace, Some(&existing));
        if same_content(&obj, &existing) {
            debug!(gvk = %kind.id, name = %name_of(&obj), "mirror up to date");
            return Ok(Outcome::Unchanged);
        }
        self.target.update(kind, &self.target_namespace, &obj).await?;
        counter!("mirror_updated_total", 1u64);
        info!(gvk = %kind.id, ns = %self.target_namespace, name = %name_of(&obj), "updated mirror");
        Ok(Outcome::Updated)
    }

    /// Delete the mirror of a source object that is already gone.
    pub async fn remove(&self, kind: &KindDescriptor, name: &str) -> MirrorResult<Outcome> {
        self.delete_target(kind, name).await?;
        debug!(gvk = %kind.id, ns = %self.target_namespace, name = %name, "mirror removed");
        Ok(Outcome::Removed)
    }

    async fn retire(&self, kind: &KindDescriptor, obj: DynamicObject) -> MirrorResult<Outcome> {
        let (released, had) = FinalizerGuard::release(obj);
        let name = name_of(&released).to_string();
        self.delete_target(kind, &name).await?;
        if !had {
            debug!(gvk = %kind.id, name = %name, "terminating without finalizer; mirror removed");
            return Ok(Outcome::Removed);
        }
        // Target is gone; only now may the source finish deleting.
        let ns = released.metadata.namespace.clone().unwrap_or_default();
        let persisted = match self.source.update(kind, &ns, &released).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => released,
            Err(e) => return Err(e),
        };
        counter!("mirror_retired_total", 1u64);
        info!(gvk = %kind.id, ns = %ns, name = %name, "retired mirror and released finalizer");
        Ok(Outcome::Retired(persisted))
    }

    /// Delete the mirror copy; not-found counts as done. A target that still carries the
    /// marker (written by an older mirror) is released first so the delete can complete.
    async fn delete_target(&self, kind: &KindDescriptor, name: &str) -> MirrorResult<()> {
        let ns = &self.target_namespace;
        match self.target.get(kind, ns, name).await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
            Ok(existing) if has_finalizer(&existing.metadata) => {
                let (stripped, _) = FinalizerGuard::release(existing);
                match self.target.update(kind, ns, &stripped).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => {}
        }
        match self.target.delete(kind, ns, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// The object written to the target: payload, labels, annotations and owner references
/// from the sanitized source; uid, selfLink, resourceVersion, creationTimestamp and
/// generation from the existing target (empty on create). Managed fields and deletion
/// markers are never carried, and neither is the source's finalizer list.
fn mirrored(kind: &KindDescriptor, src: DynamicObject, namespace: &str, existing: Option<&DynamicObject>) -> DynamicObject {
    let DynamicObject { metadata: src_meta, data, .. } = src;
    let cur = existing.map(|e| &e.metadata);
    let finalizers = cur
        .and_then(|m| m.finalizers.clone())
        .map(|mut f| {
            f.retain(|x| x != FINALIZER);
            f
        })
        .filter(|f| !f.is_empty());
    let metadata = ObjectMeta {
        name: src_meta.name,
        namespace: Some(namespace.to_string()),
        labels: src_meta.labels,
        annotations: src_meta.annotations,
        owner_references: src_meta.owner_references,
        finalizers,
        uid: cur.and_then(|m| m.uid.clone()),
        self_link: cur.and_then(|m| m.self_link.clone()),
        resource_version: cur.and_then(|m| m.resource_version.clone()),
        creation_timestamp: cur.and_then(|m| m.creation_timestamp.clone()),
        generation: cur.and_then(|m| m.generation),
        ..Default::default()
    };
    DynamicObject {
        types: Some(TypeMeta { api_version: kind.id.api_version(), kind: kind.id.kind.clone() }),
        metadata,
        data,
    }
}

fn is_empty(obj: &DynamicObject) -> bool {
    obj.metadata.name.is_none() && obj.data.as_object().map(|m| m.is_empty()).unwrap_or(true)
}

fn normalized(meta: &ObjectMeta) -> ObjectMeta {
    let mut m = meta.clone();
    m.managed_fields = None;
    if m.labels.as_ref().map(|x| x.is_empty()).unwrap_or(false) { m.labels = None; }
    if m.annotations.as_ref().map(|x| x.is_empty()).unwrap_or(false) { m.annotations = None; }
    if m.owner_references.as_ref().map(|x| x.is_empty()).unwrap_or(false) { m.owner_references = None; }
    if m.finalizers.as_ref().map(|x| x.is_empty()).unwrap_or(false) { m.finalizers = None; }
    m
}

fn without_status(data: &Json) -> Json {
    let mut d = data.clone();
    if let Some(map) = d.as_object_mut() { map.remove("status"); }
    d
}

fn same_content(desired: &DynamicObject, existing: &DynamicObject) -> bool {
    normalized(&desired.metadata) == normalized(&existing.metadata) && without_status(&desired.data) == without_status(&existing.data)
}
