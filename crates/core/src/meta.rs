//! Metadata helpers shared by the filter, the finalizer guard and the engine.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;

/// Finalizer placed on every mirrored source object until its mirror copy is gone.
pub const FINALIZER: &str = "kmirror.io/mirror";

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().map(|f| f.iter().any(|x| x == FINALIZER)).unwrap_or(false)
}

pub fn is_terminating(meta: &ObjectMeta) -> bool { meta.deletion_timestamp.is_some() }

/// True when an owner reference marks another object as the managing controller.
pub fn is_controlled(meta: &ObjectMeta) -> bool {
    meta.owner_references
        .as_ref()
        .map(|ors| ors.iter().any(|o| o.controller == Some(true)))
        .unwrap_or(false)
}

pub fn name_of(obj: &DynamicObject) -> &str { obj.metadata.name.as_deref().unwrap_or("") }

/// `namespace/name`, or bare name for cluster-scoped objects.
pub fn object_key(obj: &DynamicObject) -> String {
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name_of(obj)),
        None => name_of(obj).to_string(),
    }
}

/// Stable identity for dedup: uid when the server assigned one, else the object key.
pub fn identity(obj: &DynamicObject) -> String {
    obj.metadata.uid.clone().unwrap_or_else(|| object_key(obj))
}
