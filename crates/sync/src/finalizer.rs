//! Finalizer guard: keeps mirrored source objects from disappearing before their mirror.

use std::sync::Arc;

use kube::core::DynamicObject;
use metrics::counter;
use tracing::info;

use kmirror_core::meta::{has_finalizer, is_terminating, name_of};
use kmirror_core::{KindDescriptor, MirrorResult, ObjectStore, FINALIZER};

#[derive(Clone)]
pub struct FinalizerGuard {
    source: Arc<dyn ObjectStore>,
}

impl FinalizerGuard {
    pub fn new(source: Arc<dyn ObjectStore>) -> Self { Self { source } }

    /// Add the marker and persist it to the source. Returns true when a write happened.
    ///
    /// Objects already carrying the marker, and terminating objects (the API server rejects
    /// new finalizers on those), are left alone.
    pub async fn ensure(&self, kind: &KindDescriptor, obj: &DynamicObject) -> MirrorResult<bool> {
        if has_finalizer(&obj.metadata) || is_terminating(&obj.metadata) {
            return Ok(false);
        }
        let mut next = obj.clone();
        next.metadata.finalizers.get_or_insert_with(Vec::new).push(FINALIZER.to_string());
        let ns = next.metadata.namespace.clone().unwrap_or_default();
        self.source.update(kind, &ns, &next).await?;
        counter!("finalizer_added_total", 1u64);
        info!(gvk = %kind.id, ns = %ns, name = %name_of(obj), "added finalizer");
        Ok(true)
    }

    /// Remove the marker locally. The caller persists the result once the mirror is retired.
    pub fn release(mut obj: DynamicObject) -> (DynamicObject, bool) {
        let had = has_finalizer(&obj.metadata);
        if let Some(f) = obj.metadata.finalizers.as_mut() {
            f.retain(|x| x != FINALIZER);
        }
        (obj, had)
    }
}
