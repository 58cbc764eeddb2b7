//! Seams to the object store, the capability resolver and the diff renderer.

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::error::MirrorResult;
use crate::kind::{KindDescriptor, KindId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// One notification from the change source.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub resource: KindDescriptor,
    pub change: ChangeKind,
    pub object: DynamicObject,
}

impl ChangeEvent {
    pub fn applied(resource: KindDescriptor, object: DynamicObject) -> Self {
        Self { resource, change: ChangeKind::Applied, object }
    }

    pub fn deleted(resource: KindDescriptor, object: DynamicObject) -> Self {
        Self { resource, change: ChangeKind::Deleted, object }
    }
}

/// Object store addressed by (kind, namespace, name).
///
/// Implementations report a missing object as [`MirrorError::NotFound`] and a stale
/// resource version as [`MirrorError::Conflict`].
///
/// [`MirrorError::NotFound`]: crate::MirrorError::NotFound
/// [`MirrorError::Conflict`]: crate::MirrorError::Conflict
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<DynamicObject>;
    async fn list(&self, kind: &KindDescriptor, namespace: &str) -> MirrorResult<Vec<DynamicObject>>;
    async fn create(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject>;
    /// Replace using `obj.metadata.resource_version` for optimistic concurrency.
    async fn update(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject>;
    async fn delete(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<()>;
}

/// Discovery view of the served kinds.
pub trait CapabilityResolver: Send + Sync {
    /// Every served (group, version, kind), all versions included.
    fn kinds(&self) -> Vec<KindDescriptor>;
    /// Both `list` and `watch` verbs are served for the kind.
    fn is_watchable(&self, id: &KindId) -> bool;
    fn resolve(&self, id: &KindId) -> MirrorResult<KindDescriptor>;
}

/// One-way renderer of change events. Must not fail the caller.
pub trait DiffSink: Send + Sync {
    fn observe(&self, event: &ChangeEvent);
}
