//! In-memory implementations of the store seams, for tests and offline runs.
//!
//! `MemStore` follows the API server rules the engine relies on: server-owned fields
//! (uid, creationTimestamp, deletionTimestamp) cannot be changed by clients, creates
//! must not carry a resourceVersion, updates must carry the current one, a delete on an
//! object with finalizers only marks it terminating, and an update that empties the
//! finalizers of a terminating object removes it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;

use crate::error::{MirrorError, MirrorResult};
use crate::kind::{KindDescriptor, KindId};
use crate::store::{CapabilityResolver, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    Delete,
}

/// A recorded store call. `object` is the payload for create/update.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub object: Option<DynamicObject>,
}

type Key = (String, String, String, String); // group, plural, namespace, name

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    next_rv: u64,
    calls: Vec<Call>,
    conflict_next_update: bool,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn key(kind: &KindDescriptor, namespace: &str, name: &str) -> Key {
    (kind.id.group.clone(), kind.plural.clone(), namespace.to_string(), name.to_string())
}

fn comparable(obj: &DynamicObject) -> (serde_json::Value, serde_json::Value) {
    let mut meta = obj.metadata.clone();
    meta.resource_version = None;
    meta.managed_fields = None;
    let meta = serde_json::to_value(meta).unwrap_or_default();
    (meta, obj.data.clone())
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// Seed an object directly, bypassing create rules; uid and resourceVersion are assigned if missing.
    pub fn insert(&self, kind: &KindDescriptor, mut obj: DynamicObject) -> DynamicObject {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        if obj.metadata.uid.is_none() { obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string()); }
        obj.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(key(kind, &ns, &name), obj.clone());
        obj
    }

    pub fn object(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).objects.get(&key(kind, namespace, name)).cloned()
    }

    pub fn objects(&self, kind: &KindDescriptor, namespace: &str) -> Vec<DynamicObject> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .objects
            .iter()
            .filter(|((g, p, ns, _), _)| *g == kind.id.group && *p == kind.plural && ns == namespace)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> { self.inner.lock().unwrap_or_else(|e| e.into_inner()).calls.clone() }

    /// Create, update and delete calls only.
    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| matches!(c.op, Op::Create | Op::Update | Op::Delete)).collect()
    }

    pub fn clear_calls(&self) { self.inner.lock().unwrap_or_else(|e| e.into_inner()).calls.clear(); }

    /// Make the next update fail with a conflict, as if another writer got there first.
    pub fn conflict_next_update(&self) { self.inner.lock().unwrap_or_else(|e| e.into_inner()).conflict_next_update = true; }

    fn record(inner: &mut Inner, op: Op, kind: &KindDescriptor, namespace: &str, name: &str, object: Option<&DynamicObject>) {
        inner.calls.push(Call {
            op,
            kind: kind.id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            object: object.cloned(),
        });
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<DynamicObject> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MemStore::record(&mut inner, Op::Get, kind, namespace, name, None);
        inner
            .objects
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| MirrorError::NotFound(format!("{} {}/{}", kind.id, namespace, name)))
    }

    async fn list(&self, kind: &KindDescriptor, namespace: &str) -> MirrorResult<Vec<DynamicObject>> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            MemStore::record(&mut inner, Op::List, kind, namespace, "", None);
        }
        Ok(self.objects(kind, namespace))
    }

    async fn create(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MemStore::record(&mut inner, Op::Create, kind, namespace, &name, Some(obj));
        if obj.metadata.resource_version.as_deref().map(|rv| !rv.is_empty()).unwrap_or(false) {
            return Err(MirrorError::Store("resourceVersion should not be set on objects to be created".into()));
        }
        let k = key(kind, namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(MirrorError::Conflict(format!("{} {}/{} already exists", kind.id, namespace, name)));
        }
        let mut stored = obj.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        stored.metadata.deletion_timestamp = None;
        stored.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update(&self, kind: &KindDescriptor, namespace: &str, obj: &DynamicObject) -> MirrorResult<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MemStore::record(&mut inner, Op::Update, kind, namespace, &name, Some(obj));
        let k = key(kind, namespace, &name);
        let current = inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| MirrorError::NotFound(format!("{} {}/{}", kind.id, namespace, name)))?;
        if std::mem::take(&mut inner.conflict_next_update) || obj.metadata.resource_version != current.metadata.resource_version {
            return Err(MirrorError::Conflict(format!(
                "{} {}/{}: the object has been modified; please apply your changes to the latest version",
                kind.id, namespace, name
            )));
        }
        let mut next = obj.clone();
        next.metadata.namespace = Some(namespace.to_string());
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        if next.metadata.deletion_timestamp.is_some() && next.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true) {
            inner.objects.remove(&k);
            return Ok(next);
        }
        if comparable(&next) == comparable(&current) {
            return Ok(current);
        }
        next.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(k, next.clone());
        Ok(next)
    }

    async fn delete(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MemStore::record(&mut inner, Op::Delete, kind, namespace, name, None);
        let k = key(kind, namespace, name);
        let Some(mut current) = inner.objects.get(&k).cloned() else {
            return Err(MirrorError::NotFound(format!("{} {}/{}", kind.id, namespace, name)));
        };
        if current.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false) {
            if current.metadata.deletion_timestamp.is_none() {
                current.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                current.metadata.resource_version = Some(inner.bump());
                inner.objects.insert(k, current);
            }
        } else {
            inner.objects.remove(&k);
        }
        Ok(())
    }
}

/// Resolver over a fixed list of kinds.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    kinds: Vec<(KindDescriptor, bool)>,
}

impl StaticResolver {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, desc: KindDescriptor, watchable: bool) -> Self {
        self.kinds.push((desc, watchable));
        self
    }
}

impl CapabilityResolver for StaticResolver {
    fn kinds(&self) -> Vec<KindDescriptor> { self.kinds.iter().map(|(d, _)| d.clone()).collect() }

    fn is_watchable(&self, id: &KindId) -> bool {
        self.kinds.iter().any(|(d, w)| *w && &d.id == id)
    }

    fn resolve(&self, id: &KindId) -> MirrorResult<KindDescriptor> {
        self.kinds
            .iter()
            .find(|(d, _)| &d.id == id)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| MirrorError::Resolution(format!("no mapping for {}", id)))
    }
}
