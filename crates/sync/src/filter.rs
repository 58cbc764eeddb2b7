//! Eligibility filter: which kinds are watched and which objects are mirrored.

use kube::core::DynamicObject;
use tracing::debug;

use kmirror_core::meta::{has_finalizer, is_controlled, is_terminating, name_of};
use kmirror_core::{CapabilityResolver, KindDescriptor, KindRegistry, LabelSelector, MirrorConfig, NameMatcher};

/// Names that are regenerated by every namespace's control plane. Substring match.
pub const DENY_NAMES: &[&str] = &["kube-root-ca.crt", "default-token-"];

#[derive(Debug, Clone)]
pub struct Filter {
    namespace: String,
    matchers: Vec<NameMatcher>,
    selector: LabelSelector,
}

impl Filter {
    pub fn new(namespace: impl Into<String>, matchers: Vec<NameMatcher>, selector: LabelSelector) -> Self {
        Self { namespace: namespace.into(), matchers, selector }
    }

    pub fn from_config(cfg: &MirrorConfig) -> Self {
        Self::new(cfg.source_namespace.clone(), cfg.matchers.clone(), cfg.selector.clone())
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    /// Per-object admission.
    pub fn admit(&self, obj: &DynamicObject) -> bool {
        let meta = &obj.metadata;
        if meta.namespace.as_deref() != Some(self.namespace.as_str()) { return false; }
        if !self.selector.matches(meta.labels.as_ref()) { return false; }
        if is_controlled(meta) { return false; }
        let name = name_of(obj);
        !DENY_NAMES.iter().any(|deny| name.contains(deny))
    }

    /// A terminating source object still held by our marker. It must reach the engine even
    /// after it stopped being admitted (relabelled, adopted by a controller), or it never
    /// finishes deleting.
    pub fn must_release(&self, obj: &DynamicObject) -> bool {
        let meta = &obj.metadata;
        meta.namespace.as_deref() == Some(self.namespace.as_str()) && is_terminating(meta) && has_finalizer(meta)
    }

    /// Whether an object is handed to the engine at all.
    pub fn passes(&self, obj: &DynamicObject) -> bool { self.admit(obj) || self.must_release(obj) }

    /// Per-kind admission: list+watch capable and matched by a name matcher (or no matchers at all).
    pub fn should_watch(&self, desc: &KindDescriptor, resolver: &dyn CapabilityResolver) -> bool {
        if !resolver.is_watchable(&desc.id) { return false; }
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.admits(desc))
    }
}

/// Build the registry of kinds to mirror from everything the resolver serves.
pub fn build_registry(resolver: &dyn CapabilityResolver, filter: &Filter) -> KindRegistry {
    let mut reg = KindRegistry::new();
    for desc in resolver.kinds() {
        if filter.should_watch(&desc, resolver) {
            reg.observe(desc);
        } else {
            debug!(gvk = %desc.id, "kind not selected");
        }
    }
    reg
}
