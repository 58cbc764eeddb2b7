//! Registry of kinds selected for mirroring.
//!
//! One entry per (group, kind). When several versions of the same kind are observed, only
//! the one with the highest [`VersionRank`] is kept, whatever the arrival order.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::kind::{KindDescriptor, VersionRank};

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<(String, String), KindDescriptor>,
}

impl KindRegistry {
    pub fn new() -> Self { Self::default() }

    /// Merge a descriptor into the registry. Returns true when the registry changed.
    pub fn observe(&mut self, desc: KindDescriptor) -> bool {
        let key = (desc.id.group.clone(), desc.id.kind.clone());
        match self.kinds.get_mut(&key) {
            Some(cur) => {
                if VersionRank::parse(&desc.id.version) > VersionRank::parse(&cur.id.version) {
                    debug!(from = %cur.id, to = %desc.id, "registry: preferring higher version");
                    *cur = desc;
                    true
                } else {
                    false
                }
            }
            None => {
                self.kinds.insert(key, desc);
                true
            }
        }
    }

    pub fn get(&self, group: &str, kind: &str) -> Option<&KindDescriptor> {
        self.kinds.get(&(group.to_string(), kind.to_string()))
    }

    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// Registered kinds in stable (group, kind) order.
    pub fn kinds(&self) -> Vec<KindDescriptor> {
        let mut out: Vec<_> = self.kinds.values().cloned().collect();
        out.sort_by(|a, b| a.id.group.cmp(&b.id.group).then(a.id.kind.cmp(&b.id.kind)));
        out
    }
}

impl FromIterator<KindDescriptor> for KindRegistry {
    fn from_iter<I: IntoIterator<Item = KindDescriptor>>(iter: I) -> Self {
        let mut reg = KindRegistry::new();
        for d in iter { reg.observe(d); }
        reg
    }
}
