//! kmirror diff: renders every observed source change as a structured summary of what moved.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use kmirror_core::meta::object_key;
use kmirror_core::{ChangeEvent, ChangeKind, DiffSink};

/// Changed paths reported per summary; counts stay exact past this.
const PATH_LIMIT: usize = 8;

fn max_diff_nodes() -> usize {
    std::env::var("KMIRROR_DIFF_MAX_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// Whether `v` has at least `max` JSON nodes. Stops counting at the budget.
fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    let mut pending = vec![v];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen >= max { return true; }
        match node {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    /// First few changed paths, dotted, with `[i]` for array elements.
    pub paths: Vec<String>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds + self.updates + self.removes == 0 }
}

/// Server-maintained metadata that moves on every write.
const NOISY_META: &[&str] = &["managedFields", "resourceVersion", "generation", "creationTimestamp"];

/// kubectl's copy of the whole object; diffing it doubles every change.
const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Reduce an object to what a mirror would carry. Finalizers, owner references and the
/// remaining annotations are kept: a new finalizer or owner is a change worth reporting.
pub fn strip_noisy(mut v: Json) -> Json {
    let Some(obj) = v.as_object_mut() else { return v };
    obj.remove("status");
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in NOISY_META {
            meta.remove(*k);
        }
        let drop_annotations = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
            Some(ann) => {
                ann.remove(LAST_APPLIED);
                ann.is_empty()
            }
            None => false,
        };
        if drop_annotations { meta.remove("annotations"); }
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn note(s: &mut DiffSummary, path: String) {
        if s.paths.len() < PATH_LIMIT { s.paths.push(path); }
    }
    fn join(prefix: &str, key: &str) -> String {
        if prefix.is_empty() { key.to_string() } else { format!("{}.{}", prefix, key) }
    }
    fn walk(a: &Json, b: &Json, path: &str, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, &join(path, k), s),
                        None => {
                            s.adds += 1;
                            note(s, join(path, k));
                        }
                    }
                }
                for k in bo.keys() {
                    if !ao.contains_key(k) {
                        s.removes += 1;
                        note(s, join(path, k));
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        s.updates += 1;
                        note(s, format!("{}[{}]", path, i));
                    }
                }
                if aa.len() > bb.len() {
                    s.adds += aa.len() - bb.len();
                    note(s, format!("{}[{}..]", path, min_len));
                }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                    note(s, format!("{}[{}..]", path, min_len));
                }
            }
            // scalars differ or the type changed
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                    note(s, path.to_string());
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, "", &mut s);
    s
}

/// Diff sink that keeps the last seen version of every object and logs what changed.
#[derive(Default)]
pub struct SummaryDiff {
    last: Mutex<FxHashMap<String, Json>>,
}

impl SummaryDiff {
    pub fn new() -> Self { Self::default() }

    /// Objects with a baseline.
    pub fn tracked(&self) -> usize { self.last.lock().unwrap_or_else(|e| e.into_inner()).len() }

    /// Summary of `current` against the previous baseline for `key`, which `current` then
    /// replaces. `None` on first sighting.
    pub fn record(&self, key: &str, current: Json) -> Option<DiffSummary> {
        let current = strip_noisy(current);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let summary = last.get(key).map(|prev| diff_summary(&current, prev));
        last.insert(key.to_string(), current);
        summary
    }

    pub fn forget(&self, key: &str) -> bool {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).remove(key).is_some()
    }
}

impl DiffSink for SummaryDiff {
    fn observe(&self, event: &ChangeEvent) {
        let gvk = &event.resource.id;
        let key = format!("{}:{}", gvk, object_key(&event.object));
        if event.change == ChangeKind::Deleted {
            self.forget(&key);
            counter!("diff_deleted_total", 1u64);
            info!(gvk = %gvk, object = %object_key(&event.object), "deleted");
            return;
        }
        let json = match serde_json::to_value(&event.object) {
            Ok(v) => v,
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "cannot render object for diff");
                return;
            }
        };
        if node_budget_exceeded(&json, max_diff_nodes()) {
            self.forget(&key);
            info!(gvk = %gvk, object = %object_key(&event.object), "changed (too large to diff)");
            return;
        }
        match self.record(&key, json) {
            None => {
                counter!("diff_observed_total", 1u64);
                info!(gvk = %gvk, object = %object_key(&event.object), "observed");
            }
            Some(s) if s.is_empty() => debug!(gvk = %gvk, object = %object_key(&event.object), "no change"),
            Some(s) => {
                counter!("diff_changed_total", 1u64);
                info!(
                    gvk = %gvk,
                    object = %object_key(&event.object),
                    adds = s.adds,
                    updates = s.updates,
                    removes = s.removes,
                    paths = ?s.paths,
                    "changed"
                );
            }
        }
    }
}
