//! One full pass over every registered kind at startup, so objects that existed before the
//! watch began are mirrored too.

use metrics::counter;
use tracing::{error, info, warn};

use kmirror_core::meta::name_of;
use kmirror_core::{CapabilityResolver, KindId, KindRegistry, ObjectStore, Scope};

use crate::engine::{Engine, Outcome};
use crate::filter::Filter;

/// Per-kind counts from a bootstrap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub listed: usize,
    pub admitted: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Vetoed or empty target.
    pub skipped: usize,
    pub retired: usize,
    /// Terminating without our marker; only the mirror was deleted.
    pub removed: usize,
    pub errors: usize,
}

impl Tally {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Retired(_) => self.retired += 1,
            Outcome::Removed => self.removed += 1,
            Outcome::Vetoed | Outcome::EmptyTarget => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindOutcome {
    Synced(Tally),
    /// Cluster-scoped kinds are not mirrored.
    Unsupported,
    /// Discovery no longer maps the kind.
    Unresolved(String),
    /// Listing the kind failed; the pass moved on.
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub kinds: Vec<(KindId, KindOutcome)>,
}

impl BootstrapReport {
    pub fn outcome(&self, id: &KindId) -> Option<&KindOutcome> {
        self.kinds.iter().find(|(k, _)| k == id).map(|(_, o)| o)
    }

    /// Sum of the per-kind tallies.
    pub fn total(&self) -> Tally {
        let mut t = Tally::default();
        for (_, o) in &self.kinds {
            if let KindOutcome::Synced(k) = o {
                t.listed += k.listed;
                t.admitted += k.admitted;
                t.created += k.created;
                t.updated += k.updated;
                t.unchanged += k.unchanged;
                t.skipped += k.skipped;
                t.retired += k.retired;
                t.removed += k.removed;
                t.errors += k.errors;
            }
        }
        t
    }

    pub fn unsupported(&self) -> Vec<&KindId> {
        self.kinds.iter().filter(|(_, o)| *o == KindOutcome::Unsupported).map(|(k, _)| k).collect()
    }

    pub fn unresolved(&self) -> Vec<&KindId> {
        self.kinds.iter().filter(|(_, o)| matches!(o, KindOutcome::Unresolved(_))).map(|(k, _)| k).collect()
    }

    pub fn failed(&self) -> Vec<&KindId> {
        self.kinds.iter().filter(|(_, o)| matches!(o, KindOutcome::Failed(_))).map(|(k, _)| k).collect()
    }
}

/// List every registered kind in the source namespace and reconcile each admitted object.
///
/// Each kind is resolved again first, so its scope reflects current discovery. Failures never
/// abort the pass: a kind that cannot be resolved or listed is reported and skipped, and a
/// single object that fails to reconcile is logged and counted.
pub async fn run_once(
    registry: &KindRegistry,
    resolver: &dyn CapabilityResolver,
    source: &dyn ObjectStore,
    filter: &Filter,
    engine: &Engine,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();
    for registered in registry.kinds() {
        let resolved = match resolver.resolve(&registered.id) {
            Ok(k) => k,
            Err(e) => {
                warn!(gvk = %registered.id, error = %e, "kind skipped: cannot resolve");
                report.kinds.push((registered.id, KindOutcome::Unresolved(e.to_string())));
                continue;
            }
        };
        let kind = &resolved;
        if kind.scope == Scope::Cluster {
            warn!(gvk = %kind.id, "cluster-scoped kind is not mirrored");
            counter!("mirror_unsupported_kinds_total", 1u64);
            report.kinds.push((kind.id.clone(), KindOutcome::Unsupported));
            continue;
        }
        let objects = match source.list(kind, filter.namespace()).await {
            Ok(v) => v,
            Err(e) => {
                error!(gvk = %kind.id, error = %e, "bootstrap list failed");
                report.kinds.push((kind.id.clone(), KindOutcome::Failed(e.to_string())));
                continue;
            }
        };
        let mut tally = Tally { listed: objects.len(), ..Tally::default() };
        for obj in objects.into_iter().filter(|o| filter.passes(o)) {
            tally.admitted += 1;
            let name = name_of(&obj).to_string();
            match engine.reconcile(kind, obj).await {
                Ok(outcome) => tally.record(&outcome),
                Err(e) => {
                    tally.errors += 1;
                    counter!("mirror_errors_total", 1u64);
                    error!(gvk = %kind.id, name = %name, error = %e, "bootstrap reconcile failed");
                }
            }
        }
        info!(gvk = %kind.id, listed = tally.listed, admitted = tally.admitted, created = tally.created, "bootstrap kind done");
        report.kinds.push((kind.id.clone(), KindOutcome::Synced(tally)));
    }
    report
}
