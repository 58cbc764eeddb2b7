//! Mirror configuration: namespaces, kind name matchers and label selector.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, MirrorResult};
use crate::kind::KindDescriptor;

pub const DEFAULT_QUEUE_CAP: usize = 100;
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(5);

/// Matcher of the form `<resource-or-kind>.<group>`; `*` as resource matches any kind in the group.
///
/// The string is split at the first `.`: `deployments.apps` targets group `apps`, a bare
/// `services` targets the core group, and `ingresses.networking.k8s.io` targets
/// `networking.k8s.io`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMatcher {
    pub resource: String,
    pub group: String,
}

impl NameMatcher {
    pub fn parse(s: &str) -> MirrorResult<Self> {
        let s = s.trim();
        let (resource, group) = s.split_once('.').unwrap_or((s, ""));
        if resource.is_empty() {
            return Err(MirrorError::InvalidConfig(format!("invalid matcher: {:?} (expect <resource>.<group>)", s)));
        }
        Ok(Self { resource: resource.to_string(), group: group.to_string() })
    }

    pub fn admits(&self, desc: &KindDescriptor) -> bool {
        let name_ok = self.resource == "*"
            || desc.plural == self.resource
            || desc.id.kind.to_lowercase() == self.resource;
        name_ok && desc.id.group == self.group
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

/// Equality-based label selector (`a=b,c!=d,e,!f`). The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn parse(s: &str) -> MirrorResult<Self> {
        let mut requirements = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(label_key(k, term)?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(label_key(k, term)?, v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(label_key(k, term)?)
            } else {
                Requirement::Exists(label_key(term, term)?)
            };
            requirements.push(req);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        self.requirements.iter().all(|r| match r {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
        })
    }
}

fn label_key(k: &str, term: &str) -> MirrorResult<String> {
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) {
        return Err(MirrorError::InvalidConfig(format!("invalid selector term: {:?}", term)));
    }
    Ok(k.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub source_namespace: String,
    pub target_namespace: String,
    pub matchers: Vec<NameMatcher>,
    pub selector: LabelSelector,
    pub queue_capacity: usize,
    pub warmup: Duration,
}

impl MirrorConfig {
    pub fn new(source_namespace: impl Into<String>, target_namespace: impl Into<String>) -> Self {
        Self {
            source_namespace: source_namespace.into(),
            target_namespace: target_namespace.into(),
            matchers: Vec::new(),
            selector: LabelSelector::everything(),
            queue_capacity: DEFAULT_QUEUE_CAP,
            warmup: DEFAULT_WARMUP,
        }
    }

    /// `same_cluster` is false when the target lives behind another kube context.
    pub fn validate(&self, same_cluster: bool) -> MirrorResult<()> {
        if self.source_namespace.is_empty() || self.target_namespace.is_empty() {
            return Err(MirrorError::InvalidConfig("source and target namespace are required".into()));
        }
        if same_cluster && self.source_namespace == self.target_namespace {
            return Err(MirrorError::InvalidConfig(format!(
                "source and target namespace are both {:?} on the same cluster",
                self.source_namespace
            )));
        }
        if self.queue_capacity == 0 {
            return Err(MirrorError::InvalidConfig("queue capacity must be > 0".into()));
        }
        Ok(())
    }
}
