//! Kind identifiers, resolved descriptors and API version priority.

use std::fmt;

use kube::core::ApiResource;
use serde::{Deserialize, Serialize};

/// Group/Version/Kind triple. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindId {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// A kind resolved to its collection endpoint (plural resource name) and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub id: KindId,
    pub plural: String,
    pub scope: Scope,
}

impl KindDescriptor {
    pub fn new(id: KindId, plural: impl Into<String>, scope: Scope) -> Self {
        Self { id, plural: plural.into(), scope }
    }

    pub fn namespaced(&self) -> bool { self.scope == Scope::Namespaced }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.id.group.clone(),
            version: self.id.version.clone(),
            api_version: self.id.api_version(),
            kind: self.id.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stability {
    Alpha,
    Beta,
    Stable,
}

/// Ordering key for API versions.
///
/// Versions shaped like `v2`, `v1beta1`, `v1alpha3` rank stable > beta > alpha, then by
/// major, then by the alpha/beta number. Anything else ranks below every such version and
/// compares lexically with its peers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionRank {
    Other(String),
    Kube { stability: Stability, major: u32, minor: u32 },
}

impl VersionRank {
    pub fn parse(version: &str) -> Self {
        Self::parse_kube(version).unwrap_or_else(|| VersionRank::Other(version.to_string()))
    }

    fn parse_kube(version: &str) -> Option<Self> {
        let rest = version.strip_prefix('v')?;
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 { return None; }
        let major: u32 = rest[..digits].parse().ok()?;
        let tail = &rest[digits..];
        if tail.is_empty() {
            return Some(VersionRank::Kube { stability: Stability::Stable, major, minor: 0 });
        }
        let (stability, num) = if let Some(n) = tail.strip_prefix("beta") {
            (Stability::Beta, n)
        } else if let Some(n) = tail.strip_prefix("alpha") {
            (Stability::Alpha, n)
        } else {
            return None;
        };
        if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) { return None; }
        Some(VersionRank::Kube { stability, major, minor: num.parse().ok()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_group_version_kind() {
        assert_eq!(KindId::new("", "v1", "Service").to_string(), "v1/Service");
        assert_eq!(KindId::new("apps", "v1", "Deployment").to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn version_rank_orders_stability_then_numbers() {
        let mut versions = vec!["v1alpha1", "v2beta1", "v1", "foo", "v1beta2", "v2", "v1beta1", "v10"];
        versions.sort_by_key(|v| std::cmp::Reverse(VersionRank::parse(v)));
        assert_eq!(versions, vec!["v10", "v2", "v1", "v2beta1", "v1beta2", "v1beta1", "v1alpha1", "foo"]);
    }

    #[test]
    fn malformed_versions_are_other() {
        for v in ["v", "vbeta1", "v1gamma1", "v1beta", "1", "v1beta1x"] {
            assert!(matches!(VersionRank::parse(v), VersionRank::Other(_)), "{}", v);
        }
    }

    #[test]
    fn api_resource_uses_plural_and_api_version() {
        let d = KindDescriptor::new(KindId::new("apps", "v1", "Deployment"), "deployments", Scope::Namespaced);
        let ar = d.api_resource();
        assert_eq!(ar.api_version, "apps/v1");
        assert_eq!(ar.plural, "deployments");
        assert_eq!(ar.group, "apps");
    }
}
