//! Per-kind sanitization applied before an object is written to the target namespace.
//!
//! Rules are pure and looked up by (group, kind). A new rule is a new [`Rule`] variant
//! plus a row in [`RULES`].

use kube::core::DynamicObject;
use serde_json::Value as Json;

use kmirror_core::KindId;

/// Secrets carrying this annotation are service-account tokens; the target mints its own.
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Service,
    Secret,
    ServiceAccount,
}

pub const RULES: &[(&str, &str, Rule)] = &[
    ("", "Service", Rule::Service),
    ("", "Secret", Rule::Secret),
    ("", "ServiceAccount", Rule::ServiceAccount),
];

pub fn rule_for(id: &KindId) -> Option<Rule> {
    RULES.iter().find(|(g, k, _)| *g == id.group && *k == id.kind).map(|(_, _, r)| *r)
}

/// Returns `None` when the object must not be mirrored at all.
pub fn sanitize(id: &KindId, obj: DynamicObject) -> Option<DynamicObject> {
    match rule_for(id) {
        Some(Rule::Service) => Some(service(obj)),
        Some(Rule::Secret) => secret(obj),
        Some(Rule::ServiceAccount) => Some(service_account(obj)),
        None => Some(obj),
    }
}

fn service(mut obj: DynamicObject) -> DynamicObject {
    if let Some(spec) = obj.data.get_mut("spec").and_then(Json::as_object_mut) {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
        if let Some(ports) = spec.get_mut("ports").and_then(Json::as_array_mut) {
            for port in ports.iter_mut().filter_map(Json::as_object_mut) {
                if port.get("nodePort").and_then(Json::as_i64).unwrap_or(0) != 0 {
                    port.insert("nodePort".into(), Json::from(0));
                }
            }
        }
    }
    obj
}

fn secret(obj: DynamicObject) -> Option<DynamicObject> {
    let is_sa_token = obj
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(SERVICE_ACCOUNT_NAME_ANNOTATION))
        .unwrap_or(false);
    if is_sa_token { None } else { Some(obj) }
}

fn service_account(mut obj: DynamicObject) -> DynamicObject {
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("secrets");
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_core::{KindDescriptor, Scope};
    use serde_json::json;

    fn core(kind: &str, plural: &str) -> KindDescriptor {
        KindDescriptor::new(KindId::new("", "v1", kind), plural, Scope::Namespaced)
    }

    fn obj(kind: &KindDescriptor, name: &str, data: Json) -> DynamicObject {
        DynamicObject::new(name, &kind.api_resource()).within("src").data(data)
    }

    #[test]
    fn service_drops_allocated_addresses_and_node_ports() {
        let k = core("Service", "services");
        let o = obj(&k, "web", json!({
            "spec": {
                "type": "NodePort",
                "clusterIP": "10.0.0.5",
                "clusterIPs": ["10.0.0.5"],
                "selector": { "app": "web" },
                "ports": [
                    { "name": "http", "port": 80, "targetPort": 8080, "nodePort": 30080 },
                    { "name": "metrics", "port": 9090 }
                ]
            }
        }));
        let out = sanitize(&k.id, o).expect("services are mirrored");
        assert_eq!(out.data, json!({
            "spec": {
                "type": "NodePort",
                "selector": { "app": "web" },
                "ports": [
                    { "name": "http", "port": 80, "targetPort": 8080, "nodePort": 0 },
                    { "name": "metrics", "port": 9090 }
                ]
            }
        }));
    }

    #[test]
    fn service_account_token_secret_is_vetoed() {
        let k = core("Secret", "secrets");
        let mut o = obj(&k, "builder-token-abcde", json!({ "type": "kubernetes.io/service-account-token" }));
        o.metadata.annotations = Some([(SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(), "builder".to_string())].into_iter().collect());
        assert!(sanitize(&k.id, o).is_none());
    }

    #[test]
    fn plain_secret_passes_through() {
        let k = core("Secret", "secrets");
        let o = obj(&k, "db-creds", json!({ "type": "Opaque", "data": { "password": "aHVudGVyMg==" } }));
        let out = sanitize(&k.id, o.clone()).expect("mirrored");
        assert_eq!(out.data, o.data);
    }

    #[test]
    fn service_account_loses_secret_refs() {
        let k = core("ServiceAccount", "serviceaccounts");
        let o = obj(&k, "default", json!({
            "secrets": [{ "name": "default-token-1" }, { "name": "default-dockercfg-2" }],
            "imagePullSecrets": [{ "name": "registry" }]
        }));
        let out = sanitize(&k.id, o).unwrap();
        assert!(out.data.get("secrets").is_none());
        assert_eq!(out.data["imagePullSecrets"], json!([{ "name": "registry" }]));
    }

    #[test]
    fn rules_are_keyed_by_group_too() {
        let knative = KindDescriptor::new(KindId::new("serving.knative.dev", "v1", "Service"), "services", Scope::Namespaced);
        assert_eq!(rule_for(&knative.id), None);
        let o = obj(&knative, "hello", json!({ "spec": { "clusterIP": "keep" } }));
        assert_eq!(sanitize(&knative.id, o).unwrap().data["spec"]["clusterIP"], "keep");
    }

    #[test]
    fn other_kinds_are_untouched() {
        let k = core("ConfigMap", "configmaps");
        let o = obj(&k, "settings", json!({ "data": { "a": "1" } }));
        assert_eq!(sanitize(&k.id, o.clone()).unwrap().data, o.data);
    }
}
