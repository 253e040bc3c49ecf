//! Pure tenant <-> super translation. Every function here is
//! deterministic and side-effect free: given the same tenant object and
//! cluster key, `to_super_namespace`/`build_super_object` always produce
//! the same result, and `super_owner` always inverts them. Keeping the
//! mapping pure is what lets DWS/UWS treat it as a spec rather than a
//! procedure (spec.md's bijection invariant).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use vc_types::{PASSTHROUGH_NODE_LABELS, annotations};

/// Identifies the tenant-side object a super-space object was translated
/// from, recovered by reading the object's own annotations back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualOwner {
    pub cluster_key: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

/// Deterministic super-cluster namespace for a `(cluster_key, namespace)`
/// pair. Kubernetes namespace names are capped at 63 characters, so
/// long tenant namespaces are shortened by hashing rather than
/// truncating (truncation would collide between `foo-a` and `foo-b`
/// once both are cut to the same prefix).
pub fn to_super_namespace(cluster_key: &str, tenant_namespace: &str) -> String {
    let raw = format!("{cluster_key}-{tenant_namespace}");
    if raw.len() <= 63 {
        return raw;
    }
    let hash = crate::util::hash_spec(&raw);
    format!("{}-{}", &hash[..16], tenant_namespace.chars().take(20).collect::<String>())
}

/// Builds the super-space `ObjectMeta` for a tenant object being synced
/// downward: copies name, strips tenant-internal annotations under
/// `opaque_meta_domains`, and stamps identity annotations so the
/// reverse mapping (`super_owner`) can recover the tenant coordinates
/// later without a side table.
pub fn build_super_meta(
    cluster_key: &str,
    tenant_namespace: &str,
    tenant_name: &str,
    tenant_uid: Option<&str>,
    tenant_labels: &BTreeMap<String, String>,
    tenant_annotations: &BTreeMap<String, String>,
    opaque_meta_domains: &[String],
) -> ObjectMeta {
    let mut annotations = BTreeMap::new();
    for (k, v) in tenant_annotations {
        if opaque_meta_domains.iter().any(|d| k.starts_with(d.as_str())) {
            continue;
        }
        annotations.insert(k.clone(), v.clone());
    }
    annotations.insert(vc_types::annotations::CLUSTER.to_string(), cluster_key.to_string());
    annotations.insert(
        vc_types::annotations::NAMESPACE.to_string(),
        tenant_namespace.to_string(),
    );
    annotations.insert(vc_types::annotations::NAME.to_string(), tenant_name.to_string());
    if let Some(uid) = tenant_uid {
        annotations.insert(annotations::UID.to_string(), uid.to_string());
    }

    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    for label in PASSTHROUGH_NODE_LABELS {
        if let Some(v) = tenant_labels.get(*label) {
            labels.insert(label.to_string(), v.clone());
        }
    }
    for (k, v) in tenant_labels {
        if !opaque_meta_domains.iter().any(|d| k.starts_with(d.as_str())) {
            labels.insert(k.clone(), v.clone());
        }
    }

    ObjectMeta {
        name: Some(tenant_name.to_string()),
        namespace: Some(to_super_namespace(cluster_key, tenant_namespace)),
        annotations: Some(annotations),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Inverts `build_super_meta`: recovers which tenant object a
/// super-space object was derived from, or `None` if it lacks the
/// required identity annotations (i.e. it wasn't created by this
/// syncer).
pub fn super_owner(meta: &ObjectMeta) -> Option<VirtualOwner> {
    let annotations = meta.annotations.as_ref()?;
    Some(VirtualOwner {
        cluster_key: annotations.get(vc_types::annotations::CLUSTER)?.clone(),
        namespace: annotations.get(vc_types::annotations::NAMESPACE)?.clone(),
        name: annotations.get(vc_types::annotations::NAME)?.clone(),
        uid: annotations.get(vc_types::annotations::UID).cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_namespace_is_stable_for_short_names() {
        let a = to_super_namespace("cluster-1", "default");
        let b = to_super_namespace("cluster-1", "default");
        assert_eq!(a, b);
        assert_eq!(a, "cluster-1-default");
    }

    #[test]
    fn super_namespace_falls_back_to_hash_when_too_long() {
        let long = "a".repeat(80);
        let ns = to_super_namespace("cluster-1", &long);
        assert!(ns.len() <= 63);
    }

    #[test]
    fn build_and_recover_roundtrips() {
        let labels = BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())]);
        let meta = build_super_meta(
            "cluster-1",
            "team-a",
            "widget",
            Some("uid-123"),
            &labels,
            &BTreeMap::new(),
            &[],
        );
        let owner = super_owner(&meta).expect("owner recovered");
        assert_eq!(owner.cluster_key, "cluster-1");
        assert_eq!(owner.namespace, "team-a");
        assert_eq!(owner.name, "widget");
        assert_eq!(owner.uid.as_deref(), Some("uid-123"));
        assert_eq!(meta.labels.unwrap().get("kubernetes.io/os").unwrap(), "linux");
    }

    #[test]
    fn opaque_meta_domains_are_stripped() {
        let annotations = BTreeMap::from([
            ("internal.tenant.io/secret".to_string(), "x".to_string()),
            ("app.kubernetes.io/name".to_string(), "widget".to_string()),
        ]);
        let meta = build_super_meta(
            "cluster-1",
            "team-a",
            "widget",
            None,
            &BTreeMap::new(),
            &annotations,
            &["internal.tenant.io/".to_string()],
        );
        let got = meta.annotations.unwrap();
        assert!(!got.contains_key("internal.tenant.io/secret"));
        assert_eq!(got.get("app.kubernetes.io/name").unwrap(), "widget");
    }

    #[test]
    fn super_owner_returns_none_without_identity_annotations() {
        let meta = ObjectMeta::default();
        assert_eq!(super_owner(&meta), None);
    }
}
