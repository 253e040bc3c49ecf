//! Patrol: a periodic full sweep comparing every super-side object this
//! syncer owns against its tenant source of truth, re-driving DWS for
//! anything whose `vcluster.io/spec-hash` annotation no longer matches
//! — drift that a missed watch event would otherwise leave unfixed
//! indefinitely. Complements DWS/UWS's event-driven sync rather than
//! replacing it.
//!
//! A sweep covers three cases: present-in-both with a stale hash
//! (update), present-in-super but the tenant source is gone (delete),
//! and present-in-tenant with no super counterpart yet (create). All
//! three are re-driven the same way: enqueue the `WorkItem` and let the
//! regular DWS worker loop decide create/update/delete from what it
//! finds in the tenant cache.

use kube::{Resource, ResourceExt};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::mcc::WorkItem;
use crate::translate;
use crate::util::{colors::FG2, hash_spec};
use tokio_util::sync::CancellationToken;

/// Compares `super_obj`'s stamped spec hash against a freshly computed
/// one for `tenant_obj`; `true` means drift was found and a
/// `WorkItem` was queued for DWS to fix it.
pub fn detect_drift<K>(super_obj: &K, tenant_obj: &K) -> bool
where
    K: Resource + Serialize,
{
    let stamped = super_obj
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(vc_types::annotations::SPEC_HASH))
        .cloned();
    let current = hash_spec(tenant_obj);
    stamped.as_deref() != Some(current.as_str())
}

/// Runs one sweep: `supers` is every super-side object this syncer owns
/// (recognized by `translate::super_owner`); `tenants` is every known
/// tenant object, paired with the cluster it came from. Returns the
/// number of `WorkItem`s requeued.
pub async fn sweep<K>(supers: &[K], tenants: &[(String, K)], queue: &crate::fwq::FairQueue<WorkItem>) -> usize
where
    K: Resource + ResourceExt + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    let mut requeued = 0;
    let mut known: HashSet<(String, String, String)> = HashSet::new();

    let mut tenant_by_key: HashMap<(String, String, String), &K> = HashMap::new();
    for (cluster_key, tenant_obj) in tenants {
        if let Some(namespace) = tenant_obj.namespace() {
            let name = tenant_obj.name_any();
            tenant_by_key.insert((cluster_key.clone(), namespace, name), tenant_obj);
        }
    }

    for super_obj in supers {
        let Some(owner) = translate::super_owner(super_obj.meta()) else {
            continue;
        };
        let key = (owner.cluster_key.clone(), owner.namespace.clone(), owner.name.clone());
        known.insert(key.clone());

        let tenant_obj = tenant_by_key.get(&key).copied();
        let needs_sync = match tenant_obj {
            None => true,
            Some(t) => detect_drift(super_obj, t),
        };
        if !needs_sync {
            continue;
        }
        let reason = if tenant_obj.is_none() { "tenant source deleted" } else { "hash drift" };
        println!("{} {reason} for {}/{}", "🩹".color(FG2), owner.namespace, owner.name);
        queue
            .add(WorkItem {
                cluster_key: owner.cluster_key,
                namespace: Some(owner.namespace),
                name: owner.name,
            })
            .await;
        requeued += 1;
    }

    for (cluster_key, tenant_obj) in tenants {
        let Some(namespace) = tenant_obj.namespace() else {
            continue;
        };
        let name = tenant_obj.name_any();
        if known.contains(&(cluster_key.clone(), namespace.clone(), name.clone())) {
            continue;
        }
        println!("{} tenant object has no super counterpart yet for {}/{}", "🩹".color(FG2), namespace, name);
        queue
            .add(WorkItem {
                cluster_key: cluster_key.clone(),
                namespace: Some(namespace),
                name,
            })
            .await;
        requeued += 1;
    }

    requeued
}

/// Background loop driving `sweep` on a fixed period until cancelled.
/// `list_supers`/`list_tenants` are handed in rather than hardcoded to
/// a kube `Api` call so the same loop drives any synced kind; a
/// manager supplies closures over its own registry/MCC state.
pub async fn run<K, FSupers, FutSupers, FTenants, FutTenants>(
    period: Duration,
    cancel: CancellationToken,
    list_supers: FSupers,
    list_tenants: FTenants,
    queue: crate::fwq::FairQueue<WorkItem>,
) where
    K: Resource + ResourceExt + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
    FSupers: Fn() -> FutSupers,
    FutSupers: Future<Output = Vec<K>>,
    FTenants: Fn() -> FutTenants,
    FutTenants: Future<Output = Vec<(String, K)>>,
{
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let supers = list_supers().await;
        let tenants = list_tenants().await;
        let n = sweep(&supers, &tenants, &queue).await;
        if n > 0 {
            println!("{}", format!("🩹 patrol requeued {n} drifted object(s)").yellow());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwq::FairQueue;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use vc_types::annotations;

    fn tenant_cm(namespace: &str, name: &str, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    fn super_cm(cluster_key: &str, namespace: &str, name: &str, tenant: &ConfigMap) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("super-ns".to_string()),
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([
                    (annotations::CLUSTER.to_string(), cluster_key.to_string()),
                    (annotations::NAMESPACE.to_string(), namespace.to_string()),
                    (annotations::NAME.to_string(), name.to_string()),
                    (annotations::SPEC_HASH.to_string(), hash_spec(tenant)),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn queue() -> FairQueue<WorkItem> {
        FairQueue::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn matching_hash_requeues_nothing() {
        let tenant = tenant_cm("ns", "a", "v1");
        let sup = super_cm("c1", "ns", "a", &tenant);
        let q = queue();
        let n = sweep(&[sup], &[("c1".to_string(), tenant)], &q).await;
        assert_eq!(n, 0);
        assert_eq!(q.len().await, 0);
    }

    #[tokio::test]
    async fn drifted_hash_requeues_an_update() {
        let old_tenant = tenant_cm("ns", "a", "v1");
        let new_tenant = tenant_cm("ns", "a", "v2");
        let sup = super_cm("c1", "ns", "a", &old_tenant);
        let q = queue();
        let n = sweep(&[sup], &[("c1".to_string(), new_tenant)], &q).await;
        assert_eq!(n, 1);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn tenant_source_gone_requeues_a_delete() {
        let tenant = tenant_cm("ns", "a", "v1");
        let sup = super_cm("c1", "ns", "a", &tenant);
        let q = queue();
        let n = sweep(&[sup], &[], &q).await;
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn tenant_without_super_counterpart_requeues_a_create() {
        let tenant = tenant_cm("ns", "new", "v1");
        let q = queue();
        let n = sweep::<ConfigMap>(&[], &[("c1".to_string(), tenant)], &q).await;
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn unowned_super_object_is_ignored() {
        let unowned = ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("super-ns".to_string()),
                name: Some("unrelated".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let q = queue();
        let n = sweep::<ConfigMap>(&[unowned], &[], &q).await;
        assert_eq!(n, 0);
    }
}
