//! Namespace/quota and pod reconciliation: reads requested quota off a
//! tenant `Namespace`, drives it through `SchedulerEngine`, and writes
//! the resulting placement back as the `scheduled-placements`
//! annotation (spec.md §4.8's namespace/quota data flow); `reconcile_pod`
//! does the pod-level equivalent, writing `scheduled-cluster`.
//!
//! Open Question resolution (see DESIGN.md): spec.md doesn't name a wire
//! format for the quota *request* itself (only the output annotations
//! are specified), so this crate defines `REQUESTED_QUOTA`/`QUOTA_SLICE`
//! input annotations on the tenant `Namespace`, read the same way
//! `translate` reads identity annotations.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use owo_colors::OwoColorize;
use serde_json::json;
use vc_types::{PlacementMap, ResourceList, ResourceSlice, annotations};

use crate::scheduler::SchedulerEngine;
use crate::util::{self, Error, colors::FG2};

/// Input annotation carrying the tenant namespace's total requested
/// quota, as a JSON `ResourceList`.
pub const REQUESTED_QUOTA: &str = "vcluster.io/requested-quota";
/// Input annotation carrying the fixed size of one quota slice, as a
/// JSON `ResourceList`. `expected = floor(quota / quotaSlice)` per
/// resource, taking the minimum across resources (spec.md §4.8 step 1).
pub const QUOTA_SLICE: &str = "vcluster.io/quota-slice";

fn namespace_key(cluster_key: &str, namespace_name: &str) -> String {
    format!("{cluster_key}/{namespace_name}")
}

/// Expands a namespace's requested-quota/quota-slice annotations into
/// the fixed-size slices `ScheduleNamespace` expects. `None` when either
/// annotation is missing, unparsable, or the slice size has a
/// non-positive component (nothing to slice into).
pub fn slices_for(namespace: &Namespace) -> Option<(Vec<ResourceSlice>, ResourceList)> {
    let annotations = namespace.annotations();
    let quota: ResourceList = serde_json::from_str(annotations.get(REQUESTED_QUOTA)?).ok()?;
    let quota_slice: ResourceList = serde_json::from_str(annotations.get(QUOTA_SLICE)?).ok()?;

    if quota_slice.is_empty() || quota_slice.values().any(|v| *v <= 0) {
        return None;
    }

    let expected = quota
        .iter()
        .filter_map(|(resource, want)| quota_slice.get(resource).map(|amount| want / amount))
        .min()
        .unwrap_or(0)
        .max(0);

    let slices = (0..expected)
        .map(|_| ResourceSlice {
            request: quota_slice.clone(),
            mandatory: None,
            hint: None,
        })
        .collect();
    Some((slices, quota_slice))
}

/// Reads any existing `scheduled-placements` annotation off `namespace`,
/// for rehydrating the engine's cache on first sight of a namespace this
/// process hasn't scheduled itself (`EnsureNamespacePlacements`,
/// spec.md §4.8).
fn existing_placement(namespace: &Namespace) -> Option<PlacementMap> {
    serde_json::from_str(namespace.annotations().get(annotations::SCHEDULED_PLACEMENTS)?).ok()
}

/// One reconcile pass for `namespace` on behalf of `cluster_key`.
/// Rehydrates the cache from an existing annotation the first time a
/// namespace is seen with no cache entry yet, then schedules (or
/// deschedules, on a zero-slice request) and patches the resulting
/// placement back if it changed.
pub async fn reconcile_namespace(
    engine: &SchedulerEngine,
    client: Client,
    cluster_key: &str,
    namespace: &Namespace,
) -> Result<(), Error> {
    let name = namespace.name_any();
    let key = namespace_key(cluster_key, &name);

    let Some((slices, quota_slice)) = slices_for(namespace) else {
        engine.deschedule_namespace(&key);
        return Ok(());
    };

    if let Some(existing) = existing_placement(namespace) {
        engine.ensure_namespace_placements(&key, &existing, &quota_slice);
    }

    let placement = engine.schedule_namespace(&key, &slices)?;
    if placement.is_empty() {
        return Ok(());
    }
    if existing_placement(namespace).as_ref() == Some(&placement) {
        return Ok(());
    }

    patch_namespace_placement(client, &name, &placement).await
}

async fn patch_namespace_placement(client: Client, namespace_name: &str, placement: &PlacementMap) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client);
    let patch = json!({
        "metadata": {
            "annotations": {
                annotations::SCHEDULED_PLACEMENTS: serde_json::to_string(placement)?,
            }
        }
    });
    println!("{} scheduled {namespace_name}: {placement:?}", "📐".color(FG2));
    api.patch(namespace_name, &PatchParams::apply(util::MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Sums a pod's container resource requests into the `ResourceList`
/// shape `SchedulePod` consumes. Only `requests.cpu`/`requests.memory`
/// are read; limits and init containers aren't part of placement sizing.
fn pod_request(pod: &Pod) -> ResourceList {
    let mut total = ResourceList::new();
    let Some(spec) = &pod.spec else { return total };
    for container in &spec.containers {
        let Some(resources) = &container.resources else { continue };
        let Some(requests) = &resources.requests else { continue };
        let raw: std::collections::BTreeMap<String, String> =
            requests.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect();
        let Ok(parsed) = util::quantity::parse_resource_list(&raw) else { continue };
        for (resource, amount) in parsed {
            *total.entry(resource).or_insert(0) += amount;
        }
    }
    total
}

/// One reconcile pass for `pod` on behalf of `cluster_key`'s namespace
/// `namespace_name`: schedules it if unplaced and its resource requests
/// are non-empty, writing `scheduled-cluster` back onto the pod.
pub async fn reconcile_pod(
    engine: &SchedulerEngine,
    client: Client,
    cluster_key: &str,
    namespace_name: &str,
    pod: &Pod,
) -> Result<(), Error> {
    let pod_name = pod.name_any();
    let request = pod_request(pod);
    if request.is_empty() {
        return Ok(());
    }
    if pod.annotations().contains_key(annotations::SCHEDULED_CLUSTER) {
        return Ok(());
    }

    let namespace_key = namespace_key(cluster_key, namespace_name);
    let pod_key = format!("{namespace_key}/{pod_name}");
    let cluster_key_chosen = engine.schedule_pod(&pod_key, &namespace_key, &request)?;

    let api: Api<Pod> = Api::namespaced(client, namespace_name);
    let patch = json!({
        "metadata": {
            "annotations": {
                annotations::SCHEDULED_CLUSTER: cluster_key_chosen,
            }
        }
    });
    println!("{} scheduled pod {namespace_name}/{pod_name} onto {cluster_key_chosen}", "📌".color(FG2));
    api.patch(&pod_name, &PatchParams::apply(util::MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace_with(annotations: BTreeMap<String, String>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn slices_for_divides_quota_by_slice_size() {
        let ns = namespace_with(BTreeMap::from([
            (REQUESTED_QUOTA.to_string(), r#"{"cpu":1000}"#.to_string()),
            (QUOTA_SLICE.to_string(), r#"{"cpu":250}"#.to_string()),
        ]));
        let (slices, quota_slice) = slices_for(&ns).expect("slices computed");
        assert_eq!(slices.len(), 4);
        assert_eq!(quota_slice.get("cpu"), Some(&250));
    }

    #[test]
    fn slices_for_is_none_without_both_annotations() {
        let ns = namespace_with(BTreeMap::new());
        assert!(slices_for(&ns).is_none());
    }

    #[test]
    fn slices_for_is_none_for_zero_slice_size() {
        let ns = namespace_with(BTreeMap::from([
            (REQUESTED_QUOTA.to_string(), r#"{"cpu":1000}"#.to_string()),
            (QUOTA_SLICE.to_string(), r#"{"cpu":0}"#.to_string()),
        ]));
        assert!(slices_for(&ns).is_none());
    }

    #[test]
    fn existing_placement_reads_back_the_annotation() {
        let ns = namespace_with(BTreeMap::from([(
            annotations::SCHEDULED_PLACEMENTS.to_string(),
            r#"{"a":2}"#.to_string(),
        )]));
        let placement = existing_placement(&ns).expect("placement parsed");
        assert_eq!(placement.get("a"), Some(&2));
    }
}
