//! First-fit slice placement over a cached cluster usage map, plus the
//! namespace/pod placement caches spec.md §4.8's State section names
//! (`namespaces[key]`, `pods[key]`) so retains/drops and pod placement
//! don't need a live read of the current annotation before every call.
//!
//! Open Question resolution (see SPEC_FULL.md / DESIGN.md): a slice's
//! `hint` is consulted, not inverted — when the hinted cluster exists
//! in the usage map and has capacity for the slice, it is used in
//! preference to scanning the rest of the map. A slice with zero
//! placements required short-circuits before any annotation write, so
//! an all-zero request never touches the namespace object.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use vc_types::{PlacementMap, ResourceList, ResourceSlice};

use crate::mcc::{ClusterSink, TenantCluster};
use crate::scheduler::types::{ClusterUsage, NamespaceUsage, SlicePlacement};
use crate::util::Error;

struct State {
    clusters: BTreeMap<String, ClusterUsage>,
    namespaces: BTreeMap<String, NamespaceUsage>,
    pods: BTreeMap<String, (String, ResourceList)>,
}

/// Tracks per-cluster capacity/allocation across tenant namespaces, plus
/// a `namespaces[key]`/`pods[key]` cache of what's currently placed
/// where. One engine instance is shared by every namespace's scheduling
/// decision so placement stays globally consistent.
pub struct SchedulerEngine {
    state: Mutex<State>,
}

impl SchedulerEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                clusters: BTreeMap::new(),
                namespaces: BTreeMap::new(),
                pods: BTreeMap::new(),
            }),
        }
    }

    pub fn set_capacity(&self, cluster_key: &str, usage: ClusterUsage) {
        self.state.lock().unwrap().clusters.insert(cluster_key.to_string(), usage);
    }

    pub fn remove_cluster(&self, cluster_key: &str) {
        self.state.lock().unwrap().clusters.remove(cluster_key);
    }

    /// `ScheduleNamespace` (spec.md §4.8): places `slices` for
    /// `namespace_key`, starting from the namespace's existing cache
    /// entry. Slot `i`'s prior placement is retained if its cluster
    /// still fits slot `i`'s (possibly resized) request; anything not
    /// retained is scheduled fresh via `scheduleOneSlice`. Computed
    /// against a cloned usage map so a failure never mutates the live
    /// cache (all-or-nothing per namespace).
    pub fn schedule_namespace(&self, namespace_key: &str, slices: &[ResourceSlice]) -> Result<PlacementMap, Error> {
        let mut state = self.state.lock().unwrap();

        if slices.is_empty() {
            if let Some(old) = state.namespaces.remove(namespace_key) {
                Self::release_all(&mut state.clusters, &old);
            }
            return Ok(PlacementMap::new());
        }

        let existing = state.namespaces.get(namespace_key).cloned().unwrap_or_default();
        let mut candidate = state.clusters.clone();
        Self::release_all(&mut candidate, &existing);

        let mut placed: Vec<SlicePlacement> = Vec::with_capacity(slices.len());
        for (i, slice) in slices.iter().enumerate() {
            let retained = existing.slices.get(i).and_then(|old| {
                let usage = candidate.get_mut(&old.cluster_key)?;
                if usage.fits(&slice.request) {
                    usage.allocate(&slice.request);
                    Some(old.cluster_key.clone())
                } else {
                    None
                }
            });

            let cluster_key = match retained {
                Some(c) => c,
                None => Self::schedule_one_slice(&mut candidate, slice).ok_or_else(|| {
                    Error::SchedulerInfeasible(format!(
                        "namespace {namespace_key} has a slice with no cluster fitting request {:?}",
                        slice.request
                    ))
                })?,
            };
            placed.push(SlicePlacement { cluster_key, request: slice.request.clone() });
        }

        state.clusters = candidate;
        let usage = NamespaceUsage { slices: placed };
        let map = usage.placement_map();
        state.namespaces.insert(namespace_key.to_string(), usage);
        Ok(map)
    }

    fn schedule_one_slice(
        clusters: &mut BTreeMap<String, ClusterUsage>,
        slice: &ResourceSlice,
    ) -> Option<String> {
        if let Some(mandatory) = &slice.mandatory {
            let usage = clusters.get_mut(mandatory)?;
            if !usage.fits(&slice.request) {
                return None;
            }
            usage.allocate(&slice.request);
            return Some(mandatory.clone());
        }

        if let Some(hint) = &slice.hint
            && let Some(usage) = clusters.get_mut(hint)
            && usage.fits(&slice.request)
        {
            usage.allocate(&slice.request);
            return Some(hint.clone());
        }

        for (cluster_key, usage) in clusters.iter_mut() {
            if usage.fits(&slice.request) {
                usage.allocate(&slice.request);
                return Some(cluster_key.clone());
            }
        }
        None
    }

    /// `EnsureNamespacePlacements` (spec.md §4.8): accepts `placement`
    /// as authoritative — e.g. read back from an existing
    /// `scheduled-placements` annotation when the controller starts up
    /// and finds a namespace it hasn't scheduled itself yet — and
    /// recomputes `allocated` to match, without running any fit check.
    /// Replaces whatever this namespace previously held in the cache.
    pub fn ensure_namespace_placements(
        &self,
        namespace_key: &str,
        placement: &PlacementMap,
        request_per_slice: &ResourceList,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.namespaces.remove(namespace_key) {
            Self::release_all(&mut state.clusters, &old);
        }

        let mut slices = Vec::new();
        for (cluster_key, count) in placement {
            let usage = state.clusters.entry(cluster_key.clone()).or_default();
            for _ in 0..*count {
                usage.allocate(request_per_slice);
                slices.push(SlicePlacement {
                    cluster_key: cluster_key.clone(),
                    request: request_per_slice.clone(),
                });
            }
        }
        state.namespaces.insert(namespace_key.to_string(), NamespaceUsage { slices });
    }

    /// `DeScheduleNamespace` (spec.md §4.8): drops `namespace_key`'s
    /// cache entry and releases every slice it held.
    pub fn deschedule_namespace(&self, namespace_key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.namespaces.remove(namespace_key) {
            Self::release_all(&mut state.clusters, &old);
        }
    }

    /// `SchedulePod` (spec.md §4.8): first-fit over clusters that
    /// already host at least one slice of `namespace_key`, falling back
    /// to any cluster that fits if none of the namespace's clusters do.
    pub fn schedule_pod(&self, pod_key: &str, namespace_key: &str, request: &ResourceList) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();

        let namespace_clusters: std::collections::BTreeSet<String> = state
            .namespaces
            .get(namespace_key)
            .map(|ns| ns.slices.iter().map(|s| s.cluster_key.clone()).collect())
            .unwrap_or_default();

        let chosen = namespace_clusters
            .iter()
            .find(|c| state.clusters.get(c.as_str()).is_some_and(|u| u.fits(request)))
            .cloned()
            .or_else(|| {
                state
                    .clusters
                    .iter()
                    .find(|(_, usage)| usage.fits(request))
                    .map(|(cluster_key, _)| cluster_key.clone())
            });

        let Some(cluster_key) = chosen else {
            return Err(Error::SchedulerInfeasible(format!(
                "pod {pod_key} has no cluster fitting request {request:?}"
            )));
        };

        state.clusters.get_mut(&cluster_key).unwrap().allocate(request);
        state.pods.insert(pod_key.to_string(), (cluster_key.clone(), request.clone()));
        Ok(cluster_key)
    }

    /// Releases a pod's placement, dropping its `pods[key]` entry. The
    /// request amount is recovered from the cache entry itself, so
    /// callers that only know the key (e.g. "this pod was deleted") can
    /// still release its allocation exactly.
    pub fn deschedule_pod(&self, pod_key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some((cluster_key, request)) = state.pods.remove(pod_key)
            && let Some(usage) = state.clusters.get_mut(&cluster_key)
        {
            usage.release(&request);
        }
    }

    fn release_all(clusters: &mut BTreeMap<String, ClusterUsage>, usage: &NamespaceUsage) {
        for slice in &usage.slices {
            if let Some(cluster) = clusters.get_mut(&slice.cluster_key) {
                cluster.release(&slice.request);
            }
        }
    }
}

impl Default for SchedulerEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers a newly-added tenant with an unconstrained `ClusterUsage`
/// (no resource is capped until something reports real capacity for
/// it — `ClusterUsage::fits` treats an absent resource as unlimited)
/// and drops its usage entry on removal. Lets `descriptor::reconcile`
/// keep the engine's cluster set in sync with the registry the same
/// way it keeps every kind's MCC in sync.
impl ClusterSink for Arc<SchedulerEngine> {
    fn add_cluster<'a>(&'a self, cluster: &'a TenantCluster) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.set_capacity(&cluster.cluster_key, ClusterUsage::default());
        })
    }

    fn remove_cluster<'a>(&'a self, cluster_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            SchedulerEngine::remove_cluster(self, cluster_key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vc_types::ResourceList;

    fn usage(cpu: i64) -> ClusterUsage {
        ClusterUsage {
            capacity: ResourceList::from([("cpu".to_string(), cpu)]),
            allocated: ResourceList::new(),
        }
    }

    fn slice(cpu: i64) -> ResourceSlice {
        ResourceSlice {
            request: ResourceList::from([("cpu".to_string(), cpu)]),
            mandatory: None,
            hint: None,
        }
    }

    #[test]
    fn zero_slices_produce_empty_placement_without_touching_clusters() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        let map = engine.schedule_namespace("ns1", &[]).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn first_fit_picks_first_cluster_with_capacity() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(100));
        engine.set_capacity("b", usage(1000));
        let map = engine.schedule_namespace("ns1", &[slice(500)]).unwrap();
        assert_eq!(map.get("b"), Some(&1));
        assert_eq!(map.get("a"), None);
    }

    #[test]
    fn hint_used_when_present_and_has_capacity() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.set_capacity("b", usage(1000));
        let mut s = slice(500);
        s.hint = Some("b".to_string());
        let map = engine.schedule_namespace("ns1", &[s]).unwrap();
        assert_eq!(map.get("b"), Some(&1));
    }

    #[test]
    fn hint_ignored_when_it_lacks_capacity() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.set_capacity("b", usage(100));
        let mut s = slice(500);
        s.hint = Some("b".to_string());
        let map = engine.schedule_namespace("ns1", &[s]).unwrap();
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn mandatory_cluster_without_capacity_fails_whole_batch() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(100));
        engine.set_capacity("b", usage(1000));
        let mut s = slice(500);
        s.mandatory = Some("a".to_string());
        assert!(engine.schedule_namespace("ns1", &[s]).is_err());
    }

    #[test]
    fn partial_batch_failure_rolls_back_earlier_placements() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(600));
        let map = engine.schedule_namespace("ns1", &[slice(500), slice(500)]);
        assert!(map.is_err());
        // capacity should be untouched after rollback
        let map = engine.schedule_namespace("ns1", &[slice(500)]).unwrap();
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn rescheduling_unchanged_namespace_is_stable() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.set_capacity("b", usage(1000));
        let first = engine.schedule_namespace("ns1", &[slice(500), slice(500)]).unwrap();
        let second = engine.schedule_namespace("ns1", &[slice(500), slice(500)]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shrinking_namespace_releases_dropped_slices() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.schedule_namespace("ns1", &[slice(500), slice(500)]).unwrap();
        let map = engine.schedule_namespace("ns1", &[slice(500)]).unwrap();
        assert_eq!(map.values().sum::<u32>(), 1);
        // the released capacity must be usable again
        let other = engine.schedule_namespace("ns2", &[slice(500)]).unwrap();
        assert_eq!(other.get("a"), Some(&1));
    }

    #[test]
    fn retained_slice_reschedules_when_its_cluster_no_longer_fits_resized_request() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(600));
        engine.set_capacity("b", usage(1000));
        engine.schedule_namespace("ns1", &[slice(500)]).unwrap();
        // resizing the slice past cluster a's capacity must fall through
        // to b instead of failing outright.
        let map = engine.schedule_namespace("ns1", &[slice(700)]).unwrap();
        assert_eq!(map.get("b"), Some(&1));
        assert_eq!(map.get("a"), None);
    }

    #[test]
    fn deschedule_namespace_releases_all_its_slices() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.schedule_namespace("ns1", &[slice(500), slice(500)]).unwrap();
        engine.deschedule_namespace("ns1");
        let map = engine.schedule_namespace("ns2", &[slice(500), slice(500)]).unwrap();
        assert_eq!(map.get("a"), Some(&2));
    }

    #[test]
    fn ensure_namespace_placements_trusts_the_given_map() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        let placement = PlacementMap::from([("a".to_string(), 2)]);
        let request = ResourceList::from([("cpu".to_string(), 300)]);
        engine.ensure_namespace_placements("ns1", &placement, &request);
        // 600 now allocated on a; a third 500-unit slice no longer fits.
        assert!(engine.schedule_namespace("ns1", &[slice(500), slice(500), slice(500)]).is_err());
    }

    #[test]
    fn schedule_pod_prefers_a_cluster_already_hosting_the_namespace() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(1000));
        engine.set_capacity("b", usage(1000));
        engine.schedule_namespace("ns1", &[slice(100)]).unwrap();
        let request = ResourceList::from([("cpu".to_string(), 50)]);
        let cluster = engine.schedule_pod("ns1/pod-1", "ns1", &request).unwrap();
        assert_eq!(cluster, "a");
    }

    #[test]
    fn schedule_pod_falls_back_to_any_fitting_cluster() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(10));
        engine.set_capacity("b", usage(1000));
        engine.schedule_namespace("ns1", &[slice(10)]).unwrap();
        let request = ResourceList::from([("cpu".to_string(), 50)]);
        let cluster = engine.schedule_pod("ns1/pod-1", "ns1", &request).unwrap();
        assert_eq!(cluster, "b");
    }

    #[test]
    fn deschedule_pod_releases_its_allocation() {
        let engine = SchedulerEngine::new();
        engine.set_capacity("a", usage(100));
        let request = ResourceList::from([("cpu".to_string(), 100)]);
        engine.schedule_pod("ns1/pod-1", "ns1", &request).unwrap();
        engine.deschedule_pod("ns1/pod-1");
        // capacity should be fully reusable now
        let cluster = engine.schedule_pod("ns1/pod-2", "ns1", &request).unwrap();
        assert_eq!(cluster, "a");
    }
}
