use vc_types::{PlacementMap, ResourceList};

/// Capacity and current allocation for one cluster, kept as a cache
/// entry the scheduler mutates in place as slices are placed and
/// removed, rather than recomputing usage from the live cluster on
/// every call.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterUsage {
    pub capacity: ResourceList,
    pub allocated: ResourceList,
}

impl ClusterUsage {
    /// `true` if `allocated + request <= capacity` for every resource
    /// named in `request`. Resources the cluster doesn't advertise at
    /// all are treated as unconstrained (no such resource, no limit).
    pub fn fits(&self, request: &ResourceList) -> bool {
        request.iter().all(|(resource, want)| {
            let Some(cap) = self.capacity.get(resource) else {
                return true;
            };
            let used = self.allocated.get(resource).copied().unwrap_or(0);
            cap - used >= *want
        })
    }

    pub fn allocate(&mut self, request: &ResourceList) {
        for (resource, amount) in request {
            *self.allocated.entry(resource.clone()).or_insert(0) += amount;
        }
    }

    pub fn release(&mut self, request: &ResourceList) {
        for (resource, amount) in request {
            if let Some(used) = self.allocated.get_mut(resource) {
                *used = (*used - amount).max(0);
            }
        }
    }
}

/// A single slice's placement, as held in a namespace's cache entry:
/// which cluster it landed on and the exact request it was placed with.
/// Keeping the request alongside the cluster (rather than just a
/// per-cluster count) is what lets `SchedulerEngine` release precisely
/// what it allocated when a slice is dropped or resized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlicePlacement {
    pub cluster_key: String,
    pub request: ResourceList,
}

/// Cached bookkeeping for a tenant namespace's current placements,
/// mirrored from the `SCHEDULED_PLACEMENTS` annotation so the engine
/// doesn't need a live read before every scheduling decision. One entry
/// per slice, in the same order the namespace's slice list was given in.
#[derive(Clone, Debug, Default)]
pub struct NamespaceUsage {
    pub slices: Vec<SlicePlacement>,
}

impl NamespaceUsage {
    pub fn placement_map(&self) -> PlacementMap {
        let mut map = PlacementMap::new();
        for slice in &self.slices {
            *map.entry(slice.cluster_key.clone()).or_insert(0) += 1;
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_map_counts_slices_per_cluster() {
        let usage = NamespaceUsage {
            slices: vec![
                SlicePlacement { cluster_key: "a".to_string(), request: ResourceList::new() },
                SlicePlacement { cluster_key: "a".to_string(), request: ResourceList::new() },
                SlicePlacement { cluster_key: "b".to_string(), request: ResourceList::new() },
            ],
        };
        let map = usage.placement_map();
        assert_eq!(map.get("a"), Some(&2));
        assert_eq!(map.get("b"), Some(&1));
    }
}
