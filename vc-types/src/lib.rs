use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Annotation keys that carry tenant identity and scheduling state across
/// the tenant/super boundary. These are the wire format, not just
/// metadata: reverse lookup of a super-space object depends on them.
pub mod annotations {
    pub const PREFIX: &str = "vcluster.io";

    /// Tenant cluster key on a super-space object.
    pub const CLUSTER: &str = "vcluster.io/cluster";
    /// Originating tenant namespace.
    pub const NAMESPACE: &str = "vcluster.io/namespace";
    /// Originating tenant object name.
    pub const NAME: &str = "vcluster.io/name";
    /// Originating tenant object uid.
    pub const UID: &str = "vcluster.io/uid";
    /// JSON object `{clusterID: sliceCount}` on a tenant namespace.
    pub const SCHEDULED_PLACEMENTS: &str = "vcluster.io/scheduled-placements";
    /// Cluster a tenant pod has been scheduled onto.
    pub const SCHEDULED_CLUSTER: &str = "vcluster.io/scheduled-cluster";
    /// `"true"` on super-side virtual node representations.
    pub const VIRTUAL_NODE: &str = "vcluster.io/virtual-node";
    /// `"Ready"` on dependencies that gate downward creation.
    pub const SYNC_STATUS: &str = "vcluster.io/sync-status";
    /// Spec hash used for change detection, following the teacher's
    /// `SPEC_HASH` annotation convention.
    pub const SPEC_HASH: &str = "vcluster.io/spec-hash";
    pub const CREATED_BY: &str = "vcluster.io/created-by";
}

/// Node labels passed through untouched by the translation layer because
/// tenant-side scheduling and display logic depends on them.
pub const PASSTHROUGH_NODE_LABELS: &[&str] = &[
    "kubernetes.io/os",
    "kubernetes.io/arch",
    "kubernetes.io/hostname",
];

fn default_sync_status_key() -> String {
    annotations::SYNC_STATUS.to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FeatureGates {
    #[serde(default)]
    pub super_cluster_pooling: bool,
    #[serde(default)]
    pub v_node_provider_service: bool,
}

fn default_queue_expire() -> String {
    "15m".to_string()
}

fn default_idle_check_period() -> String {
    "2m".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct QueueTuning {
    #[serde(default = "default_queue_expire")]
    pub queue_expire_duration: String,
    #[serde(default = "default_idle_check_period")]
    pub idle_queue_check_period: String,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            queue_expire_duration: default_queue_expire(),
            idle_queue_check_period: default_idle_check_period(),
        }
    }
}

/// The `VirtualCluster` custom resource: a tenant-cluster descriptor.
/// Reconciling this CR is what produces a live `TC` in the registry.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "vcluster.io",
    version = "v1",
    kind = "VirtualCluster",
    plural = "virtualclusters",
    shortname = "vc",
    derive = "PartialEq",
    status = "VirtualClusterStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct VirtualClusterSpec {
    /// Secret in the super cluster's `kube-system`-adjacent namespace
    /// holding the tenant kubeconfig under key `admin-kubeconfig`.
    pub kubeconfig_secret_ref: SecretRef,
    #[serde(default)]
    pub feature_gates: FeatureGates,
    #[serde(default)]
    pub queue: QueueTuning,
    #[serde(default)]
    pub disable_service_account_token: bool,
    #[serde(default)]
    pub opaque_meta_domains: Vec<String>,
    #[serde(default = "default_sync_status_key")]
    pub sync_status_annotation: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct VirtualClusterStatus {
    pub phase: DescriptorPhase,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Stable identity used to key the `TC` map: `{namespace}/{name}/{uid}`.
    pub cluster_key: Option<String>,
}

/// Phases a `VirtualCluster` descriptor moves through. `Running`/`Ready`
/// gate registry add; `Error`/`Failed` gate registry remove.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum DescriptorPhase {
    #[default]
    Pending,
    Running,
    Ready,
    Updating,
    Error,
    Failed,
}

impl FromStr for DescriptorPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(DescriptorPhase::Pending),
            "Running" => Ok(DescriptorPhase::Running),
            "Ready" => Ok(DescriptorPhase::Ready),
            "Updating" => Ok(DescriptorPhase::Updating),
            "Error" => Ok(DescriptorPhase::Error),
            "Failed" => Ok(DescriptorPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DescriptorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorPhase::Pending => write!(f, "Pending"),
            DescriptorPhase::Running => write!(f, "Running"),
            DescriptorPhase::Ready => write!(f, "Ready"),
            DescriptorPhase::Updating => write!(f, "Updating"),
            DescriptorPhase::Error => write!(f, "Error"),
            DescriptorPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl DescriptorPhase {
    /// Per spec.md §4.3: `Running`/`Ready` add the cluster, `Error`/
    /// `Failed` remove it, anything else is a no-op for the registry.
    pub fn registry_action(self) -> RegistryAction {
        match self {
            DescriptorPhase::Running | DescriptorPhase::Ready => RegistryAction::Add,
            DescriptorPhase::Error | DescriptorPhase::Failed => RegistryAction::Remove,
            DescriptorPhase::Pending | DescriptorPhase::Updating => RegistryAction::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Add,
    Remove,
    Skip,
}

/// A cluster-scoped resource list, normalized to integer base units
/// (millicores for cpu, bytes for memory, raw units otherwise). Using
/// integers rather than `k8s_openapi`'s `Quantity` keeps the scheduler's
/// arithmetic (`capacity[r] - allocated[r] >= request[r]`) simple and
/// exact.
pub type ResourceList = BTreeMap<String, i64>;

/// A fixed-size quota unit requested by a tenant namespace; a namespace
/// owns N of these and each is placed on exactly one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSlice {
    pub request: ResourceList,
    /// If set, only this cluster may be considered for placement.
    pub mandatory: Option<String>,
    /// Consulted only when present *and* it fits; otherwise first-fit.
    pub hint: Option<String>,
}

/// `clusterID -> sliceCount` for a tenant namespace. Stored as a
/// serialized annotation on the tenant namespace; the scheduler cache
/// holds the authoritative copy.
pub type PlacementMap = BTreeMap<String, u32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_action_matches_phase_table() {
        assert_eq!(
            DescriptorPhase::Running.registry_action(),
            RegistryAction::Add
        );
        assert_eq!(
            DescriptorPhase::Ready.registry_action(),
            RegistryAction::Add
        );
        assert_eq!(
            DescriptorPhase::Error.registry_action(),
            RegistryAction::Remove
        );
        assert_eq!(
            DescriptorPhase::Failed.registry_action(),
            RegistryAction::Remove
        );
        assert_eq!(
            DescriptorPhase::Pending.registry_action(),
            RegistryAction::Skip
        );
        assert_eq!(
            DescriptorPhase::Updating.registry_action(),
            RegistryAction::Skip
        );
    }

    #[test]
    fn phase_roundtrips_through_display_and_fromstr() {
        for phase in [
            DescriptorPhase::Pending,
            DescriptorPhase::Running,
            DescriptorPhase::Ready,
            DescriptorPhase::Updating,
            DescriptorPhase::Error,
            DescriptorPhase::Failed,
        ] {
            let s = phase.to_string();
            assert_eq!(DescriptorPhase::from_str(&s), Ok(phase));
        }
    }
}
