//! Generic directional syncers (DWS/UWS/patrol) over a kube resource
//! kind `K`. spec.md §9 suggests a "record of function pointers" in
//! place of an inheritance hierarchy for syncer specialization per
//! kind; `SyncerKind<K>` is that record. One instance is built per
//! synced kind (ConfigMap, Node, ...) in `manager.rs` and handed to
//! the DWS/UWS/patrol loops, which are themselves kind-agnostic.

pub mod dws;
pub mod node;
pub mod patrol;
pub mod uws;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::util::Error;

/// Per-kind behavior a directional syncer needs but can't derive
/// generically: how to build the desired super-side object body from a
/// tenant object, and whether this kind gates on a readiness
/// annotation before being synced downward at all.
pub struct SyncerKind<K> {
    pub kind_name: &'static str,
    /// Builds the desired super-side spec/body fields (everything but
    /// `ObjectMeta`, which `translate::build_super_meta` already
    /// covers) from the tenant object.
    pub project_body: Arc<dyn Fn(&K) -> K + Send + Sync>,
    /// Returns `true` once the tenant object's dependencies (referenced
    /// secrets, service accounts, etc.) are ready. `DependencyNotReady`
    /// is the error DWS raises when this returns `false`.
    pub dependency_ready: Arc<dyn Fn(&K) -> bool + Send + Sync>,
}

impl<K> Clone for SyncerKind<K> {
    fn clone(&self) -> Self {
        Self {
            kind_name: self.kind_name,
            project_body: self.project_body.clone(),
            dependency_ready: self.dependency_ready.clone(),
        }
    }
}

impl<K> SyncerKind<K> {
    pub fn new(
        kind_name: &'static str,
        project_body: impl Fn(&K) -> K + Send + Sync + 'static,
        dependency_ready: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind_name,
            project_body: Arc::new(project_body),
            dependency_ready: Arc::new(dependency_ready),
        }
    }

    /// A kind with no dependency gating: always ready.
    pub fn always_ready(kind_name: &'static str, project_body: impl Fn(&K) -> K + Send + Sync + 'static) -> Self {
        Self::new(kind_name, project_body, |_| true)
    }
}

pub fn check_dependency_ready<K>(kind: &SyncerKind<K>, obj: &K) -> Result<(), Error> {
    if (kind.dependency_ready)(obj) {
        Ok(())
    } else {
        Err(Error::DependencyNotReady(kind.kind_name.to_string()))
    }
}

pub fn tenant_annotations_and_labels(meta: &ObjectMeta) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    (
        meta.annotations.clone().unwrap_or_default(),
        meta.labels.clone().unwrap_or_default(),
    )
}
