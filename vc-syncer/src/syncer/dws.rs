//! Downward sync: tenant object -> super object. Server-side apply
//! keeps this idempotent across retries and concurrent reconciles of
//! the same object, the same property `util::patch::patch_status`
//! relies on for CR status.

use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
    core::NamespaceResourceScope,
    runtime::controller::Action,
};
use owo_colors::OwoColorize;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::time::Duration;

use super::{SyncerKind, check_dependency_ready, tenant_annotations_and_labels};
use crate::translate;
use crate::util::{self, Error, colors::FG2};

/// One downward sync pass for a single tenant object. Builds the
/// desired super-side object via `kind.project_body` +
/// `translate::build_super_meta`, then applies it. `DependencyNotReady`
/// errors are the caller's signal to requeue rather than escalate.
pub async fn sync_down<K>(
    _tenant_client: kube::Client,
    super_client: kube::Client,
    cluster_key: &str,
    tenant: &K,
    opaque_meta_domains: &[String],
    kind: &SyncerKind<K>,
) -> Result<Action, Error>
where
    K: Resource<Scope = NamespaceResourceScope> + ResourceExt + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    check_dependency_ready(kind, tenant)?;

    let tenant_namespace = tenant.namespace().ok_or_else(|| {
        Error::ValidationError(format!("{} is missing a tenant namespace", kind.kind_name))
    })?;
    let tenant_name = tenant.name_any();
    let (annotations, labels) = tenant_annotations_and_labels(tenant.meta());

    let mut desired = (kind.project_body)(tenant);
    *desired.meta_mut() = translate::build_super_meta(
        cluster_key,
        &tenant_namespace,
        &tenant_name,
        tenant.meta().uid.as_deref(),
        &labels,
        &annotations,
        opaque_meta_domains,
    );

    let super_namespace = desired
        .meta()
        .namespace
        .clone()
        .expect("build_super_meta always sets namespace");
    let api: Api<K> = Api::namespaced(super_client, &super_namespace);

    println!(
        "{} {}{}{}",
        "↓".color(FG2),
        tenant_namespace.color(FG2),
        "/".color(FG2),
        tenant_name.color(FG2),
    );

    api.patch(
        &tenant_name,
        &PatchParams::apply(util::MANAGER_NAME).force(),
        &Patch::Apply(&desired),
    )
    .await?;

    Ok(Action::requeue(util::PROBE_INTERVAL))
}

/// Removes the super-side counterpart of a deleted tenant object.
/// Absent-on-delete is treated as success: the goal state (no object)
/// is already reached.
pub async fn sync_delete<K>(
    super_client: kube::Client,
    cluster_key: &str,
    tenant_namespace: &str,
    tenant_name: &str,
) -> Result<Action, Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let super_namespace = translate::to_super_namespace(cluster_key, tenant_namespace);
    let api: Api<K> = Api::namespaced(super_client, &super_namespace);
    match api.delete(tenant_name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::from(e)),
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::super::SyncerKind;

    #[test]
    fn always_ready_kind_never_gates() {
        let kind: SyncerKind<()> = SyncerKind::always_ready("Unit", |_| ());
        assert!((kind.dependency_ready)(&()));
    }
}
