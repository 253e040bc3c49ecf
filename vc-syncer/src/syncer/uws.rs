//! Upward sync: status observed on the super-side object is mirrored
//! back onto the tenant object the annotations identify it with. Spec
//! field (only status, never spec) so UWS can never clobber a tenant
//! edit that DWS hasn't caught up to yet.

use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
    core::NamespaceResourceScope,
    runtime::controller::Action,
};
use owo_colors::OwoColorize;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::translate;
use crate::util::{self, Error, colors::FG1};

/// Mirrors the super-side object's status onto its tenant counterpart.
/// `project_status` extracts the subset of `super_obj`'s status worth
/// copying and merges it into a clone of `tenant_obj`; the merged
/// object is then applied back onto the tenant cluster.
pub async fn sync_up<K>(
    tenant_client: kube::Client,
    super_obj: &K,
    tenant_obj: &K,
    project_status: impl Fn(&K, &K) -> K,
) -> Result<Action, Error>
where
    K: Resource<Scope = NamespaceResourceScope> + ResourceExt + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let owner = translate::super_owner(super_obj.meta()).ok_or_else(|| {
        Error::ValidationError("super object has no recoverable tenant owner".to_string())
    })?;

    let merged = project_status(tenant_obj, super_obj);
    let api: Api<K> = Api::namespaced(tenant_client, &owner.namespace);

    println!(
        "{} {}{}{}",
        "↑".color(FG1),
        owner.namespace.color(FG1),
        "/".color(FG1),
        owner.name.color(FG1),
    );

    api.patch_status(
        &owner.name,
        &PatchParams::apply(util::MANAGER_NAME),
        &Patch::Apply(&merged),
    )
    .await?;

    Ok(Action::requeue(util::PROBE_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use vc_types::annotations;

    #[test]
    fn super_owner_recovery_is_required_before_sync() {
        let meta = ObjectMeta::default();
        assert!(translate::super_owner(&meta).is_none());
        let mut annotated = ObjectMeta::default();
        annotated.annotations = Some(std::collections::BTreeMap::from([
            (annotations::CLUSTER.to_string(), "c".to_string()),
            (annotations::NAMESPACE.to_string(), "ns".to_string()),
            (annotations::NAME.to_string(), "n".to_string()),
        ]));
        assert!(translate::super_owner(&annotated).is_some());
    }
}
