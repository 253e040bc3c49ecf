//! Upward node virtualization: a physical node on the super cluster is
//! visible to every tenant whose descriptor enables
//! `feature_gates.v_node_provider_service` (or the direct-passthrough
//! default), and a status change on the physical node fans out as one
//! UWS item per tenant — the reverse index spec.md §4.9 calls for, kept
//! here rather than inline in `manager.rs` since Node is the only kind
//! watched on the super cluster itself instead of per-tenant.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{DaemonEndpoint, Node, NodeAddress, NodeDaemonEndpoints, NodeStatus};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{reflector, watcher},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::fwq::{FairQueue, QueueItem};
use crate::mcc::{ClusterRegistry, TenantCluster};
use crate::translate;
use crate::util::{self, Error, colors::FG1};
use crate::vnode::{self, VNodeEndpoint};

/// One physical-node status change to mirror onto one tenant's virtual
/// view of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeFanoutItem {
    pub cluster_key: String,
    pub node_name: String,
}

impl QueueItem for NodeFanoutItem {
    fn tenant(&self) -> String {
        self.cluster_key.clone()
    }
}

/// Watches `Node` on the super cluster and fans each change out to
/// every currently registered tenant, following `MultiClusterController`'s
/// watch-then-enqueue shape but inverted: one upstream watch, many
/// downstream tenants instead of many upstream watches feeding one queue.
pub async fn run_fanout(super_client: Client, registry: ClusterRegistry, queue: FairQueue<NodeFanoutItem>, cancel: CancellationToken) {
    let api: Api<Node> = Api::all(super_client);
    let (_store, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
    tokio::pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => {
                let node_name = match event {
                    Some(Ok(watcher::Event::Apply(node))) | Some(Ok(watcher::Event::InitApply(node))) => node.name_any(),
                    Some(Ok(watcher::Event::Delete(node))) => node.name_any(),
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => continue,
                    Some(Err(e)) => {
                        eprintln!("{}", format!("node watch error: {e}").red());
                        continue;
                    }
                    None => return,
                };
                let cluster_keys: Vec<String> = registry.list().await.into_iter().map(|t| t.cluster_key).collect();
                fan_out(&cluster_keys, &node_name, &queue).await;
            }
        }
    }
}

/// One node change becomes one `NodeFanoutItem` per currently registered
/// tenant — the reverse-index fan-out, pulled out of `run_fanout` so it's
/// testable without a live watch stream.
async fn fan_out(cluster_keys: &[String], node_name: &str, queue: &FairQueue<NodeFanoutItem>) {
    for cluster_key in cluster_keys {
        queue
            .add(NodeFanoutItem {
                cluster_key: cluster_key.clone(),
                node_name: node_name.to_string(),
            })
            .await;
    }
}

/// Projects the super node's addresses/conditions onto a virtual `Node`
/// object named after it in the tenant cluster, routing the kubelet
/// endpoint through `vnode::resolve_endpoint` per the tenant's feature
/// gate. Tenant-absent `Node` objects aren't created here (provisioning
/// the virtual node object itself is the vnode agent's job); this only
/// updates status on an existing one.
pub async fn sync_node_up(super_client: Client, tenant: &TenantCluster, node_name: &str) -> Result<(), Error> {
    let super_api: Api<Node> = Api::all(super_client);
    let Some(super_node) = super_api.get_opt(node_name).await? else {
        return Ok(());
    };

    let tenant_api: Api<Node> = Api::all(tenant.client.clone());
    if tenant_api.get_opt(node_name).await?.is_none() {
        return Ok(());
    }

    let real_address = super_node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
        .unwrap_or_default();
    let port = super_node
        .status
        .as_ref()
        .and_then(|s| s.daemon_endpoints.as_ref())
        .and_then(|d| d.kubelet_endpoint.as_ref())
        .map(|e| e.port as u16)
        .unwrap_or(10250);

    // Node is cluster-scoped, so there's no tenant namespace to derive
    // the vnode-agent Service's super namespace from the way DWS does
    // for namespaced kinds; it lives in the tenant's system namespace.
    let super_namespace = translate::to_super_namespace(&tenant.cluster_key, "kube-system");
    let endpoint = vnode::resolve_endpoint(
        tenant.spec.feature_gates.v_node_provider_service,
        node_name,
        &super_namespace,
        &real_address,
        port,
    );

    let conditions = super_node.status.as_ref().and_then(|s| s.conditions.clone()).unwrap_or_default();
    let status = desired_status(&endpoint, conditions);

    println!("{} {}{}{}", "↑".color(FG1), tenant.cluster_key.color(FG1), "/".color(FG1), node_name.color(FG1));

    tenant_api
        .patch_status(
            node_name,
            &PatchParams::apply(util::MANAGER_NAME),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    Ok(())
}

fn desired_status(endpoint: &VNodeEndpoint, conditions: Vec<k8s_openapi::api::core::v1::NodeCondition>) -> NodeStatus {
    let (address_type, address) = match endpoint {
        VNodeEndpoint::Direct { address, .. } => ("InternalIP".to_string(), address.clone()),
        VNodeEndpoint::ServiceRouted { .. } => ("InternalIP".to_string(), endpoint.host()),
    };
    NodeStatus {
        addresses: Some(vec![NodeAddress { type_: address_type, address }]),
        daemon_endpoints: Some(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint { port: endpoint.port() as i32 }),
        }),
        conditions: Some(conditions),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeCondition;

    #[test]
    fn desired_status_carries_conditions_through_unchanged() {
        let endpoint = VNodeEndpoint::direct("10.0.0.5", 10250);
        let conditions = vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }];
        let status = desired_status(&endpoint, conditions.clone());
        assert_eq!(status.conditions, Some(conditions));
        assert_eq!(status.addresses.unwrap()[0].address, "10.0.0.5");
    }

    #[test]
    fn desired_status_routes_through_service_host_when_service_routed() {
        let endpoint = VNodeEndpoint::service_routed("vnode-n-7", "vcluster-io", 10250);
        let status = desired_status(&endpoint, Vec::new());
        assert_eq!(status.addresses.unwrap()[0].address, "vnode-n-7.vcluster-io.svc");
    }

    #[tokio::test]
    async fn node_condition_change_fans_out_one_item_per_tenant() {
        let queue = FairQueue::new(std::time::Duration::from_secs(60), std::time::Duration::from_secs(60));
        let cluster_keys = vec!["t1".to_string(), "t2".to_string()];
        fan_out(&cluster_keys, "n-7", &queue).await;

        let first = queue.get().await.unwrap();
        queue.done(&first).await;
        let second = queue.get().await.unwrap();
        queue.done(&second).await;

        let mut seen = vec![first.cluster_key, second.cluster_key];
        seen.sort();
        assert_eq!(seen, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(queue.len().await, 0);
    }
}
