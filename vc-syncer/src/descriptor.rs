//! Reconciles `VirtualCluster` descriptors into registry membership.
//! Mirrors `clusters::reconcile`'s read-then-act shape: `determine_action`
//! decides what the descriptor's phase implies, `actions::*`-equivalent
//! functions here perform it.

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use vc_types::{RegistryAction, VirtualCluster};

use crate::mcc::{ClusterRegistry, ClusterSink, TenantCluster};
use crate::util::{Error, PROBE_INTERVAL, colors::FG2, patch::patch_status};

struct Context {
    client: Client,
    registry: ClusterRegistry,
    sinks: Vec<Arc<dyn ClusterSink>>,
}

/// Runs the `VirtualCluster` descriptor controller. `sinks` is every
/// per-kind `MultiClusterController` watching tenant clusters
/// (`ConfigMap`, `Namespace`, `Pod`, ...); registry membership changes
/// are multicast to all of them so each kind's watcher set always
/// matches the registry rather than drifting from it.
pub async fn run(client: Client, registry: ClusterRegistry, sinks: Vec<Arc<dyn ClusterSink>>) -> Result<(), Error> {
    println!("{}", "⚙️ Starting VirtualCluster descriptor controller...".green());
    let api: Api<VirtualCluster> = Api::all(client.clone());
    let context = Arc::new(Context { client, registry, sinks });

    Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|res| async move {
            if let Err(e) = res {
                eprintln!("{}", format!("descriptor reconcile error: {e:?}").red());
            }
        })
        .await;
    Ok(())
}

async fn reconcile(instance: Arc<VirtualCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(status) = instance.status.as_ref() else {
        return mark_pending(&ctx, &instance, "awaiting first status write").await;
    };

    let cluster_key = status
        .cluster_key
        .clone()
        .unwrap_or_else(|| cluster_key_for(&instance));

    match status.phase.registry_action() {
        RegistryAction::Add => {
            if !ctx.registry.contains(&cluster_key).await {
                validate_queue_tuning(&instance.spec.queue)?;
                let tenant_client = build_tenant_client(&ctx.client, &instance).await?;
                let tenant = TenantCluster {
                    cluster_key: cluster_key.clone(),
                    client: tenant_client,
                    spec: instance.spec.clone(),
                };
                ctx.registry
                    .add(tenant.cluster_key.clone(), tenant.client.clone(), tenant.spec.clone())
                    .await;
                for sink in &ctx.sinks {
                    sink.add_cluster(&tenant).await;
                }
                println!(
                    "{} registered tenant cluster {}",
                    "➕".color(FG2),
                    cluster_key
                );
            }
        }
        RegistryAction::Remove => {
            if ctx.registry.remove(&cluster_key).await.is_some() {
                for sink in &ctx.sinks {
                    sink.remove_cluster(&cluster_key).await;
                }
                println!("{} removed tenant cluster {}", "➖".color(FG2), cluster_key);
            }
        }
        RegistryAction::Skip => {}
    }

    Ok(Action::requeue(PROBE_INTERVAL))
}

async fn mark_pending(ctx: &Context, instance: &VirtualCluster, reason: &str) -> Result<Action, Error> {
    let cluster_key = cluster_key_for(instance);
    patch_status(ctx.client.clone(), instance, |status| {
        status.phase = vc_types::DescriptorPhase::Pending;
        status.message = Some(reason.to_string());
        status.cluster_key = Some(cluster_key.clone());
    })
    .await?;
    Ok(Action::requeue(Duration::from_secs(5)))
}

/// Validates a descriptor's per-cluster queue tuning strings without
/// applying them to the shared `FairQueue`: spec.md's queue is one fair
/// queue shared across every tenant, so a per-tenant override would
/// break its cross-tenant fairness invariant. Registration still rejects
/// an unparsable value outright rather than silently ignoring it.
fn validate_queue_tuning(queue: &vc_types::QueueTuning) -> Result<(), Error> {
    parse_duration::parse(&queue.queue_expire_duration)
        .map_err(|e| Error::ValidationError(format!("spec.queue.queueExpireDuration: {e}")))?;
    parse_duration::parse(&queue.idle_queue_check_period)
        .map_err(|e| Error::ValidationError(format!("spec.queue.idleQueueCheckPeriod: {e}")))?;
    Ok(())
}

fn cluster_key_for(instance: &VirtualCluster) -> String {
    format!(
        "{}/{}/{}",
        instance.namespace().unwrap_or_default(),
        instance.name_any(),
        instance.uid().unwrap_or_default(),
    )
}

/// Builds a `kube::Client` for the tenant cluster named by the
/// descriptor's `kubeconfigSecretRef`, the one piece of registry
/// bring-up with a genuine side effect (reading a Secret).
async fn build_tenant_client(client: &Client, instance: &VirtualCluster) -> Result<Client, Error> {
    let secret_ref = &instance.spec.kubeconfig_secret_ref;
    let namespace = secret_ref
        .namespace
        .clone()
        .or_else(|| instance.namespace())
        .ok_or_else(|| Error::UserInput("kubeconfigSecretRef has no resolvable namespace".to_string()))?;
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = api.get(&secret_ref.name).await?;
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get("admin-kubeconfig"))
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "secret {}/{} has no admin-kubeconfig key",
                namespace, secret_ref.name
            ))
        })?;
    let kubeconfig_yaml = String::from_utf8(data.0.clone())
        .map_err(|e| Error::ValidationError(format!("admin-kubeconfig is not valid utf-8: {e}")))?;
    let kubeconfig = kube::config::Kubeconfig::from_yaml(&kubeconfig_yaml)
        .map_err(|e| Error::ValidationError(format!("admin-kubeconfig is not valid: {e}")))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
        .await
        .map_err(|e| Error::ValidationError(format!("failed to build tenant client config: {e}")))?;
    Client::try_from(config).map_err(Error::from)
}

fn on_error(instance: Arc<VirtualCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("descriptor reconcile error: {error} ({})", instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_queue_tuning_parses() {
        let queue = vc_types::QueueTuning {
            queue_expire_duration: "15m".to_string(),
            idle_queue_check_period: "2m".to_string(),
        };
        assert!(validate_queue_tuning(&queue).is_ok());
    }

    #[test]
    fn unparsable_queue_tuning_is_rejected() {
        let queue = vc_types::QueueTuning {
            queue_expire_duration: "not-a-duration".to_string(),
            idle_queue_check_period: "2m".to_string(),
        };
        assert!(validate_queue_tuning(&queue).is_err());
    }
}
