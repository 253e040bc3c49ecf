//! Virtual node addressing. A tenant's view of a cluster node is either
//! a direct passthrough of the super node's address, or routed through
//! a cluster-local service when `v_node_provider_service` is enabled
//! (spec.md §6's feature gate). Modeled as a sum type rather than an
//! inheritance hierarchy per spec.md §9's "record of function
//! pointers" guidance generalized to the simpler case of two fixed
//! variants.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VNodeEndpoint {
    /// The tenant node object carries the super node's address and
    /// port directly; no extra hop.
    Direct { address: String, port: u16 },
    /// The tenant node's kubelet endpoint is a cluster-local service
    /// fronting the real node, for feature-gated isolation.
    ServiceRouted {
        service_name: String,
        service_namespace: String,
        port: u16,
    },
}

impl VNodeEndpoint {
    pub fn direct(address: impl Into<String>, port: u16) -> Self {
        Self::Direct {
            address: address.into(),
            port,
        }
    }

    pub fn service_routed(
        service_name: impl Into<String>,
        service_namespace: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::ServiceRouted {
            service_name: service_name.into(),
            service_namespace: service_namespace.into(),
            port,
        }
    }

    /// The host tenant kubelet clients should dial. For `ServiceRouted`
    /// this is the service's cluster-local DNS name, not the node's
    /// real address.
    pub fn host(&self) -> String {
        match self {
            VNodeEndpoint::Direct { address, .. } => address.clone(),
            VNodeEndpoint::ServiceRouted {
                service_name,
                service_namespace,
                ..
            } => format!("{service_name}.{service_namespace}.svc"),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            VNodeEndpoint::Direct { port, .. } => *port,
            VNodeEndpoint::ServiceRouted { port, .. } => *port,
        }
    }
}

/// Picks the endpoint variant per the descriptor's
/// `v_node_provider_service` feature gate.
pub fn resolve_endpoint(
    v_node_provider_service: bool,
    node_name: &str,
    super_namespace: &str,
    real_address: &str,
    port: u16,
) -> VNodeEndpoint {
    if v_node_provider_service {
        VNodeEndpoint::service_routed(format!("vnode-{node_name}"), super_namespace, port)
    } else {
        VNodeEndpoint::direct(real_address, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_mode_passes_through_real_address() {
        let ep = resolve_endpoint(false, "node-1", "vc-a-default", "10.0.0.5", 10250);
        assert_eq!(ep.host(), "10.0.0.5");
        assert_eq!(ep.port(), 10250);
    }

    #[test]
    fn service_routed_mode_points_at_cluster_local_service() {
        let ep = resolve_endpoint(true, "node-1", "vc-a-default", "10.0.0.5", 10250);
        assert_eq!(ep.host(), "vnode-node-1.vc-a-default.svc");
    }
}
