use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::{Result, RuleOp};

/// Programs kernel routes for inter-cluster and host-network traffic.
/// Deleting a route that does not exist succeeds.
pub trait RouteDriver: Send + Sync {
    /// Routes steering traffic for remote subnets over the overlay.
    fn update_inter_cluster_routes(&self, subnets: &[Ipv4Network], op: RuleOp) -> Result<()>;

    /// Routes letting host-network processes reach remote subnets.
    fn update_host_network_routes(&self, subnets: &[Ipv4Network], op: RuleOp) -> Result<()>;

    /// Converges the routing table on the tunnel endpoint of the current
    /// gateway.
    fn reconcile_vtep_routes(&self, vtep: Ipv4Addr) -> Result<()>;
}
