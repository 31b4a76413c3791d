use ipnetwork::Ipv4Network;

use crate::{Error, Result};

/// Fails when any of `subnets` overlaps the local service or cluster CIDRs.
/// Remote endpoints carrying such subnets cannot be routed and are skipped
/// by the caller.
pub fn check_overlapping_subnets(
    local_service_cidrs: &[Ipv4Network],
    local_cluster_cidrs: &[Ipv4Network],
    subnets: &[Ipv4Network],
) -> Result<()> {
    for subnet in subnets {
        if local_service_cidrs
            .iter()
            .chain(local_cluster_cidrs)
            .any(|local| local.overlaps(*subnet))
        {
            return Err(Error::OverlappingSubnet(*subnet));
        }
    }

    Ok(())
}
