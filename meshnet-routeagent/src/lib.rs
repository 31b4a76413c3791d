pub mod cidr;
pub mod handler;
pub mod healthchecker;
pub mod runtime;
pub mod vtep;

use ipnetwork::Ipv4Network;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("dataplane error: {0}")]
    Dataplane(#[from] meshnet_dataplane::Error),

    #[error("subnet {0} overlaps with the local service or cluster CIDRs")]
    OverlappingSubnet(Ipv4Network),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
