pub mod base;
pub mod controller;
pub mod pod_watcher;
pub mod syncer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("ipam error: {0}")]
    Ipam(#[from] meshnet_ipam::Error),

    #[error("dataplane error: {0}")]
    Dataplane(#[from] meshnet_dataplane::Error),

    #[error("invalid pod selector: {0}")]
    InvalidSelector(String),

    #[error("object {0} has no namespace")]
    MissingNamespace(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
