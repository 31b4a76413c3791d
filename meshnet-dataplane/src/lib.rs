pub mod filter;
pub mod ipset;
pub mod overlay;
pub mod routing;
mod snat;

pub use snat::SnatTarget;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ipset operation failed: {0}")]
    IpSet(String),

    #[error("packet filter operation failed: {0}")]
    Filter(String),

    #[error("routing operation failed: {0}")]
    Routing(String),

    #[error("overlay interface operation failed: {0}")]
    Overlay(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether a rule or route is being installed or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Delete,
}
