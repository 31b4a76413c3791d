mod pinger;
mod stats;

pub use pinger::{ConnectionStatus, LatencyInfo, Pinger, PingerConfig, RttInfo};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create the icmp client: {0}")]
    SocketCreation(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
