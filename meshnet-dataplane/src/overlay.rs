use std::net::Ipv4Addr;

use crate::Result;

/// Role of this node for inter-cluster traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRole {
    Worker,
    Gateway,
}

/// Creates and re-programs the overlay tunnel interface. The interface mode
/// depends on the node role, so every role change is followed by exactly one
/// update call.
pub trait OverlayInterfaceDriver: Send + Sync {
    fn update_interface(&self, endpoint_hostname: &str, role: GatewayRole) -> Result<()>;
}

/// Handle to the host's primary network interface.
pub trait HostInterface: Send + Sync {
    /// First IPv4 address configured on the interface, if any.
    fn ipv4_addr(&self) -> Result<Option<Ipv4Addr>>;
}
