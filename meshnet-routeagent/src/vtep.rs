use std::net::Ipv4Addr;

/// First octet of the overlay tunnel endpoint network. Rewriting a gateway
/// address into this unused /8 yields a VTEP that cannot collide with host
/// addressing.
pub const VTEP_PREFIX: u8 = 241;

/// Tunnel endpoint address for a gateway. A pure function of the gateway IP,
/// so local and remote sides derive the same address without negotiation.
pub fn vtep_ip(gateway: Ipv4Addr) -> Ipv4Addr {
    let [_, b, c, d] = gateway.octets();
    Ipv4Addr::new(VTEP_PREFIX, b, c, d)
}
