use std::fmt;
use std::net::Ipv4Addr;

/// Source address (or inclusive address range) egress packets are rewritten
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnatTarget {
    Single(Ipv4Addr),
    Range(Ipv4Addr, Ipv4Addr),
}

impl SnatTarget {
    /// Derives the target from an allocation list: a single entry is used
    /// verbatim, otherwise the first and last entries label the range in
    /// allocation order.
    pub fn from_ips(ips: &[Ipv4Addr]) -> Option<Self> {
        match ips {
            [] => None,
            [single] => Some(Self::Single(*single)),
            [first, .., last] => Some(Self::Range(*first, *last)),
        }
    }
}

impl fmt::Display for SnatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(ip) => write!(f, "{ip}"),
            Self::Range(first, last) => write!(f, "{first}-{last}"),
        }
    }
}
