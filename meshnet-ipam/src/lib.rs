use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("pool exhausted: requested {requested} IP(s) but only {available} free")]
    Exhausted { requested: usize, available: usize },

    #[error("address {0} is outside the pool range")]
    OutOfRange(Ipv4Addr),

    #[error("address {0} is already reserved")]
    AlreadyReserved(Ipv4Addr),

    #[error("pool range is empty")]
    EmptyRange,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fixed-range IPv4 allocator. Every operation is atomic: a caller observes
/// either all requested addresses moved between the free and reserved sets
/// or none of them.
pub struct IpPool {
    lo: u32,
    hi: u32,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: BTreeSet<Ipv4Addr>,
    reserved: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    /// Pool over the usable hosts of `network`. The network and broadcast
    /// addresses are excluded for prefixes shorter than /31.
    pub fn new(network: Ipv4Network) -> Result<Self> {
        let mut lo = u32::from(network.network());
        let mut hi = u32::from(network.broadcast());
        if network.prefix() < 31 {
            lo += 1;
            hi -= 1;
        }
        Self::from_range(Ipv4Addr::from(lo), Ipv4Addr::from(hi))
    }

    /// Pool over the inclusive range `[lo, hi]`.
    pub fn from_range(lo: Ipv4Addr, hi: Ipv4Addr) -> Result<Self> {
        if u32::from(lo) > u32::from(hi) {
            return Err(Error::EmptyRange);
        }

        let free = (u32::from(lo)..=u32::from(hi)).map(Ipv4Addr::from).collect();
        Ok(Self {
            lo: u32::from(lo),
            hi: u32::from(hi),
            state: Mutex::new(PoolState {
                free,
                reserved: BTreeSet::new(),
            }),
        })
    }

    pub fn size(&self) -> usize {
        (self.hi - self.lo + 1) as usize
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.state.lock().unwrap().reserved.len()
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.lo..=self.hi).contains(&u32::from(ip))
    }

    /// Reserves `n` previously-free addresses. The returned list is stable
    /// within one call; ordering across calls is not guaranteed.
    pub fn allocate(&self, n: usize) -> Result<Vec<Ipv4Addr>> {
        let mut state = self.state.lock().unwrap();
        if state.free.len() < n {
            return Err(Error::Exhausted {
                requested: n,
                available: state.free.len(),
            });
        }

        let ips: Vec<Ipv4Addr> = state.free.iter().take(n).copied().collect();
        for ip in &ips {
            state.free.remove(ip);
            state.reserved.insert(*ip);
        }

        debug!("allocated {:?} from the pool", ips);
        Ok(ips)
    }

    /// Returns each address to the free set. Releasing an already-free
    /// address is a no-op; any address outside the range fails the whole
    /// call before any state changes.
    pub fn release(&self, ips: &[Ipv4Addr]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(outside) = ips.iter().find(|ip| !self.contains(**ip)) {
            return Err(Error::OutOfRange(*outside));
        }

        for ip in ips {
            state.reserved.remove(ip);
            state.free.insert(*ip);
        }

        Ok(())
    }

    /// Marks existing allocations at startup. Fails atomically when any
    /// address conflicts with a prior reservation.
    pub fn reserve(&self, ips: &[Ipv4Addr]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for ip in ips {
            if !self.contains(*ip) {
                return Err(Error::OutOfRange(*ip));
            }
            if state.reserved.contains(ip) {
                return Err(Error::AlreadyReserved(*ip));
            }
        }

        for ip in ips {
            state.free.remove(ip);
            state.reserved.insert(*ip);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().expect("ip")
    }

    fn pool() -> IpPool {
        IpPool::from_range(ip("10.0.0.1"), ip("10.0.0.3")).expect("pool")
    }

    #[test]
    fn test_new_excludes_network_and_broadcast() {
        let pool = IpPool::new("192.168.1.0/24".parse().expect("cidr")).expect("pool");
        assert_eq!(pool.size(), 254);
        assert_eq!(pool.free_count(), 254);
        assert!(pool.release(&[ip("192.168.1.0")]).is_err());
        assert!(pool.release(&[ip("192.168.1.255")]).is_err());
    }

    #[test]
    fn test_allocate_is_stable_and_ordered() {
        let pool = pool();
        let ips = pool.allocate(2).expect("allocate");
        assert_eq!(ips, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.reserved_count(), 2);
    }

    #[test]
    fn test_allocate_exhausted() {
        let pool = pool();
        pool.allocate(2).expect("allocate");
        let err = pool.allocate(2).expect_err("exhausted");
        assert_eq!(
            err,
            Error::Exhausted {
                requested: 2,
                available: 1
            }
        );
        // Nothing moved on failure.
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_release_returns_addresses() {
        let pool = pool();
        let ips = pool.allocate(3).expect("allocate");
        pool.release(&ips).expect("release");
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.reserved_count(), 0);
    }

    #[test]
    fn test_release_free_address_is_noop() {
        let pool = pool();
        pool.release(&[ip("10.0.0.2")]).expect("release");
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_release_out_of_range_changes_nothing() {
        let pool = pool();
        let ips = pool.allocate(1).expect("allocate");
        let err = pool.release(&[ips[0], ip("10.0.1.1")]).expect_err("out of range");
        assert_eq!(err, Error::OutOfRange(ip("10.0.1.1")));
        assert_eq!(pool.reserved_count(), 1);
    }

    #[test]
    fn test_reserve_marks_existing_allocations() {
        let pool = pool();
        pool.reserve(&[ip("10.0.0.2")]).expect("reserve");
        let ips = pool.allocate(2).expect("allocate");
        assert_eq!(ips, vec![ip("10.0.0.1"), ip("10.0.0.3")]);
    }

    #[test]
    fn test_reserve_conflict_is_atomic() {
        let pool = pool();
        pool.reserve(&[ip("10.0.0.1")]).expect("reserve");
        let err = pool
            .reserve(&[ip("10.0.0.2"), ip("10.0.0.1")])
            .expect_err("conflict");
        assert_eq!(err, Error::AlreadyReserved(ip("10.0.0.1")));
        // The non-conflicting address stayed free.
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.reserved_count(), 1);
    }

    #[test]
    fn test_free_and_reserved_partition_the_range() {
        let pool = pool();
        pool.allocate(2).expect("allocate");
        pool.release(&[ip("10.0.0.1")]).expect("release");
        assert_eq!(pool.free_count() + pool.reserved_count(), pool.size());
    }

    #[test]
    fn test_empty_range() {
        assert_eq!(
            IpPool::from_range(ip("10.0.0.2"), ip("10.0.0.1")).err(),
            Some(Error::EmptyRange)
        );
    }
}
