use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::Result;

/// Driver over kernel named IP sets of hash-ip type. Implementations are
/// process-wide and must be idempotent: repeating an add produces no
/// duplicate entry and removing an absent entry succeeds.
pub trait IpSetDriver: Send + Sync {
    fn create_set(&self, name: &str, ignore_existing: bool) -> Result<()>;
    fn destroy_set(&self, name: &str) -> Result<()>;
    fn add_entry(&self, name: &str, ip: Ipv4Addr) -> Result<()>;
    fn del_entry(&self, name: &str, ip: Ipv4Addr) -> Result<()>;
}

/// A named set bound to its driver.
#[derive(Clone)]
pub struct NamedIpSet {
    name: String,
    driver: Arc<dyn IpSetDriver>,
}

impl NamedIpSet {
    pub fn new(name: String, driver: Arc<dyn IpSetDriver>) -> Self {
        Self { name, driver }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create(&self, ignore_existing: bool) -> Result<()> {
        self.driver.create_set(&self.name, ignore_existing)
    }

    pub fn destroy(&self) -> Result<()> {
        self.driver.destroy_set(&self.name)
    }

    pub fn add(&self, ip: Ipv4Addr) -> Result<()> {
        self.driver.add_entry(&self.name, ip)
    }

    pub fn remove(&self, ip: Ipv4Addr) -> Result<()> {
        self.driver.del_entry(&self.name, ip)
    }
}

impl fmt::Debug for NamedIpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedIpSet").field("name", &self.name).finish()
    }
}
