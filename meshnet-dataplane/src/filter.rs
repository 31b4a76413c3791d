use ipnetwork::Ipv4Network;

use crate::{Result, RuleOp, SnatTarget};

/// Packet tag used to segregate overlay egress traffic.
pub type PacketMark = u32;

/// Process-wide mark applied to traffic rewritten to a global egress IP.
pub const EGRESS_MARK: PacketMark = 0xC0000;

/// Programs SNAT rules for global egress traffic. Rule keys are unique per
/// object key and purpose, and every operation is idempotent: a repeated add
/// installs no duplicate rule and removing an absent rule succeeds.
pub trait EgressFilterDriver: Send + Sync {
    fn add_egress_rules_for_pods(
        &self,
        key: &str,
        ip_set_name: &str,
        snat: &SnatTarget,
        mark: PacketMark,
    ) -> Result<()>;

    fn remove_egress_rules_for_pods(
        &self,
        key: &str,
        ip_set_name: &str,
        snat: &SnatTarget,
        mark: PacketMark,
    ) -> Result<()>;

    fn add_egress_rules_for_namespace(
        &self,
        key: &str,
        ip_set_name: &str,
        snat: &SnatTarget,
        mark: PacketMark,
    ) -> Result<()>;

    fn remove_egress_rules_for_namespace(
        &self,
        key: &str,
        ip_set_name: &str,
        snat: &SnatTarget,
        mark: PacketMark,
    ) -> Result<()>;
}

/// Filter rules admitting traffic to and from remote cluster subnets.
/// Removal of rules that were never installed succeeds.
pub trait InterClusterFilterDriver: Send + Sync {
    fn update_inter_cluster_rules(&self, subnets: &[Ipv4Network], op: RuleOp) -> Result<()>;
}
