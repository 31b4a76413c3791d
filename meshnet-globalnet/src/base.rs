use data_encoding::BASE32;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::error;

pub const MAX_REQUEUES: u32 = 20;

// The kernel caps set names at 31 characters; prefix plus 25 digest
// characters stays inside it.
const IP_SET_PREFIX: &str = "mn-eg-";
const IP_SET_HASH_LEN: usize = 25;

const INTERNAL_SERVICE_PREFIX: &str = "mn-int-";
const INTERNAL_SERVICE_HASH_LEN: usize = 32;

/// Name suffix marking the per-node cluster egress IP objects.
pub const CLUSTER_EGRESS_IP_SUFFIX: &str = "cluster-egress-ips";

/// Events past the cap are dropped rather than redelivered.
pub fn should_requeue(num_requeues: u32) -> bool {
    num_requeues < MAX_REQUEUES
}

/// Returns the object when its status moved, suppressing no-op writebacks.
pub fn check_status_changed<S, T>(old: &S, new: &S, obj: T) -> Option<T>
where
    S: PartialEq,
{
    if old == new { None } else { Some(obj) }
}

/// Appends `new` unless it matches the latest condition of the same type in
/// status, reason and message. Appended conditions are stamped with the
/// current time.
pub fn try_append_status_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    if let Some(last) = conditions.iter().rev().find(|c| c.type_ == new.type_)
        && last.status == new.status
        && last.reason == new.reason
        && last.message == new.message
    {
        return;
    }

    new.last_transition_time = Time(Utc::now());
    conditions.push(new);
}

/// Stable kernel set name for a namespace/name key.
pub fn ip_set_name(key: &str) -> String {
    format!("{}{}", IP_SET_PREFIX, hashed_name(key, IP_SET_HASH_LEN))
}

/// Stable name for the internal service exported for a cluster service.
pub fn internal_service_name(name: &str) -> String {
    format!(
        "{}{}",
        INTERNAL_SERVICE_PREFIX,
        hashed_name(name, INTERNAL_SERVICE_HASH_LEN)
    )
}

fn hashed_name(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let encoded = BASE32.encode(&digest);
    encoded[..len].to_lowercase()
}

/// Cluster egress IP objects are named `<node>-cluster-egress-ips`; only the
/// object belonging to this node is processed.
pub fn should_process_cluster_global_egress_ip(name: &str) -> bool {
    let Ok(node_name) = std::env::var("NODE_NAME") else {
        error!("NODE_NAME is not set in the environment");
        return false;
    };

    let suffix = format!("-{CLUSTER_EGRESS_IP_SUFFIX}");
    name.strip_suffix(&suffix).unwrap_or(name) == node_name
}
