use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use meshnet_crds::v1alpha1::endpoint::Endpoint;
use meshnet_pinger::{LatencyInfo, Pinger, PingerConfig};

/// Owns one pinger per remote cluster gateway, keyed by cluster ID.
pub struct HealthChecker {
    interval: Duration,
    max_consecutive_loss: u32,
    pingers: Mutex<HashMap<String, Arc<Pinger>>>,
}

impl HealthChecker {
    pub fn new(interval: Duration, max_consecutive_loss: u32) -> Self {
        Self {
            interval,
            max_consecutive_loss,
            pingers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts probing the endpoint's health-check address. An unchanged
    /// target leaves the running pinger alone; a changed one replaces it.
    pub fn endpoint_created(&self, endpoint: &Endpoint) {
        let cluster_id = &endpoint.spec.cluster_id;

        let Some(target) = endpoint.spec.health_check_ip else {
            debug!("no health check IP on the endpoint from cluster {}", cluster_id);
            return;
        };
        let target = IpAddr::V4(target);

        let mut pingers = self.pingers.lock().unwrap();

        if let Some(existing) = pingers.get(cluster_id) {
            if existing.target() == target {
                return;
            }
            existing.stop();
        }

        info!("starting health checker for cluster {} at {}", cluster_id, target);

        let pinger = Arc::new(Pinger::new(PingerConfig {
            target,
            interval: self.interval,
            max_consecutive_loss: self.max_consecutive_loss,
        }));
        pinger.start();
        pingers.insert(cluster_id.clone(), pinger);
    }

    pub fn endpoint_removed(&self, endpoint: &Endpoint) {
        if let Some(pinger) = self
            .pingers
            .lock()
            .unwrap()
            .remove(&endpoint.spec.cluster_id)
        {
            info!("stopping health checker for cluster {}", endpoint.spec.cluster_id);
            pinger.stop();
        }
    }

    pub fn latency_info(&self, cluster_id: &str) -> Option<LatencyInfo> {
        self.pingers
            .lock()
            .unwrap()
            .get(cluster_id)
            .map(|pinger| pinger.latency_info())
    }

    /// Stops every pinger. Idempotent.
    pub fn stop(&self) {
        for (_, pinger) in self.pingers.lock().unwrap().drain() {
            pinger.stop();
        }
    }
}

#[cfg(test)]
mod test {
    use kube::api::ObjectMeta;

    use meshnet_crds::v1alpha1::endpoint::EndpointSpec;

    use super::*;

    fn make_endpoint(cluster_id: &str, health_check_ip: Option<&str>) -> Endpoint {
        Endpoint {
            metadata: ObjectMeta::default(),
            spec: EndpointSpec {
                cluster_id: cluster_id.into(),
                hostname: "gw-1".into(),
                private_ip: "192.168.2.10".parse().expect("ip"),
                public_ip: None,
                nat_enabled: false,
                backend: "wireguard".into(),
                subnets: Vec::new(),
                health_check_ip: health_check_ip.map(|ip| ip.parse().expect("ip")),
            },
        }
    }

    #[tokio::test]
    async fn test_tracks_one_pinger_per_cluster() {
        let checker = HealthChecker::new(Duration::from_secs(1), 5);

        checker.endpoint_created(&make_endpoint("east", Some("127.0.0.1")));
        assert!(checker.latency_info("east").is_some());
        assert!(checker.latency_info("west").is_none());

        checker.endpoint_removed(&make_endpoint("east", Some("127.0.0.1")));
        assert!(checker.latency_info("east").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_without_health_check_ip_is_not_probed() {
        let checker = HealthChecker::new(Duration::from_secs(1), 5);

        checker.endpoint_created(&make_endpoint("east", None));
        assert!(checker.latency_info("east").is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let checker = HealthChecker::new(Duration::from_secs(1), 5);
        checker.endpoint_created(&make_endpoint("east", Some("127.0.0.1")));

        checker.stop();
        checker.stop();
        assert!(checker.latency_info("east").is_none());
    }
}
