use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipnetwork::Ipv4Network;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{error, info, warn};

use meshnet_crds::v1alpha1::endpoint::Endpoint;
use meshnet_dataplane::RuleOp;
use meshnet_dataplane::filter::InterClusterFilterDriver;
use meshnet_dataplane::overlay::{GatewayRole, HostInterface, OverlayInterfaceDriver};
use meshnet_dataplane::routing::RouteDriver;

use crate::Result;
use crate::cidr::check_overlapping_subnets;
use crate::vtep::vtep_ip;

pub struct SyncHandlerConfig {
    /// This process's node identity; endpoints carrying it toggle the
    /// gateway role.
    pub hostname: String,
    pub local_service_cidrs: Vec<Ipv4Network>,
    pub local_cluster_cidrs: Vec<Ipv4Network>,
}

/// Reconciles local and remote endpoint events into overlay-interface,
/// routing and filter state. One mutex serializes every handler method; the
/// handler exposes no concurrency to callers.
pub struct SyncHandler {
    hostname: String,
    local_service_cidrs: Vec<Ipv4Network>,
    local_cluster_cidrs: Vec<Ipv4Network>,
    overlay: Arc<dyn OverlayInterfaceDriver>,
    routes: Arc<dyn RouteDriver>,
    filter: Arc<dyn InterClusterFilterDriver>,
    host_iface: Arc<dyn HostInterface>,
    state: Mutex<HandlerState>,
}

#[derive(Default)]
struct HandlerState {
    is_gateway_node: bool,
    gw_ips: HashSet<Ipv4Addr>,
    remote_subnets: HashSet<Ipv4Network>,
    remote_subnet_gw: HashMap<Ipv4Network, Ipv4Addr>,
    remote_endpoint_last_seen: HashMap<String, Time>,
    local_cable_driver: String,
}

impl HandlerState {
    // A recorded endpoint newer than this event means the event is stale.
    fn seen_newer(&self, endpoint: &Endpoint) -> bool {
        let Some(last) = self.remote_endpoint_last_seen.get(&endpoint.spec.cluster_id) else {
            return false;
        };
        let Some(ts) = endpoint.metadata.creation_timestamp.as_ref() else {
            return false;
        };

        last.0 > ts.0
    }
}

impl SyncHandler {
    pub fn new(
        config: SyncHandlerConfig,
        overlay: Arc<dyn OverlayInterfaceDriver>,
        routes: Arc<dyn RouteDriver>,
        filter: Arc<dyn InterClusterFilterDriver>,
        host_iface: Arc<dyn HostInterface>,
    ) -> Self {
        Self {
            hostname: config.hostname,
            local_service_cidrs: config.local_service_cidrs,
            local_cluster_cidrs: config.local_cluster_cidrs,
            overlay,
            routes,
            filter,
            host_iface,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn local_endpoint_created(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let gw_ip = endpoint.spec.private_ip;
        state.gw_ips.insert(gw_ip);

        // Flip the role as early as possible; either an endpoint with our
        // hostname arrives or transition_to_gateway is called.
        if endpoint.spec.hostname == self.hostname {
            state.is_gateway_node = true;
        }

        state.local_cable_driver = endpoint.spec.backend.clone();

        info!("updating the overlay interface and routes with gateway IP {}", gw_ip);
        self.update_overlay_interface(&endpoint.spec.hostname, state.is_gateway_node);

        self.routes.reconcile_vtep_routes(vtep_ip(gw_ip))?;

        Ok(())
    }

    pub fn local_endpoint_updated(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    pub fn local_endpoint_removed(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        state.gw_ips.remove(&endpoint.spec.private_ip);

        if endpoint.spec.hostname == self.hostname {
            state.is_gateway_node = false;
        }

        self.update_overlay_interface(&endpoint.spec.hostname, state.is_gateway_node);

        Ok(())
    }

    pub fn remote_endpoint_created(&self, endpoint: &Endpoint) -> Result<()> {
        if let Err(e) = check_overlapping_subnets(
            &self.local_service_cidrs,
            &self.local_cluster_cidrs,
            &endpoint.spec.subnets,
        ) {
            // Skip the endpoint and report success so the syncer does not
            // requeue a permanently conflicting object.
            error!(
                "skipping remote endpoint {} from cluster {}: {}",
                endpoint.name_any(),
                endpoint.spec.cluster_id,
                e
            );
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();

        if state.seen_newer(endpoint) {
            info!(
                "ignoring remote endpoint from cluster {} since a later one was already processed",
                endpoint.spec.cluster_id
            );
            return Ok(());
        }

        let gw_ip = endpoint.gateway_ip();
        for subnet in &endpoint.spec.subnets {
            state.remote_subnets.insert(*subnet);
            state.remote_subnet_gw.insert(*subnet, gw_ip);
        }

        self.routes
            .update_inter_cluster_routes(&endpoint.spec.subnets, RuleOp::Add)?;

        if let Err(e) = self
            .routes
            .update_host_network_routes(&endpoint.spec.subnets, RuleOp::Add)
        {
            warn!("failed to add host network routes for cluster {}: {}", endpoint.spec.cluster_id, e);
        }

        if let Err(e) = self
            .filter
            .update_inter_cluster_rules(&endpoint.spec.subnets, RuleOp::Add)
        {
            warn!("failed to add inter-cluster filter rules for cluster {}: {}", endpoint.spec.cluster_id, e);
        }

        if let Some(ts) = endpoint.metadata.creation_timestamp.clone() {
            state
                .remote_endpoint_last_seen
                .insert(endpoint.spec.cluster_id.clone(), ts);
        }

        Ok(())
    }

    pub fn remote_endpoint_updated(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    pub fn remote_endpoint_removed(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.seen_newer(endpoint) {
            info!(
                "ignoring deleted remote endpoint from cluster {} since a later one was already processed",
                endpoint.spec.cluster_id
            );
            return Ok(());
        }

        state.remote_endpoint_last_seen.remove(&endpoint.spec.cluster_id);

        for subnet in &endpoint.spec.subnets {
            state.remote_subnets.remove(subnet);
            state.remote_subnet_gw.remove(subnet);
        }

        self.routes
            .update_inter_cluster_routes(&endpoint.spec.subnets, RuleOp::Delete)?;

        if let Err(e) = self
            .routes
            .update_host_network_routes(&endpoint.spec.subnets, RuleOp::Delete)
        {
            warn!("failed to remove host network routes for cluster {}: {}", endpoint.spec.cluster_id, e);
        }

        if let Err(e) = self
            .filter
            .update_inter_cluster_rules(&endpoint.spec.subnets, RuleOp::Delete)
        {
            warn!("failed to remove inter-cluster filter rules for cluster {}: {}", endpoint.spec.cluster_id, e);
        }

        Ok(())
    }

    /// Explicit role flip from the broader system. A single overlay
    /// re-program call per transition.
    pub fn transition_to_gateway(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_gateway_node = true;
        self.update_overlay_interface(&self.hostname, true);
    }

    pub fn transition_to_worker(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_gateway_node = false;
        self.update_overlay_interface(&self.hostname, false);
    }

    pub fn is_gateway_node(&self) -> bool {
        self.state.lock().unwrap().is_gateway_node
    }

    pub fn gateway_ips(&self) -> HashSet<Ipv4Addr> {
        self.state.lock().unwrap().gw_ips.clone()
    }

    pub fn remote_subnets(&self) -> HashSet<Ipv4Network> {
        self.state.lock().unwrap().remote_subnets.clone()
    }

    pub fn remote_subnet_gateways(&self) -> HashMap<Ipv4Network, Ipv4Addr> {
        self.state.lock().unwrap().remote_subnet_gw.clone()
    }

    /// Cable-driver tag of the local gateway endpoint.
    pub fn local_cable_driver(&self) -> String {
        self.state.lock().unwrap().local_cable_driver.clone()
    }

    pub fn last_seen(&self, cluster_id: &str) -> Option<Time> {
        self.state
            .lock()
            .unwrap()
            .remote_endpoint_last_seen
            .get(cluster_id)
            .cloned()
    }

    /// First IPv4 address of the host's primary interface.
    pub fn local_host_ip(&self) -> Result<Option<Ipv4Addr>> {
        Ok(self.host_iface.ipv4_addr()?)
    }

    fn update_overlay_interface(&self, endpoint_hostname: &str, is_gateway: bool) {
        let role = if is_gateway {
            GatewayRole::Gateway
        } else {
            GatewayRole::Worker
        };

        if let Err(e) = self.overlay.update_interface(endpoint_hostname, role) {
            // Forwarding correctness depends on the overlay interface; the
            // surrounding orchestrator restarts the process.
            error!("unable to update the overlay interface for {} as {:?}: {}", endpoint_hostname, role, e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use k8s_openapi::chrono::{TimeZone, Utc};
    use kube::api::ObjectMeta;

    use meshnet_crds::v1alpha1::endpoint::EndpointSpec;

    use super::*;

    #[derive(Default)]
    struct FakeDrivers {
        interface_updates: Mutex<Vec<(String, GatewayRole)>>,
        inter_cluster_routes: Mutex<HashSet<Ipv4Network>>,
        host_routes: Mutex<HashSet<Ipv4Network>>,
        filter_subnets: Mutex<HashSet<Ipv4Network>>,
        vteps: Mutex<Vec<Ipv4Addr>>,
        fail_inter_cluster: AtomicBool,
    }

    impl FakeDrivers {
        fn apply(set: &Mutex<HashSet<Ipv4Network>>, subnets: &[Ipv4Network], op: RuleOp) {
            let mut set = set.lock().unwrap();
            for subnet in subnets {
                match op {
                    RuleOp::Add => {
                        set.insert(*subnet);
                    }
                    RuleOp::Delete => {
                        set.remove(subnet);
                    }
                }
            }
        }

        fn last_interface_update(&self) -> (String, GatewayRole) {
            self.interface_updates
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("interface update")
        }
    }

    impl OverlayInterfaceDriver for FakeDrivers {
        fn update_interface(
            &self,
            endpoint_hostname: &str,
            role: GatewayRole,
        ) -> meshnet_dataplane::Result<()> {
            self.interface_updates
                .lock()
                .unwrap()
                .push((endpoint_hostname.into(), role));
            Ok(())
        }
    }

    impl RouteDriver for FakeDrivers {
        fn update_inter_cluster_routes(
            &self,
            subnets: &[Ipv4Network],
            op: RuleOp,
        ) -> meshnet_dataplane::Result<()> {
            if self.fail_inter_cluster.load(Ordering::SeqCst) {
                return Err(meshnet_dataplane::Error::Routing("route update failed".into()));
            }
            Self::apply(&self.inter_cluster_routes, subnets, op);
            Ok(())
        }

        fn update_host_network_routes(
            &self,
            subnets: &[Ipv4Network],
            op: RuleOp,
        ) -> meshnet_dataplane::Result<()> {
            Self::apply(&self.host_routes, subnets, op);
            Ok(())
        }

        fn reconcile_vtep_routes(&self, vtep: Ipv4Addr) -> meshnet_dataplane::Result<()> {
            self.vteps.lock().unwrap().push(vtep);
            Ok(())
        }
    }

    impl InterClusterFilterDriver for FakeDrivers {
        fn update_inter_cluster_rules(
            &self,
            subnets: &[Ipv4Network],
            op: RuleOp,
        ) -> meshnet_dataplane::Result<()> {
            Self::apply(&self.filter_subnets, subnets, op);
            Ok(())
        }
    }

    impl HostInterface for FakeDrivers {
        fn ipv4_addr(&self) -> meshnet_dataplane::Result<Option<Ipv4Addr>> {
            Ok(Some("172.16.0.5".parse().expect("ip")))
        }
    }

    fn new_handler() -> (Arc<FakeDrivers>, SyncHandler) {
        let drivers = Arc::new(FakeDrivers::default());
        let handler = SyncHandler::new(
            SyncHandlerConfig {
                hostname: "node-1".into(),
                local_service_cidrs: vec!["10.96.0.0/16".parse().expect("cidr")],
                local_cluster_cidrs: vec!["10.244.0.0/16".parse().expect("cidr")],
            },
            drivers.clone(),
            drivers.clone(),
            drivers.clone(),
            drivers.clone(),
        );
        (drivers, handler)
    }

    fn make_endpoint(
        cluster_id: &str,
        hostname: &str,
        private_ip: &str,
        subnets: &[&str],
        created_secs: i64,
    ) -> Endpoint {
        Endpoint {
            metadata: ObjectMeta {
                name: Some(format!("{cluster_id}-{hostname}")),
                namespace: Some("overlay".into()),
                creation_timestamp: Some(Time(
                    Utc.timestamp_opt(created_secs, 0).single().expect("timestamp"),
                )),
                ..Default::default()
            },
            spec: EndpointSpec {
                cluster_id: cluster_id.into(),
                hostname: hostname.into(),
                private_ip: private_ip.parse().expect("ip"),
                public_ip: None,
                nat_enabled: false,
                backend: "wireguard".into(),
                subnets: subnets.iter().map(|s| s.parse().expect("cidr")).collect(),
                health_check_ip: None,
            },
        }
    }

    fn net(s: &str) -> Ipv4Network {
        s.parse().expect("cidr")
    }

    #[test]
    fn test_local_endpoint_with_own_hostname_makes_this_node_the_gateway() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("west", "node-1", "192.168.1.10", &[], 100);

        handler.local_endpoint_created(&endpoint).expect("created");

        assert!(handler.is_gateway_node());
        assert!(handler.gateway_ips().contains(&"192.168.1.10".parse::<Ipv4Addr>().expect("ip")));
        assert_eq!(handler.local_cable_driver(), "wireguard");
        assert_eq!(drivers.last_interface_update(), ("node-1".into(), GatewayRole::Gateway));
        assert_eq!(
            *drivers.vteps.lock().unwrap(),
            vec!["241.168.1.10".parse::<Ipv4Addr>().expect("ip")]
        );

        handler.local_endpoint_removed(&endpoint).expect("removed");

        assert!(!handler.is_gateway_node());
        assert!(handler.gateway_ips().is_empty());
        assert_eq!(drivers.last_interface_update(), ("node-1".into(), GatewayRole::Worker));
    }

    #[test]
    fn test_local_endpoint_for_another_node_keeps_the_worker_role() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("west", "node-2", "192.168.1.11", &[], 100);

        handler.local_endpoint_created(&endpoint).expect("created");

        assert!(!handler.is_gateway_node());
        assert!(handler.gateway_ips().contains(&"192.168.1.11".parse::<Ipv4Addr>().expect("ip")));
        assert_eq!(drivers.last_interface_update(), ("node-2".into(), GatewayRole::Worker));
    }

    #[test]
    fn test_local_endpoint_updated_is_a_noop() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("west", "node-1", "192.168.1.10", &[], 100);

        handler.local_endpoint_updated(&endpoint).expect("updated");

        assert!(drivers.interface_updates.lock().unwrap().is_empty());
        assert!(handler.gateway_ips().is_empty());
    }

    #[test]
    fn test_remote_endpoint_installs_routes_and_rules() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("east", "gw-1", "192.168.2.10", &["10.1.0.0/16"], 100);

        handler.remote_endpoint_created(&endpoint).expect("created");

        assert!(handler.remote_subnets().contains(&net("10.1.0.0/16")));
        assert_eq!(
            handler.remote_subnet_gateways().get(&net("10.1.0.0/16")),
            Some(&"192.168.2.10".parse::<Ipv4Addr>().expect("ip"))
        );
        assert!(drivers.inter_cluster_routes.lock().unwrap().contains(&net("10.1.0.0/16")));
        assert!(drivers.host_routes.lock().unwrap().contains(&net("10.1.0.0/16")));
        assert!(drivers.filter_subnets.lock().unwrap().contains(&net("10.1.0.0/16")));
        assert_eq!(
            handler.last_seen("east").expect("last seen").0,
            Utc.timestamp_opt(100, 0).single().expect("timestamp")
        );
    }

    #[test]
    fn test_older_remote_endpoint_is_ignored() {
        let (_, handler) = new_handler();
        let newer = make_endpoint("east", "gw-1", "192.168.2.10", &["10.1.0.0/16"], 100);
        let older = make_endpoint("east", "gw-2", "192.168.2.11", &["10.2.0.0/16"], 50);

        handler.remote_endpoint_created(&newer).expect("created");
        handler.remote_endpoint_created(&older).expect("created");

        let subnets = handler.remote_subnets();
        assert!(subnets.contains(&net("10.1.0.0/16")));
        assert!(!subnets.contains(&net("10.2.0.0/16")));
        // The recorded timestamp never went backwards.
        assert_eq!(
            handler.last_seen("east").expect("last seen").0,
            Utc.timestamp_opt(100, 0).single().expect("timestamp")
        );
    }

    #[test]
    fn test_stale_remote_delete_is_ignored() {
        let (_, handler) = new_handler();
        let newer = make_endpoint("east", "gw-1", "192.168.2.10", &["10.1.0.0/16"], 100);
        let stale = make_endpoint("east", "gw-2", "192.168.2.11", &["10.1.0.0/16"], 50);

        handler.remote_endpoint_created(&newer).expect("created");
        handler.remote_endpoint_removed(&stale).expect("removed");

        assert!(handler.remote_subnets().contains(&net("10.1.0.0/16")));
        assert!(handler.last_seen("east").is_some());
    }

    #[test]
    fn test_remove_restores_the_prior_state() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("east", "gw-1", "192.168.2.10", &["10.1.0.0/16", "10.2.0.0/16"], 100);

        handler.remote_endpoint_created(&endpoint).expect("created");
        handler.remote_endpoint_removed(&endpoint).expect("removed");

        assert!(handler.remote_subnets().is_empty());
        assert!(handler.remote_subnet_gateways().is_empty());
        assert!(handler.last_seen("east").is_none());
        assert!(drivers.inter_cluster_routes.lock().unwrap().is_empty());
        assert!(drivers.host_routes.lock().unwrap().is_empty());
        assert!(drivers.filter_subnets.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_remote_subnets_are_skipped_without_error() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("east", "gw-1", "192.168.2.10", &["10.244.10.0/24"], 100);

        handler.remote_endpoint_created(&endpoint).expect("skipped");

        assert!(handler.remote_subnets().is_empty());
        assert!(handler.last_seen("east").is_none());
        assert!(drivers.inter_cluster_routes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_after_suppressed_add_is_tolerated() {
        let (_, handler) = new_handler();
        let endpoint = make_endpoint("east", "gw-1", "192.168.2.10", &["10.244.10.0/24"], 100);

        handler.remote_endpoint_created(&endpoint).expect("skipped");
        // The rules were never installed; removal still succeeds.
        handler.remote_endpoint_removed(&endpoint).expect("removed");
    }

    #[test]
    fn test_route_failure_on_remove_propagates_for_requeue() {
        let (drivers, handler) = new_handler();
        let endpoint = make_endpoint("east", "gw-1", "192.168.2.10", &["10.1.0.0/16"], 100);
        handler.remote_endpoint_created(&endpoint).expect("created");

        drivers.fail_inter_cluster.store(true, Ordering::SeqCst);
        assert!(handler.remote_endpoint_removed(&endpoint).is_err());
    }

    #[test]
    fn test_explicit_role_transitions() {
        let (drivers, handler) = new_handler();

        handler.transition_to_gateway();
        assert!(handler.is_gateway_node());
        assert_eq!(drivers.last_interface_update(), ("node-1".into(), GatewayRole::Gateway));

        handler.transition_to_worker();
        assert!(!handler.is_gateway_node());
        assert_eq!(drivers.last_interface_update(), ("node-1".into(), GatewayRole::Worker));
    }

    #[test]
    fn test_local_host_ip_comes_from_the_host_interface() {
        let (_, handler) = new_handler();
        assert_eq!(
            handler.local_host_ip().expect("host ip"),
            Some("172.16.0.5".parse().expect("ip"))
        );
    }
}
