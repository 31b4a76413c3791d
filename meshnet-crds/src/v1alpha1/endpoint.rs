use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kube::CustomResource;
use kube::KubeSchema;
use schemars::json_schema;
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_ENDPOINT: &str = "endpoints.meshnet.dev";

/// A cluster's connection point into the overlay, published by its active
/// gateway.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(
    group = "meshnet.dev",
    version = "v1alpha1",
    kind = "Endpoint",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub cluster_id: String,

    pub hostname: String,

    pub private_ip: Ipv4Addr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub nat_enabled: bool,

    /// Cable-driver tag, opaque to the control plane.
    pub backend: String,

    /// CIDRs reachable through this endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "cidr_list")]
    pub subnets: Vec<Ipv4Network>,

    /// Address probed to assess gateway liveness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_ip: Option<Ipv4Addr>,
}

impl Endpoint {
    /// Address remote clusters use to reach this gateway.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        if self.spec.nat_enabled {
            self.spec.public_ip.unwrap_or(self.spec.private_ip)
        } else {
            self.spec.private_ip
        }
    }
}

fn cidr_list(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "array",
        "items": { "type": "string" },
    })
}

#[cfg(test)]
mod test {
    use kube::api::ObjectMeta;

    use super::*;

    fn endpoint(nat_enabled: bool, public_ip: Option<&str>) -> Endpoint {
        Endpoint {
            metadata: ObjectMeta::default(),
            spec: EndpointSpec {
                cluster_id: "east".into(),
                hostname: "node-1".into(),
                private_ip: "192.168.1.10".parse().expect("ip"),
                public_ip: public_ip.map(|ip| ip.parse().expect("ip")),
                nat_enabled,
                backend: "wireguard".into(),
                subnets: Vec::new(),
                health_check_ip: None,
            },
        }
    }

    #[test]
    fn test_gateway_ip_without_nat() {
        let ep = endpoint(false, Some("203.0.113.7"));
        assert_eq!(ep.gateway_ip(), "192.168.1.10".parse::<Ipv4Addr>().expect("ip"));
    }

    #[test]
    fn test_gateway_ip_with_nat() {
        let ep = endpoint(true, Some("203.0.113.7"));
        assert_eq!(ep.gateway_ip(), "203.0.113.7".parse::<Ipv4Addr>().expect("ip"));
    }

    #[test]
    fn test_gateway_ip_with_nat_but_no_public_ip() {
        let ep = endpoint(true, None);
        assert_eq!(ep.gateway_ip(), "192.168.1.10".parse::<Ipv4Addr>().expect("ip"));
    }
}
