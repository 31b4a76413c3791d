use std::net::Ipv4Addr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use kube::KubeSchema;
use kube::ResourceExt;
use schemars::{JsonSchema, json_schema};
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_GLOBAL_EGRESS_IP: &str = "globalegressips.meshnet.dev";

/// The only condition type recorded on GlobalEgressIP status.
pub const CONDITION_ALLOCATED: &str = "Allocated";

/// Declares a set of cluster-scoped egress addresses for the workloads of a
/// namespace, optionally narrowed by a pod selector.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "meshnet.dev",
    version = "v1alpha1",
    kind = "GlobalEgressIP",
    derive = "Default",
    derive = "PartialEq",
    status = "GlobalEgressIpStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEgressIpSpec {
    /// Number of global addresses to reserve. Absent means one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_ips: Option<i32>,

    /// Narrows the scope to matching workloads; absent covers the whole
    /// namespace. Immutable after the first successful reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "label_selector")]
    pub pod_selector: Option<LabelSelector>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEgressIpStatus {
    /// Addresses currently reserved for this object, in allocation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocated_ips: Vec<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "conditions")]
    pub conditions: Vec<Condition>,
}

impl GlobalEgressIP {
    /// Namespace-qualified key, unique across the cluster.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

fn label_selector(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "object",
        "properties": {
            "matchExpressions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "operator": { "type": "string" },
                        "values": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["key", "operator"]
                }
            },
            "matchLabels": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            }
        },
    })
}

fn conditions(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    })
}
