//! Cluster objects read by the agent, declared with the subset of fields it uses.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::ClusterResourceScope;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::cache::ClaimConsumer;
use crate::domain::cache::ClaimDevice;
use crate::domain::cache::ClaimRecord;

macro_rules! impl_resource {
    ($ty:ty, $scope:ty, $group:literal, $version:literal, $kind:literal, $plural:literal) => {
        impl kube::Resource for $ty {
            type DynamicType = ();
            type Scope = $scope;

            fn group(_dt: &()) -> Cow<'_, str> {
                $group.into()
            }

            fn version(_dt: &()) -> Cow<'_, str> {
                $version.into()
            }

            fn kind(_dt: &()) -> Cow<'_, str> {
                $kind.into()
            }

            fn plural(_dt: &()) -> Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

/// Typed value of a device attribute, exactly one field is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceAttribute {
    #[serde(rename = "int", default, skip_serializing_if = "Option::is_none")]
    pub int_value: Option<i64>,
    #[serde(rename = "bool", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(rename = "string", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub version_value: Option<String>,
}

impl DeviceAttribute {
    pub fn string(value: &str) -> Self {
        Self {
            string_value: Some(value.to_string()),
            ..Default::default()
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            bool_value: Some(value),
            ..Default::default()
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.string_value.as_deref()
    }

    /// Boolean value, accepting `"true"` strings published by older drivers
    pub fn as_bool(&self) -> Option<bool> {
        self.bool_value.or_else(|| {
            self.string_value
                .as_deref()
                .and_then(|s| s.trim().parse().ok())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BasicDevice {
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, serde_json::Value>,
}

impl BasicDevice {
    /// Attribute by plain name, also matching domain-qualified keys (`<domain>/<name>`)
    pub fn attribute(&self, name: &str) -> Option<&DeviceAttribute> {
        self.attributes.get(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(key, _)| key.rsplit_once('/').is_some_and(|(_, short)| short == name))
                .map(|(_, value)| value)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Device {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePool {
    pub name: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_slice_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceSpec {
    pub driver: String,
    pub pool: ResourcePool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Devices a driver publishes for a node
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourceSlice {
    pub metadata: ObjectMeta,
    pub spec: ResourceSliceSpec,
}

impl_resource!(
    ResourceSlice,
    ClusterResourceScope,
    "resource.k8s.io",
    "v1beta1",
    "ResourceSlice",
    "resourceslices"
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    #[serde(default)]
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceAllocationResult {
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllocationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<DeviceAllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimConsumerReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub resource: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
    #[serde(default)]
    pub reserved_for: Vec<ResourceClaimConsumerReference>,
}

/// Device claim of a workload
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourceClaim {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceClaimStatus>,
}

impl_resource!(
    ResourceClaim,
    NamespaceResourceScope,
    "resource.k8s.io",
    "v1beta1",
    "ResourceClaim",
    "resourceclaims"
);

impl ResourceClaim {
    /// Cache record of the claim, `None` for objects without namespace or name
    pub fn to_record(&self) -> Option<ClaimRecord> {
        let namespace = self.metadata.namespace.clone()?;
        let name = self.metadata.name.clone()?;
        let status = self.status.clone().unwrap_or_default();

        let reserved_for = status
            .reserved_for
            .into_iter()
            .filter(|consumer| consumer.resource == "pods")
            .map(|consumer| ClaimConsumer {
                uid: consumer.uid,
                name: consumer.name,
            })
            .collect();
        let devices = status
            .allocation
            .and_then(|allocation| allocation.devices)
            .map(|devices| devices.results)
            .unwrap_or_default()
            .into_iter()
            .map(|result| ClaimDevice {
                driver: result.driver,
                pool: result.pool,
                device: result.device,
            })
            .collect();

        Some(ClaimRecord {
            namespace,
            name,
            reserved_for,
            devices,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkAttachmentDefinitionSpec {
    /// Network-config JSON document
    #[serde(default)]
    pub config: String,
}

/// Named secondary network of a namespace
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkAttachmentDefinition {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NetworkAttachmentDefinitionSpec,
}

impl_resource!(
    NetworkAttachmentDefinition,
    NamespaceResourceScope,
    "k8s.cni.cncf.io",
    "v1",
    "NetworkAttachmentDefinition",
    "network-attachment-definitions"
);

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_resource_slice_deserialization() {
        let slice: ResourceSlice = serde_json::from_value(json!({
            "apiVersion": "resource.k8s.io/v1beta1",
            "kind": "ResourceSlice",
            "metadata": {"name": "node-a-rdma-xk2p"},
            "spec": {
                "driver": "rdma.example.com",
                "nodeName": "node-a",
                "pool": {"name": "node-a", "generation": 3, "resourceSliceCount": 1},
                "devices": [{
                    "name": "pf-0",
                    "basic": {
                        "attributes": {
                            "rdma.example.com/ifName": {"string": "ens1f0"},
                            "rdma": {"bool": true}
                        }
                    }
                }]
            }
        }))
        .expect("should parse resource slice");

        assert_eq!(slice.spec.node_name.as_deref(), Some("node-a"));
        let basic = slice.spec.devices[0].basic.as_ref().unwrap();
        assert_eq!(basic.attribute("ifName").and_then(DeviceAttribute::as_str), Some("ens1f0"));
        assert_eq!(basic.attribute("rdma").and_then(DeviceAttribute::as_bool), Some(true));
        assert_eq!(basic.attribute("state"), None);
    }

    #[test]
    fn test_claim_to_record_keeps_pod_consumers() {
        let claim: ResourceClaim = serde_json::from_value(json!({
            "metadata": {"name": "trainer-gpu", "namespace": "ml"},
            "status": {
                "allocation": {"devices": {"results": [
                    {"request": "gpu", "driver": "gpu.example.com", "pool": "node-a", "device": "gpu-0"}
                ]}},
                "reservedFor": [
                    {"resource": "pods", "name": "trainer", "uid": "uid-1"},
                    {"apiGroup": "batch", "resource": "jobs", "name": "trainer-job", "uid": "uid-j"}
                ]
            }
        }))
        .expect("should parse resource claim");

        assert_eq!(
            claim.to_record(),
            Some(ClaimRecord {
                namespace: "ml".to_string(),
                name: "trainer-gpu".to_string(),
                reserved_for: vec![ClaimConsumer {
                    uid: "uid-1".to_string(),
                    name: "trainer".to_string(),
                }],
                devices: vec![ClaimDevice {
                    driver: "gpu.example.com".to_string(),
                    pool: "node-a".to_string(),
                    device: "gpu-0".to_string(),
                }],
            })
        );
    }

    #[test]
    fn test_claim_without_namespace_has_no_record() {
        let claim = ResourceClaim::default();
        assert_eq!(claim.to_record(), None);
    }

    #[test]
    fn test_string_booleans_are_accepted() {
        assert_eq!(DeviceAttribute::string("true").as_bool(), Some(true));
        assert_eq!(DeviceAttribute::string("yes").as_bool(), None);
        assert_eq!(DeviceAttribute::boolean(false).as_bool(), Some(false));
    }
}
