//! Core data model of the agent
//!
//! Inventory entries describe RDMA capable physical functions advertised for the node,
//! [`DeviceInfo`] and [`DeviceAllocation`] describe what was provisioned into a pod and
//! are persisted by the tracker.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Function name -> network-config field of the selected inventory entries.
///
/// Ordered so that provisioning walks the functions in a stable order.
pub type MatchResult = BTreeMap<String, String>;

/// Current schema version of persisted [`DeviceAllocation`] records
pub const ALLOCATION_RECORD_VERSION: u32 = 1;

/// Character device of the RDMA connection manager, mounted into every provisioned container
pub const RDMA_CM_DEVICE: &str = "/dev/infiniband/rdma_cm";

/// Operational state of a physical function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[display("up")]
    Up,
    #[display("down")]
    Down,
}

impl LinkState {
    /// Parses the advertised state, anything but "up" counts as down
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("up") {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// One physical network function as advertised for the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInventoryEntry {
    /// Inventory device name
    pub name: String,
    /// Kernel netdev name of the physical function
    pub if_name: String,
    /// PCI address of the physical function
    pub pci_address: String,
    pub state: LinkState,
    pub rdma: bool,
    /// Comma-joined network-config names (`name` or `namespace/name`)
    pub network_configs: String,
    /// Accelerator PCI addresses this function is wired to
    pub affinity: BTreeSet<String>,
}

impl DeviceInventoryEntry {
    /// Whether the entry may be handed out at all
    pub fn is_eligible(&self) -> bool {
        self.state == LinkState::Up
            && self.rdma
            && split_network_configs(&self.network_configs).next().is_some()
    }

    /// Individual network-config names of the comma-joined field
    pub fn network_config_names(&self) -> impl Iterator<Item = &str> {
        split_network_configs(&self.network_configs)
    }
}

/// Splits a comma-joined network-config field, dropping empty items
pub fn split_network_configs(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|name| !name.is_empty())
}

/// Namespace and name of a network-config object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkConfigRef {
    pub namespace: String,
    pub name: String,
}

impl NetworkConfigRef {
    /// Parses `namespace/name`, falling back to `default_namespace` for a bare name
    pub fn parse(value: &str, default_namespace: &str) -> Self {
        match value.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() => Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            Some((_, name)) => Self {
                namespace: default_namespace.to_string(),
                name: name.to_string(),
            },
            None => Self {
                namespace: default_namespace.to_string(),
                name: value.to_string(),
            },
        }
    }

    /// Picks the network config for a pod out of a comma-joined field.
    ///
    /// Bare names resolve into the pod namespace. The first entry living in the pod
    /// namespace wins, otherwise the first entry.
    pub fn select(value: &str, pod_namespace: &str) -> Option<Self> {
        let candidates: Vec<Self> = split_network_configs(value)
            .map(|item| Self::parse(item, pod_namespace))
            .collect();
        candidates
            .iter()
            .find(|candidate| candidate.namespace == pod_namespace)
            .or_else(|| candidates.first())
            .cloned()
    }

    /// `namespace/name` cache key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for NetworkConfigRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a pod as seen by the hook callbacks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// One interface provisioned inside a pod network namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Interface name inside the pod
    pub interface_name: String,
    /// PCI address of the virtual function
    pub pci_address: String,
    /// RDMA device name, empty when the VF has none
    #[serde(default)]
    pub rdma_device: String,
    #[serde(default)]
    pub rdma_char_devices: Vec<String>,
    /// Physical function the VF was taken from
    #[serde(default)]
    pub physical_function: String,
    /// `namespace/name` of the network config used to attach it
    #[serde(default)]
    pub network_config: String,
}

/// Persistence phase of an allocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPhase {
    /// Kernel work started, devices listed so far may be inside the pod
    Pending,
    /// Provisioning finished
    Committed,
}

/// Persistent record of what was provisioned into one pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocation {
    pub version: u32,
    pub phase: AllocationPhase,
    pub pod_uid: String,
    pub pod_namespace: String,
    pub pod_name: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceAllocation {
    /// New pending record without devices
    pub fn pending(pod: &PodRef) -> Self {
        let now = Utc::now();
        Self {
            version: ALLOCATION_RECORD_VERSION,
            phase: AllocationPhase::Pending,
            pod_uid: pod.uid.clone(),
            pod_namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            devices: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase == AllocationPhase::Committed
    }

    pub fn push_device(&mut self, device: DeviceInfo) {
        self.devices.push(device);
        self.updated_at = Utc::now();
    }

    pub fn commit(&mut self) {
        self.phase = AllocationPhase::Committed;
        self.updated_at = Utc::now();
    }
}

/// PCI details of a provisioned interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceInfo {
    #[serde(rename = "pci-address")]
    pub pci_address: String,
    #[serde(rename = "rdma-device", default, skip_serializing_if = "String::is_empty")]
    pub rdma_device: String,
}

/// Device information attached to a network status entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    pub version: String,
    pub pci: PciDeviceInfo,
}

impl NetworkDeviceInfo {
    pub fn pci(pci_address: &str, rdma_device: &str) -> Self {
        Self {
            device_type: "pci".to_string(),
            version: "1.1.0".to_string(),
            pci: PciDeviceInfo {
                pci_address: pci_address.to_string(),
                rdma_device: rdma_device.to_string(),
            },
        }
    }
}

/// Result of attaching one network, in the `network-status` annotation format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway: Vec<String>,
    #[serde(
        rename = "device-info",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_info: Option<NetworkDeviceInfo>,
}

/// Normalizes a PCI address to `dddd:bb:dd.f` in lower case.
///
/// Accepts the 8 digit domain form reported by NVML and addresses without a domain.
pub fn normalize_pci_address(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    let (rest, function) = value.rsplit_once('.')?;
    let parts: Vec<&str> = rest.split(':').collect();
    let (domain, bus, device) = match parts.as_slice() {
        [domain, bus, device] => (*domain, *bus, *device),
        [bus, device] => ("0000", *bus, *device),
        _ => return None,
    };

    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex(domain) || !is_hex(bus) || !is_hex(device) || !is_hex(function) {
        return None;
    }

    let domain = u32::from_str_radix(domain, 16).ok()?;
    let bus = u8::from_str_radix(bus, 16).ok()?;
    let device = u8::from_str_radix(device, 16).ok()?;
    let function = u8::from_str_radix(function, 16).ok()?;
    if domain > 0xffff || device > 0x1f || function > 0x7 {
        return None;
    }

    Some(format!("{domain:04x}:{bus:02x}:{device:02x}.{function:x}"))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn entry(state: LinkState, rdma: bool, configs: &str) -> DeviceInventoryEntry {
        DeviceInventoryEntry {
            name: "pf0".to_string(),
            if_name: "ens1f0".to_string(),
            pci_address: "0000:3b:00.0".to_string(),
            state,
            rdma,
            network_configs: configs.to_string(),
            affinity: BTreeSet::new(),
        }
    }

    #[test]
    fn eligibility_requires_up_rdma_and_config() {
        assert!(entry(LinkState::Up, true, "rdma-net").is_eligible());
        assert!(!entry(LinkState::Down, true, "rdma-net").is_eligible());
        assert!(!entry(LinkState::Up, false, "rdma-net").is_eligible());
        assert!(!entry(LinkState::Up, true, " ").is_eligible());
    }

    #[test]
    fn separator_only_configs_are_not_eligible() {
        assert!(!entry(LinkState::Up, true, " , ").is_eligible());
        assert!(!entry(LinkState::Up, true, ",,").is_eligible());
        assert!(entry(LinkState::Up, true, ", rdma-net").is_eligible());
    }

    #[test]
    fn link_state_parsing_is_lenient() {
        assert_eq!(LinkState::parse("UP"), LinkState::Up);
        assert_eq!(LinkState::parse(" up "), LinkState::Up);
        assert_eq!(LinkState::parse("unknown"), LinkState::Down);
    }

    #[test]
    fn network_config_selection_prefers_pod_namespace() {
        let selected = NetworkConfigRef::select("infra/rdma-a, ml/rdma-b", "ml").unwrap();
        assert_eq!(selected.key(), "ml/rdma-b");

        let selected = NetworkConfigRef::select("infra/rdma-a,rdma-c", "team").unwrap();
        assert_eq!(selected.key(), "team/rdma-c");

        let selected = NetworkConfigRef::select("infra/rdma-a,other/rdma-c", "team").unwrap();
        assert_eq!(selected.key(), "infra/rdma-a");

        let selected = NetworkConfigRef::select("rdma-c", "team").unwrap();
        assert_eq!(selected.key(), "team/rdma-c");

        assert!(NetworkConfigRef::select(" , ", "team").is_none());
    }

    #[test]
    fn pci_addresses_are_normalized() {
        assert_eq!(
            normalize_pci_address("00000000:3B:00.0").as_deref(),
            Some("0000:3b:00.0")
        );
        assert_eq!(
            normalize_pci_address("3b:00.1").as_deref(),
            Some("0000:3b:00.1")
        );
        assert_eq!(
            normalize_pci_address("0000:af:1f.7").as_deref(),
            Some("0000:af:1f.7")
        );
        assert_eq!(normalize_pci_address("GPU-7d8429d5-531d"), None);
        assert_eq!(normalize_pci_address("0000:3b:20.0"), None);
    }

    #[test]
    fn network_status_uses_annotation_field_names() {
        let status = NetworkStatus {
            name: "ml/rdma-net".to_string(),
            interface: "net1".to_string(),
            ips: vec!["192.168.10.4".to_string()],
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            device_info: Some(NetworkDeviceInfo::pci("0000:3b:02.1", "mlx5_7")),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["device-info"]["pci"]["pci-address"], "0000:3b:02.1");
        assert_eq!(json["device-info"]["pci"]["rdma-device"], "mlx5_7");
        assert_eq!(json["default"], false);
        assert!(json.get("gateway").is_none());
    }

    #[test]
    fn allocation_commit_updates_phase() {
        let pod = PodRef {
            uid: "uid-1".to_string(),
            namespace: "ml".to_string(),
            name: "trainer".to_string(),
        };
        let mut allocation = DeviceAllocation::pending(&pod);
        assert!(!allocation.is_committed());
        assert_eq!(allocation.version, ALLOCATION_RECORD_VERSION);

        allocation.commit();
        assert!(allocation.is_committed());
    }
}
