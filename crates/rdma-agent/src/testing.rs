//! In-memory collaborators for unit and integration tests

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use api_types::LinuxNamespace;
use api_types::LinuxPodSandbox;
use api_types::PodSandbox;
use async_trait::async_trait;
use error_stack::Report;
use serde_json::json;
use serde_json::Value;

use crate::domain::cache::AffinityCache;
use crate::domain::orchestrator::Orchestrator;
use crate::domain::orchestrator::OrchestratorConfig;
use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::ports::InventoryApi;
use crate::domain::provisioner::netconf::CniResult;
use crate::domain::provisioner::BackendOperation;
use crate::domain::provisioner::DeviceDiscovery;
use crate::domain::provisioner::MoveDirection;
use crate::domain::provisioner::NamespaceProvisioner;
use crate::domain::provisioner::NetworkBackend;
use crate::domain::provisioner::ProvisionError;
use crate::domain::provisioner::ProvisionerConfig;
use crate::domain::provisioner::RdmaDevice;
use crate::domain::provisioner::RdmaNamespace;
use crate::domain::provisioner::RuntimeConf;
use crate::domain::provisioner::VirtualFunction;
use crate::domain::tracker::Tracker;
use crate::domain::tracker::TrackerError;
use crate::domain::types::DeviceAllocation;
use crate::domain::types::DeviceInventoryEntry;
use crate::domain::types::LinkState;
use crate::domain::types::PodRef;

/// Eligible inventory entry wired to `affinity`
pub fn inventory_entry(name: &str, affinity: &[&str], network_configs: &str) -> DeviceInventoryEntry {
    DeviceInventoryEntry {
        name: name.to_string(),
        if_name: name.to_string(),
        pci_address: String::new(),
        state: LinkState::Up,
        rdma: true,
        network_configs: network_configs.to_string(),
        affinity: affinity.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct FakeInventoryApi {
    inventories: Mutex<HashMap<String, Vec<DeviceInventoryEntry>>>,
    configs: Mutex<HashMap<String, String>>,
    inventory_calls: Mutex<HashMap<String, usize>>,
    config_calls: AtomicUsize,
    fail_inventory: AtomicBool,
}

impl FakeInventoryApi {
    pub fn set_inventory(&self, node: &str, inventory: Vec<DeviceInventoryEntry>) {
        self.inventories
            .lock()
            .unwrap()
            .insert(node.to_string(), inventory);
    }

    pub fn set_config(&self, namespace: &str, name: &str, body: &str) {
        self.configs
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), body.to_string());
    }

    pub fn fail_inventory(&self, fail: bool) {
        self.fail_inventory.store(fail, Ordering::SeqCst);
    }

    pub fn inventory_calls(&self, node: &str) -> usize {
        self.inventory_calls
            .lock()
            .unwrap()
            .get(node)
            .copied()
            .unwrap_or_default()
    }

    pub fn config_calls(&self) -> usize {
        self.config_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InventoryApi for FakeInventoryApi {
    async fn list_device_inventory(
        &self,
        node: &str,
    ) -> Result<Vec<DeviceInventoryEntry>, Report<ExternalError>> {
        *self
            .inventory_calls
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default() += 1;
        if self.fail_inventory.load(Ordering::SeqCst) {
            return Err(Report::new(ExternalError::Inventory {
                node: node.to_string(),
            }));
        }
        Ok(self
            .inventories
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_network_config_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, Report<ExternalError>> {
        self.config_calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{namespace}/{name}");
        self.configs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Report::new(ExternalError::NetworkConfig { key }))
    }
}

#[derive(Default)]
pub struct FakeAcceleratorSource {
    allocations: Mutex<HashMap<String, Vec<String>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeAcceleratorSource {
    pub fn set(&self, pod_uid: &str, accelerators: &[&str]) {
        self.allocations.lock().unwrap().insert(
            pod_uid.to_string(),
            accelerators.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcceleratorSource for FakeAcceleratorSource {
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Report::new(ExternalError::Allocation { pod: pod.key() }));
        }
        Ok(self
            .allocations
            .lock()
            .unwrap()
            .get(&pod.uid)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    vfs: Mutex<BTreeMap<String, Vec<VirtualFunction>>>,
    rdma: Mutex<HashMap<String, RdmaDevice>>,
}

impl FakeDiscovery {
    /// Adds a VF; its RDMA device gets a `uverbsN` node numbered after the device suffix
    pub fn add_vf(&self, pf: &str, pci_address: &str, netdev: &str, rdma_device: Option<&str>) {
        let mut vfs = self.vfs.lock().unwrap();
        let list = vfs.entry(pf.to_string()).or_default();
        list.push(VirtualFunction {
            index: list.len() as u32,
            pci_address: pci_address.to_string(),
            netdev: netdev.to_string(),
        });

        if let Some(name) = rdma_device {
            let suffix = name.rsplit('_').next().unwrap_or("0");
            self.rdma.lock().unwrap().insert(
                pci_address.to_string(),
                RdmaDevice {
                    name: name.to_string(),
                    char_devices: vec![format!("/dev/infiniband/uverbs{suffix}")],
                },
            );
        }
    }

    pub fn clear(&self, pf: &str) {
        self.vfs.lock().unwrap().remove(pf);
    }
}

impl DeviceDiscovery for FakeDiscovery {
    fn available_vfs(&self, pf: &str) -> Result<Vec<VirtualFunction>, Report<ProvisionError>> {
        Ok(self.vfs.lock().unwrap().get(pf).cloned().unwrap_or_default())
    }

    fn rdma_device_for_pci(
        &self,
        pci_address: &str,
    ) -> Result<Option<RdmaDevice>, Report<ProvisionError>> {
        Ok(self.rdma.lock().unwrap().get(pci_address).cloned())
    }
}

/// One successful RDMA namespace move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaMove {
    pub direction: MoveDirection,
    pub device: String,
    pub netns: PathBuf,
}

impl RdmaMove {
    pub fn inbound(device: &str, netns: &str) -> Self {
        Self {
            direction: MoveDirection::IntoPod,
            device: device.to_string(),
            netns: PathBuf::from(netns),
        }
    }

    pub fn outbound(device: &str, netns: &str) -> Self {
        Self {
            direction: MoveDirection::BackToRoot,
            device: device.to_string(),
            netns: PathBuf::from(netns),
        }
    }
}

#[derive(Default)]
pub struct FakeRdmaNamespace {
    moves: Mutex<Vec<RdmaMove>>,
    failing: Mutex<HashSet<(String, bool)>>,
}

impl FakeRdmaNamespace {
    pub fn moves(&self) -> Vec<RdmaMove> {
        self.moves.lock().unwrap().clone()
    }

    pub fn fail_move_into(&self, device: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((device.to_string(), true));
    }

    pub fn fail_move_back(&self, device: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((device.to_string(), false));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn record(
        &self,
        direction: MoveDirection,
        device: &str,
        netns: &Path,
    ) -> Result<(), Report<ProvisionError>> {
        let into = direction == MoveDirection::IntoPod;
        if self
            .failing
            .lock()
            .unwrap()
            .contains(&(device.to_string(), into))
        {
            return Err(Report::new(ProvisionError::RdmaMove {
                device: device.to_string(),
                direction,
            }));
        }
        self.moves.lock().unwrap().push(RdmaMove {
            direction,
            device: device.to_string(),
            netns: netns.to_path_buf(),
        });
        Ok(())
    }
}

impl RdmaNamespace for FakeRdmaNamespace {
    fn move_into(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>> {
        self.record(MoveDirection::IntoPod, device, netns)
    }

    fn move_back(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>> {
        self.record(MoveDirection::BackToRoot, device, netns)
    }
}

/// Backend answering "add" with one sandboxed interface and an address per call
#[derive(Default)]
pub struct FakeNetworkBackend {
    added: Mutex<Vec<(Value, RuntimeConf)>>,
    deleted: Mutex<Vec<(Value, RuntimeConf)>>,
    add_calls: AtomicUsize,
    fail_add_on: Mutex<Option<usize>>,
    fail_del: AtomicBool,
}

impl FakeNetworkBackend {
    /// Fails the `call`-th "add", counting from one
    pub fn fail_add_on(&self, call: usize) {
        *self.fail_add_on.lock().unwrap() = Some(call);
    }

    pub fn fail_del(&self, fail: bool) {
        self.fail_del.store(fail, Ordering::SeqCst);
    }

    pub fn added(&self) -> Vec<(Value, RuntimeConf)> {
        self.added.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<(Value, RuntimeConf)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkBackend for FakeNetworkBackend {
    async fn add(
        &self,
        config: &Value,
        runtime: &RuntimeConf,
    ) -> Result<CniResult, Report<ProvisionError>> {
        let call = self.add_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_add_on.lock().unwrap() == Some(call) {
            return Err(Report::new(ProvisionError::Backend {
                operation: BackendOperation::Add,
                interface: runtime.if_name.clone(),
            }));
        }
        self.added
            .lock()
            .unwrap()
            .push((config.clone(), runtime.clone()));

        let result = json!({
            "cniVersion": "1.0.0",
            "interfaces": [{
                "name": runtime.if_name,
                "mac": format!("02:00:00:00:00:{call:02x}"),
                "sandbox": runtime.netns.display().to_string(),
            }],
            "ips": [{
                "address": format!("192.168.100.{call}/24"),
                "gateway": "192.168.100.254",
                "interface": 0,
            }],
        });
        Ok(serde_json::from_value(result).expect("valid cni result"))
    }

    async fn del(&self, config: &Value, runtime: &RuntimeConf) -> Result<(), Report<ProvisionError>> {
        if self.fail_del.load(Ordering::SeqCst) {
            return Err(Report::new(ProvisionError::Backend {
                operation: BackendOperation::Del,
                interface: runtime.if_name.clone(),
            }));
        }
        self.deleted
            .lock()
            .unwrap()
            .push((config.clone(), runtime.clone()));
        Ok(())
    }
}

/// Tracker keeping records in memory, with switchable write failures
#[derive(Default)]
pub struct MemoryTracker {
    records: Mutex<BTreeMap<String, DeviceAllocation>>,
    saves: AtomicUsize,
    fail_commit: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryTracker {
    /// Rejects saving committed records
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Stores a record as is, bypassing failure switches
    pub fn insert(&self, allocation: DeviceAllocation) {
        self.records
            .lock()
            .unwrap()
            .insert(allocation.pod_uid.clone(), allocation);
    }

    fn storage_error(pod_uid: &str) -> TrackerError {
        TrackerError::Io {
            path: PathBuf::from(format!("memory/{pod_uid}.json")),
            source: std::io::Error::other("injected failure"),
        }
    }
}

impl Tracker for MemoryTracker {
    fn save(&self, allocation: &DeviceAllocation) -> Result<(), TrackerError> {
        if allocation.is_committed() && self.fail_commit.load(Ordering::SeqCst) {
            return Err(Self::storage_error(&allocation.pod_uid));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(allocation.clone());
        Ok(())
    }

    fn get(&self, pod_uid: &str) -> Result<Option<DeviceAllocation>, TrackerError> {
        Ok(self.records.lock().unwrap().get(pod_uid).cloned())
    }

    fn delete(&self, pod_uid: &str) -> Result<(), TrackerError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::storage_error(pod_uid));
        }
        self.records.lock().unwrap().remove(pod_uid);
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeviceAllocation>, TrackerError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

/// Pod sandbox in its own network namespace at `netns`
pub fn sandbox(uid: &str, namespace: &str, name: &str, netns: &str) -> PodSandbox {
    PodSandbox {
        id: format!("sandbox-{uid}"),
        name: name.to_string(),
        uid: uid.to_string(),
        namespace: namespace.to_string(),
        linux: Some(LinuxPodSandbox {
            namespaces: vec![LinuxNamespace {
                ns_type: "network".to_string(),
                path: netns.to_string(),
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Orchestrator wired to fakes for node `node-a`.
///
/// Physical functions `pf-a` and `pf-b` sit next to accelerators `0000:1a:00.0` and
/// `0000:1b:00.0`, each with one RDMA capable VF and a network config in `ml`.
pub struct TestAgent {
    pub api: Arc<FakeInventoryApi>,
    pub accelerators: Arc<FakeAcceleratorSource>,
    pub discovery: Arc<FakeDiscovery>,
    pub rdma: Arc<FakeRdmaNamespace>,
    pub backend: Arc<FakeNetworkBackend>,
    pub tracker: Arc<MemoryTracker>,
    pub cache: Arc<AffinityCache>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl TestAgent {
    pub fn new() -> Self {
        let api = Arc::new(FakeInventoryApi::default());
        api.set_inventory(
            "node-a",
            vec![
                inventory_entry("pf-a", &["0000:1a:00.0"], "ml/rdma-a"),
                inventory_entry("pf-b", &["0000:1b:00.0"], "ml/rdma-b"),
            ],
        );
        api.set_config("ml", "rdma-a", r#"{"cniVersion": "1.0.0", "name": "rdma-a", "type": "sriov"}"#);
        api.set_config("ml", "rdma-b", r#"{"cniVersion": "1.0.0", "name": "rdma-b", "type": "sriov"}"#);

        let discovery = Arc::new(FakeDiscovery::default());
        discovery.add_vf("pf-a", "0000:1a:02.0", "pf-av0", Some("mlx5_10"));
        discovery.add_vf("pf-b", "0000:1b:02.0", "pf-bv0", Some("mlx5_20"));

        let accelerators = Arc::new(FakeAcceleratorSource::default());
        let rdma = Arc::new(FakeRdmaNamespace::default());
        let backend = Arc::new(FakeNetworkBackend::default());
        let tracker = Arc::new(MemoryTracker::default());
        let cache = Arc::new(AffinityCache::new(api.clone()));
        let provisioner = Arc::new(NamespaceProvisioner::new(
            discovery.clone(),
            rdma.clone(),
            backend.clone(),
            cache.clone(),
            ProvisionerConfig::default(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                node_name: "node-a".to_string(),
                inventory_max_age: Duration::from_secs(60),
            },
            cache.clone(),
            accelerators.clone(),
            tracker.clone(),
            provisioner,
        ));

        Self {
            api,
            accelerators,
            discovery,
            rdma,
            backend,
            tracker,
            cache,
            orchestrator,
        }
    }
}
