//! Namespace provisioner
//!
//! Moves one RDMA capable virtual function into a pod network namespace:
//!
//! 1. pick the first free VF of the physical function
//! 2. look up the RDMA device bound to the VF
//! 3. move the RDMA device into the pod namespace
//! 4. attach the VF netdev through the secondary network backend
//!
//! Kernel work sits behind [`DeviceDiscovery`] and [`RdmaNamespace`], both called on
//! blocking threads. A failed attempt undoes its own completed steps before the error
//! is returned; [`NamespaceProvisioner::rollback`] undoes a successful one.

pub mod netconf;

use core::error::Error;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use self::netconf::render_network_config;
use self::netconf::CniResult;
use super::cache::AffinityCache;
use super::types::DeviceInfo;
use super::types::NetworkConfigRef;
use super::types::NetworkStatus;
use super::types::PodRef;

/// RDMA devices that stay in the root namespace
const PINNED_RDMA_DEVICES: [&str; 2] = ["rdma_cm", "lo"];

#[derive(Debug, derive_more::Display)]
pub enum ProvisionError {
    #[display("no available virtual function on {pf}")]
    NoAvailableVf { pf: String },
    #[display("device discovery failed for {device}")]
    Discovery { device: String },
    #[display("failed to move rdma device {device} {direction}")]
    RdmaMove {
        device: String,
        direction: MoveDirection,
    },
    #[display("network config {config} is invalid")]
    InvalidNetworkConfig { config: String },
    #[display("network config {config} unavailable")]
    NetworkConfig { config: String },
    #[display("network backend {operation} failed for interface {interface}")]
    Backend {
        operation: BackendOperation,
        interface: String,
    },
    #[display("blocking task aborted")]
    Task,
}

impl Error for ProvisionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MoveDirection {
    #[display("into pod namespace")]
    IntoPod,
    #[display("back to root namespace")]
    BackToRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BackendOperation {
    #[display("add")]
    Add,
    #[display("del")]
    Del,
}

/// A virtual function of a physical function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    /// `virtfnN` index
    pub index: u32,
    pub pci_address: String,
    /// Netdev name in the host namespace
    pub netdev: String,
}

/// RDMA device bound to a PCI function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaDevice {
    pub name: String,
    /// Character device paths under `/dev/infiniband`
    pub char_devices: Vec<String>,
}

/// Host view of SR-IOV functions and their RDMA devices
pub trait DeviceDiscovery: Send + Sync {
    /// VFs of `pf` whose netdev is still in the host namespace, in `virtfn` order
    fn available_vfs(&self, pf: &str) -> Result<Vec<VirtualFunction>, Report<ProvisionError>>;

    /// RDMA device of a PCI function, `None` when it has none
    fn rdma_device_for_pci(
        &self,
        pci_address: &str,
    ) -> Result<Option<RdmaDevice>, Report<ProvisionError>>;
}

/// Moves RDMA devices between network namespaces
pub trait RdmaNamespace: Send + Sync {
    /// Moves `device` from the root namespace into `netns`
    fn move_into(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>>;

    /// Moves `device`, found inside `netns`, back to the root namespace
    fn move_back(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>>;
}

/// Per-attempt runtime context handed to the network backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: PathBuf,
    pub if_name: String,
    pub pod: PodRef,
}

impl RuntimeConf {
    /// `CNI_ARGS` value carrying the pod identity
    pub fn cni_args(&self) -> String {
        format!(
            "IgnoreUnknown=true;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={};K8S_POD_UID={}",
            self.pod.namespace, self.pod.name, self.container_id, self.pod.uid
        )
    }
}

/// Secondary network backend
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn add(
        &self,
        config: &Value,
        runtime: &RuntimeConf,
    ) -> Result<CniResult, Report<ProvisionError>>;

    async fn del(&self, config: &Value, runtime: &RuntimeConf) -> Result<(), Report<ProvisionError>>;
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Max age of cached network-config bodies and rendered configs, zero never expires
    pub config_max_age: Duration,
    /// Run the backend "del" operation when a pod is torn down
    pub cni_del_on_teardown: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            config_max_age: Duration::from_secs(300),
            cni_del_on_teardown: false,
        }
    }
}

/// One device to provision
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub pod: PodRef,
    pub sandbox_id: String,
    pub netns: PathBuf,
    /// Host netdev of the physical function
    pub physical_function: String,
    pub network_config: NetworkConfigRef,
    /// Interface name inside the pod
    pub interface_name: String,
}

/// Completed provisioning attempt, enough to undo it
#[derive(Debug, Clone)]
pub struct ProvisionedDevice {
    pub info: DeviceInfo,
    pub status: NetworkStatus,
    config: Value,
    runtime: RuntimeConf,
    rdma_moved: bool,
}

/// Reservation of a VF while its attempt is running
struct VfReservation<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    vf: VirtualFunction,
}

impl Drop for VfReservation<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.vf.pci_address);
    }
}

async fn blocking<T, F>(f: F) -> Result<T, Report<ProvisionError>>
where
    F: FnOnce() -> Result<T, Report<ProvisionError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Report::new(ProvisionError::Task).attach_printable(e.to_string()))?
}

pub struct NamespaceProvisioner {
    discovery: Arc<dyn DeviceDiscovery>,
    rdma: Arc<dyn RdmaNamespace>,
    backend: Arc<dyn NetworkBackend>,
    cache: Arc<AffinityCache>,
    config: ProvisionerConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl NamespaceProvisioner {
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        rdma: Arc<dyn RdmaNamespace>,
        backend: Arc<dyn NetworkBackend>,
        cache: Arc<AffinityCache>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            discovery,
            rdma,
            backend,
            cache,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Provisions one VF of `request.physical_function` into the pod namespace.
    #[tracing::instrument(skip_all, fields(
        pod = %request.pod.key(),
        pf = %request.physical_function,
        interface = %request.interface_name,
    ))]
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionedDevice, Report<ProvisionError>> {
        let discovery = self.discovery.clone();
        let pf = request.physical_function.clone();
        let candidates = blocking(move || discovery.available_vfs(&pf)).await?;
        let reservation = self.reserve(&request.physical_function, candidates)?;
        let vf = reservation.vf.clone();
        debug!(vf = %vf.pci_address, netdev = %vf.netdev, "virtual function selected");

        let discovery = self.discovery.clone();
        let pci_address = vf.pci_address.clone();
        let rdma_device = blocking(move || discovery.rdma_device_for_pci(&pci_address)).await?;

        let rdma_moved = match &rdma_device {
            Some(device) => {
                self.move_rdma(&device.name, &request.netns, MoveDirection::IntoPod)
                    .await?;
                true
            }
            None => {
                warn!(vf = %vf.pci_address, "virtual function has no rdma device");
                false
            }
        };

        let (rdma_name, char_devices) = rdma_device
            .map(|device| (device.name, device.char_devices))
            .unwrap_or_default();

        let attached = self.attach(request, &vf, &rdma_name).await;
        let (config, runtime, status) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                if rdma_moved {
                    if let Err(undo) = self
                        .move_rdma(&rdma_name, &request.netns, MoveDirection::BackToRoot)
                        .await
                    {
                        warn!(device = %rdma_name, "failed to undo rdma move: {undo:?}");
                    }
                }
                return Err(e);
            }
        };

        info!(
            vf = %vf.pci_address,
            rdma_device = %rdma_name,
            "virtual function provisioned"
        );

        Ok(ProvisionedDevice {
            info: DeviceInfo {
                interface_name: request.interface_name.clone(),
                pci_address: vf.pci_address,
                rdma_device: rdma_name,
                rdma_char_devices: char_devices,
                physical_function: request.physical_function.clone(),
                network_config: request.network_config.key(),
            },
            status,
            config,
            runtime,
            rdma_moved,
        })
    }

    /// Undoes a completed attempt: backend "del", then the RDMA move.
    ///
    /// Both steps are attempted; the first failure is returned.
    #[tracing::instrument(skip_all, fields(interface = %device.info.interface_name))]
    pub async fn rollback(&self, device: &ProvisionedDevice) -> Result<(), Report<ProvisionError>> {
        let detached = self.backend.del(&device.config, &device.runtime).await;
        if let Err(e) = &detached {
            warn!("backend del failed during rollback: {e:?}");
        }

        let moved_back = if device.rdma_moved {
            self.move_rdma(
                &device.info.rdma_device,
                &device.runtime.netns,
                MoveDirection::BackToRoot,
            )
            .await
        } else {
            Ok(())
        };

        detached.and(moved_back)
    }

    /// Releases a recorded device of a pod being torn down.
    #[tracing::instrument(skip_all, fields(pod = %pod.key(), interface = %device.interface_name))]
    pub async fn teardown(
        &self,
        pod: &PodRef,
        sandbox_id: &str,
        netns: &Path,
        device: &DeviceInfo,
    ) -> Result<(), Report<ProvisionError>> {
        if self.config.cni_del_on_teardown && !device.network_config.is_empty() {
            let config_ref = NetworkConfigRef::parse(&device.network_config, &pod.namespace);
            let config = self
                .network_config(&config_ref, &device.pci_address)
                .await?;
            let runtime = RuntimeConf {
                container_id: sandbox_id.to_string(),
                netns: netns.to_path_buf(),
                if_name: device.interface_name.clone(),
                pod: pod.clone(),
            };
            self.backend.del(&config, &runtime).await?;
        }

        if !Self::is_movable(device) {
            debug!(rdma_device = %device.rdma_device, "rdma device stays in place");
            return Ok(());
        }
        self.move_rdma(&device.rdma_device, netns, MoveDirection::BackToRoot)
            .await
    }

    fn is_movable(device: &DeviceInfo) -> bool {
        !device.rdma_device.is_empty()
            && !PINNED_RDMA_DEVICES.contains(&device.rdma_device.as_str())
            && device.interface_name != "lo"
    }

    fn reserve(
        &self,
        pf: &str,
        candidates: Vec<VirtualFunction>,
    ) -> Result<VfReservation<'_>, Report<ProvisionError>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let vf = candidates
            .into_iter()
            .find(|vf| !in_flight.contains(&vf.pci_address))
            .ok_or_else(|| Report::new(ProvisionError::NoAvailableVf { pf: pf.to_string() }))?;
        in_flight.insert(vf.pci_address.clone());
        Ok(VfReservation {
            in_flight: &self.in_flight,
            vf,
        })
    }

    async fn move_rdma(
        &self,
        device: &str,
        netns: &Path,
        direction: MoveDirection,
    ) -> Result<(), Report<ProvisionError>> {
        let rdma = self.rdma.clone();
        let name = device.to_string();
        let path = netns.to_path_buf();
        blocking(move || match direction {
            MoveDirection::IntoPod => rdma.move_into(&name, &path),
            MoveDirection::BackToRoot => rdma.move_back(&name, &path),
        })
        .await?;
        debug!(device, netns = %netns.display(), %direction, "rdma device moved");
        Ok(())
    }

    async fn attach(
        &self,
        request: &ProvisionRequest,
        vf: &VirtualFunction,
        rdma_device: &str,
    ) -> Result<(Value, RuntimeConf, NetworkStatus), Report<ProvisionError>> {
        let config = self
            .network_config(&request.network_config, &vf.pci_address)
            .await?;
        let runtime = RuntimeConf {
            container_id: request.sandbox_id.clone(),
            netns: request.netns.clone(),
            if_name: request.interface_name.clone(),
            pod: request.pod.clone(),
        };

        let result = self.backend.add(&config, &runtime).await?;
        let status = result.to_network_status(
            &request.network_config.key(),
            &request.interface_name,
            &vf.pci_address,
            rdma_device,
        );
        Ok((config, runtime, status))
    }

    /// Rendered network config of a VF, cached per `namespace/name@deviceID`
    async fn network_config(
        &self,
        config_ref: &NetworkConfigRef,
        device_id: &str,
    ) -> Result<Value, Report<ProvisionError>> {
        let key = format!("{}@{device_id}", config_ref.key());
        if let Some(config) = self.cache.get_rendered_config(&key, self.config.config_max_age) {
            return Ok(config);
        }

        let template = self
            .cache
            .config_body_or_fetch(config_ref, self.config.config_max_age)
            .await
            .change_context(ProvisionError::NetworkConfig {
                config: config_ref.key(),
            })?;
        let config = render_network_config(&template, device_id, config_ref)?;
        self.cache.set_rendered_config(&key, config.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::FakeDiscovery;
    use crate::testing::FakeInventoryApi;
    use crate::testing::FakeNetworkBackend;
    use crate::testing::FakeRdmaNamespace;
    use crate::testing::RdmaMove;

    struct Fixture {
        discovery: Arc<FakeDiscovery>,
        rdma: Arc<FakeRdmaNamespace>,
        backend: Arc<FakeNetworkBackend>,
        api: Arc<FakeInventoryApi>,
        provisioner: NamespaceProvisioner,
    }

    fn fixture(config: ProvisionerConfig) -> Fixture {
        let discovery = Arc::new(FakeDiscovery::default());
        discovery.add_vf("ens1f0", "0000:3b:02.0", "ens1f0v0", Some("mlx5_2"));
        discovery.add_vf("ens1f0", "0000:3b:02.1", "ens1f0v1", Some("mlx5_3"));
        let rdma = Arc::new(FakeRdmaNamespace::default());
        let backend = Arc::new(FakeNetworkBackend::default());
        let api = Arc::new(FakeInventoryApi::default());
        api.set_config("ml", "rdma-net", r#"{"type": "sriov"}"#);
        let cache = Arc::new(AffinityCache::new(api.clone()));

        let provisioner = NamespaceProvisioner::new(
            discovery.clone(),
            rdma.clone(),
            backend.clone(),
            cache,
            config,
        );
        Fixture {
            discovery,
            rdma,
            backend,
            api,
            provisioner,
        }
    }

    fn request(interface: &str) -> ProvisionRequest {
        ProvisionRequest {
            pod: PodRef {
                uid: "uid-1".to_string(),
                namespace: "ml".to_string(),
                name: "trainer".to_string(),
            },
            sandbox_id: "sandbox-1".to_string(),
            netns: PathBuf::from("/var/run/netns/cni-1"),
            physical_function: "ens1f0".to_string(),
            network_config: NetworkConfigRef::parse("ml/rdma-net", "ml"),
            interface_name: interface.to_string(),
        }
    }

    #[tokio::test]
    async fn provision_moves_rdma_then_attaches() {
        let f = fixture(ProvisionerConfig::default());
        let device = f.provisioner.provision(&request("net1")).await.unwrap();

        assert_eq!(
            device.info,
            DeviceInfo {
                interface_name: "net1".to_string(),
                pci_address: "0000:3b:02.0".to_string(),
                rdma_device: "mlx5_2".to_string(),
                rdma_char_devices: vec!["/dev/infiniband/uverbs2".to_string()],
                physical_function: "ens1f0".to_string(),
                network_config: "ml/rdma-net".to_string(),
            }
        );
        assert_eq!(
            f.rdma.moves(),
            vec![RdmaMove::inbound("mlx5_2", "/var/run/netns/cni-1")]
        );

        let added = f.backend.added();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0["deviceID"], "0000:3b:02.0");
        assert_eq!(added[0].1.if_name, "net1");
        assert_eq!(device.status.name, "ml/rdma-net");
        assert_eq!(
            device.status.device_info.unwrap().pci.rdma_device,
            "mlx5_2".to_string()
        );
    }

    #[tokio::test]
    async fn exhausted_physical_function_is_reported() {
        let f = fixture(ProvisionerConfig::default());
        let mut req = request("net1");
        req.physical_function = "ens2f0".to_string();

        let err = f.provisioner.provision(&req).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::NoAvailableVf { .. }
        ));
        assert!(f.rdma.moves().is_empty());
    }

    #[tokio::test]
    async fn in_flight_functions_are_skipped() {
        let f = fixture(ProvisionerConfig::default());
        let candidates = f.discovery.available_vfs("ens1f0").unwrap();
        let _held = f.provisioner.reserve("ens1f0", candidates).unwrap();

        let device = f.provisioner.provision(&request("net1")).await.unwrap();
        assert_eq!(device.info.pci_address, "0000:3b:02.1");
    }

    #[tokio::test]
    async fn reservation_is_released_after_attempt() {
        let f = fixture(ProvisionerConfig::default());
        f.provisioner.provision(&request("net1")).await.unwrap();
        assert!(f.provisioner.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn function_without_rdma_device_is_attached_without_move() {
        let f = fixture(ProvisionerConfig::default());
        f.discovery.clear("ens1f0");
        f.discovery.add_vf("ens1f0", "0000:3b:02.4", "ens1f0v4", None);

        let device = f.provisioner.provision(&request("net1")).await.unwrap();
        assert_eq!(device.info.rdma_device, "");
        assert!(device.info.rdma_char_devices.is_empty());
        assert!(f.rdma.moves().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_undoes_rdma_move() {
        let f = fixture(ProvisionerConfig::default());
        f.backend.fail_add_on(1);

        let err = f.provisioner.provision(&request("net1")).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::Backend {
                operation: BackendOperation::Add,
                ..
            }
        ));
        assert_eq!(
            f.rdma.moves(),
            vec![
                RdmaMove::inbound("mlx5_2", "/var/run/netns/cni-1"),
                RdmaMove::outbound("mlx5_2", "/var/run/netns/cni-1"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_network_config_fails_before_backend() {
        let f = fixture(ProvisionerConfig::default());
        let mut req = request("net1");
        req.network_config = NetworkConfigRef::parse("ml/absent", "ml");

        let err = f.provisioner.provision(&req).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::NetworkConfig { .. }
        ));
        assert!(f.backend.added().is_empty());
        assert_eq!(f.rdma.moves().len(), 2);
    }

    #[tokio::test]
    async fn rendered_configs_are_cached_per_device() {
        let f = fixture(ProvisionerConfig::default());
        let req = request("net1");

        f.provisioner.network_config(&req.network_config, "0000:3b:02.0").await.unwrap();
        f.provisioner.network_config(&req.network_config, "0000:3b:02.0").await.unwrap();
        f.provisioner.network_config(&req.network_config, "0000:3b:02.1").await.unwrap();

        assert_eq!(f.api.config_calls(), 1);
    }

    #[tokio::test]
    async fn rollback_detaches_then_moves_back() {
        let f = fixture(ProvisionerConfig::default());
        let device = f.provisioner.provision(&request("net1")).await.unwrap();

        f.provisioner.rollback(&device).await.unwrap();
        assert_eq!(f.backend.deleted().len(), 1);
        assert_eq!(
            f.rdma.moves().last(),
            Some(&RdmaMove::outbound("mlx5_2", "/var/run/netns/cni-1"))
        );
    }

    #[tokio::test]
    async fn teardown_only_reverses_move_by_default() {
        let f = fixture(ProvisionerConfig::default());
        let device = f.provisioner.provision(&request("net1")).await.unwrap();
        let req = request("net1");

        f.provisioner
            .teardown(&req.pod, &req.sandbox_id, &req.netns, &device.info)
            .await
            .unwrap();
        assert!(f.backend.deleted().is_empty());
        assert_eq!(
            f.rdma.moves().last(),
            Some(&RdmaMove::outbound("mlx5_2", "/var/run/netns/cni-1"))
        );
    }

    #[tokio::test]
    async fn teardown_runs_backend_del_when_enabled() {
        let f = fixture(ProvisionerConfig {
            cni_del_on_teardown: true,
            ..Default::default()
        });
        let device = f.provisioner.provision(&request("net1")).await.unwrap();
        let req = request("net1");

        f.provisioner
            .teardown(&req.pod, &req.sandbox_id, &req.netns, &device.info)
            .await
            .unwrap();
        let deleted = f.backend.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0["deviceID"], "0000:3b:02.0");
    }

    #[tokio::test]
    async fn pinned_devices_are_never_moved() {
        let f = fixture(ProvisionerConfig::default());
        let req = request("net1");
        let pinned = ["", "rdma_cm", "lo"].map(|rdma_device| DeviceInfo {
            interface_name: "net1".to_string(),
            pci_address: "0000:3b:02.0".to_string(),
            rdma_device: rdma_device.to_string(),
            rdma_char_devices: vec![],
            physical_function: "ens1f0".to_string(),
            network_config: "ml/rdma-net".to_string(),
        });

        for device in &pinned {
            f.provisioner
                .teardown(&req.pod, &req.sandbox_id, &req.netns, device)
                .await
                .unwrap();
        }
        assert!(f.rdma.moves().is_empty());
    }

    #[tokio::test]
    async fn teardown_surfaces_move_failures() {
        let f = fixture(ProvisionerConfig::default());
        let device = f.provisioner.provision(&request("net1")).await.unwrap();
        f.rdma.fail_move_back("mlx5_2");
        let req = request("net1");

        let err = f
            .provisioner
            .teardown(&req.pod, &req.sandbox_id, &req.netns, &device.info)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::RdmaMove {
                direction: MoveDirection::BackToRoot,
                ..
            }
        ));
    }

    #[test]
    fn cni_args_carry_pod_identity() {
        let req = request("net1");
        let runtime = RuntimeConf {
            container_id: req.sandbox_id,
            netns: req.netns,
            if_name: req.interface_name,
            pod: req.pod,
        };
        assert_eq!(
            runtime.cni_args(),
            "IgnoreUnknown=true;K8S_POD_NAMESPACE=ml;K8S_POD_NAME=trainer;K8S_POD_INFRA_CONTAINER_ID=sandbox-1;K8S_POD_UID=uid-1"
        );
    }
}
