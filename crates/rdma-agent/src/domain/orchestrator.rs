//! Container lifecycle orchestrator
//!
//! Entry point of the runtime hook callbacks. `CreateContainer` provisions the RDMA
//! functions closest to the pod's accelerators on the first call for a pod and replays
//! the recorded devices afterwards; `StopPodSandbox` releases them.
//!
//! All callbacks of one pod are serialized on its UID, callbacks of different pods run
//! concurrently.

use core::error::Error;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api_types::Container;
use api_types::ContainerAdjustment;
use api_types::ContainerUpdate;
use api_types::Mount;
use api_types::PodSandbox;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedLock;

use super::cache::AffinityCache;
use super::ports::AcceleratorSource;
use super::provisioner::NamespaceProvisioner;
use super::provisioner::ProvisionError;
use super::provisioner::ProvisionRequest;
use super::provisioner::ProvisionedDevice;
use super::resolver::resolve;
use super::tracker::Tracker;
use super::types::normalize_pci_address;
use super::types::DeviceAllocation;
use super::types::DeviceInfo;
use super::types::NetworkConfigRef;
use super::types::NetworkStatus;
use super::types::PodRef;
use super::types::RDMA_CM_DEVICE;

/// Hook failures reported back to the container runtime
#[derive(Debug, derive_more::Display)]
pub enum HookError {
    #[display("no free network function for pod {pod}")]
    ResourceExhausted { pod: String },
    #[display("external call failed for pod {pod}")]
    ExternalCall { pod: String },
    #[display("allocation record of pod {pod} could not be persisted")]
    Persistence { pod: String },
    #[display("kernel operation failed for pod {pod}")]
    Kernel { pod: String },
    #[display("pod {pod} left partially provisioned")]
    PartialProvisioning { pod: String },
}

impl Error for HookError {}

impl HookError {
    fn from_provision(error: &ProvisionError, pod: &str) -> Self {
        let pod = pod.to_string();
        match error {
            ProvisionError::NoAvailableVf { .. } => Self::ResourceExhausted { pod },
            ProvisionError::InvalidNetworkConfig { .. }
            | ProvisionError::NetworkConfig { .. }
            | ProvisionError::Backend { .. } => Self::ExternalCall { pod },
            ProvisionError::Discovery { .. }
            | ProvisionError::RdmaMove { .. }
            | ProvisionError::Task => Self::Kernel { pod },
        }
    }
}

/// Container runtime callbacks
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>>;

    /// Returns the changes the runtime applies to the container, empty when the pod
    /// gets no RDMA devices
    async fn create_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<ContainerAdjustment, Report<HookError>>;

    async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>>;

    async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>>;

    async fn synchronize(
        &self,
        pods: &[PodSandbox],
        containers: &[Container],
    ) -> Result<Vec<ContainerUpdate>, Report<HookError>>;

    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Node whose inventory is matched
    pub node_name: String,
    /// Max age of a cached node inventory, zero never expires
    pub inventory_max_age: Duration,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    cache: Arc<AffinityCache>,
    accelerators: Arc<dyn AcceleratorSource>,
    tracker: Arc<dyn Tracker>,
    provisioner: Arc<NamespaceProvisioner>,
    locks: KeyedLock<String>,
}

fn pod_ref(pod: &PodSandbox) -> PodRef {
    PodRef {
        uid: pod.uid.clone(),
        namespace: pod.namespace.clone(),
        name: pod.name.clone(),
    }
}

/// Bind mounts of every recorded RDMA character device, `rdma_cm` once
fn device_mounts(devices: &[DeviceInfo]) -> ContainerAdjustment {
    let mut seen = HashSet::from([RDMA_CM_DEVICE]);
    let mut mounts: Vec<Mount> = devices
        .iter()
        .flat_map(|device| device.rdma_char_devices.iter())
        .filter(|path| seen.insert(path.as_str()))
        .map(|path| Mount::device_bind(path))
        .collect();
    if !devices.is_empty() {
        mounts.push(Mount::device_bind(RDMA_CM_DEVICE));
    }
    ContainerAdjustment {
        mounts,
        ..Default::default()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        cache: Arc<AffinityCache>,
        accelerators: Arc<dyn AcceleratorSource>,
        tracker: Arc<dyn Tracker>,
        provisioner: Arc<NamespaceProvisioner>,
    ) -> Self {
        Self {
            config,
            cache,
            accelerators,
            tracker,
            provisioner,
            locks: KeyedLock::new(),
        }
    }

    /// Network status of a provisioned pod
    pub fn network_status(&self, namespace: &str, name: &str) -> Option<Vec<NetworkStatus>> {
        self.cache
            .get_network_status(&format!("{namespace}/{name}"), Duration::ZERO)
    }

    fn load_record(&self, pod: &PodRef) -> Result<Option<DeviceAllocation>, Report<HookError>> {
        self.tracker
            .get(&pod.uid)
            .map_err(Report::new)
            .change_context(HookError::Persistence { pod: pod.key() })
    }

    fn save_record(&self, allocation: &DeviceAllocation) -> Result<(), Report<HookError>> {
        self.tracker
            .save(allocation)
            .map_err(Report::new)
            .change_context(HookError::Persistence {
                pod: format!("{}/{}", allocation.pod_namespace, allocation.pod_name),
            })
    }

    fn delete_record(&self, pod: &PodRef) -> Result<(), Report<HookError>> {
        self.tracker
            .delete(&pod.uid)
            .map_err(Report::new)
            .change_context(HookError::Persistence { pod: pod.key() })
    }

    /// Releases every recorded device, stopping at the first failure
    async fn release(
        &self,
        pod: &PodRef,
        sandbox_id: &str,
        netns: &Path,
        devices: &[DeviceInfo],
    ) -> Result<(), Report<HookError>> {
        for device in devices.iter().rev() {
            self.provisioner
                .teardown(pod, sandbox_id, netns, device)
                .await
                .map_err(|e| {
                    let context = HookError::from_provision(e.current_context(), &pod.key());
                    e.change_context(context)
                })?;
        }
        Ok(())
    }

    async fn requested_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<BTreeSet<String>, Report<HookError>> {
        let accelerators = self
            .accelerators
            .allocated_accelerators(pod)
            .await
            .change_context(HookError::ExternalCall { pod: pod.key() })?;
        Ok(accelerators
            .into_iter()
            .map(|id| normalize_pci_address(&id).unwrap_or(id))
            .collect())
    }

    /// Undoes completed devices in reverse order.
    ///
    /// The record keeps exactly the devices whose undo failed; without any it is removed.
    async fn abort(
        &self,
        pod: &PodRef,
        mut allocation: DeviceAllocation,
        completed: Vec<ProvisionedDevice>,
        cause: Report<HookError>,
    ) -> Report<HookError> {
        let mut leaked = Vec::new();
        for device in completed.iter().rev() {
            if let Err(e) = self.provisioner.rollback(device).await {
                warn!(
                    pod = %pod.key(),
                    interface = %device.info.interface_name,
                    "rollback failed: {e:?}"
                );
                leaked.push(device.info.clone());
            }
        }

        if leaked.is_empty() {
            if let Err(e) = self.delete_record(pod) {
                warn!(pod = %pod.key(), "failed to delete pending record: {e:?}");
            }
            return cause;
        }

        allocation.devices = leaked;
        if let Err(e) = self.save_record(&allocation) {
            warn!(pod = %pod.key(), "failed to record leaked devices: {e:?}");
        }
        cause.change_context(HookError::PartialProvisioning { pod: pod.key() })
    }

    async fn provision_pod(
        &self,
        pod: &PodRef,
        sandbox_id: &str,
        netns: &Path,
    ) -> Result<Vec<DeviceInfo>, Report<HookError>> {
        let requested = self.requested_accelerators(pod).await?;
        if requested.is_empty() {
            debug!(pod = %pod.key(), "pod has no accelerators");
            return Ok(vec![]);
        }

        let inventory = self
            .cache
            .inventory_or_refresh(&self.config.node_name, self.config.inventory_max_age)
            .await
            .change_context(HookError::ExternalCall { pod: pod.key() })?;
        let selected = resolve(&requested, &inventory);
        if selected.is_empty() {
            info!(
                pod = %pod.key(),
                accelerators = requested.len(),
                "no rdma function wired to the pod accelerators"
            );
            return Ok(vec![]);
        }

        let mut requests = Vec::with_capacity(selected.len());
        for (idx, (name, network_configs)) in selected.iter().enumerate() {
            let entry = inventory
                .iter()
                .find(|entry| &entry.name == name)
                .ok_or_else(|| {
                    Report::new(HookError::ExternalCall { pod: pod.key() })
                        .attach_printable(format!("inventory device {name} vanished during selection"))
                })?;
            let network_config = NetworkConfigRef::select(network_configs, &pod.namespace)
                .ok_or_else(|| {
                    Report::new(HookError::ExternalCall { pod: pod.key() })
                        .attach_printable(format!("inventory device {name} names no network config"))
                })?;
            requests.push(ProvisionRequest {
                pod: pod.clone(),
                sandbox_id: sandbox_id.to_string(),
                netns: netns.to_path_buf(),
                physical_function: entry.if_name.clone(),
                network_config,
                interface_name: format!("net{}", idx + 1),
            });
        }

        let mut allocation = DeviceAllocation::pending(pod);
        self.save_record(&allocation)?;

        let mut completed: Vec<ProvisionedDevice> = Vec::with_capacity(requests.len());
        for request in &requests {
            let name = &request.physical_function;
            let device = match self.provisioner.provision(request).await {
                Ok(device) => device,
                Err(e) => {
                    let context = HookError::from_provision(e.current_context(), &pod.key());
                    let cause = e
                        .change_context(context)
                        .attach_printable(format!("physical function {name}"));
                    return Err(self.abort(pod, allocation, completed, cause).await);
                }
            };

            allocation.push_device(device.info.clone());
            completed.push(device);
            if let Err(e) = self.save_record(&allocation) {
                return Err(self.abort(pod, allocation, completed, e).await);
            }
        }

        allocation.commit();
        if let Err(e) = self.save_record(&allocation) {
            return Err(self.abort(pod, allocation, completed, e).await);
        }

        let statuses = completed.iter().map(|device| device.status.clone()).collect();
        self.cache.set_network_status(&pod.key(), statuses);

        info!(
            target: "audit",
            pod_uid = %pod.uid,
            pod = %pod.key(),
            devices = ?allocation
                .devices
                .iter()
                .map(|device| format!("{}={}({})", device.interface_name, device.pci_address, device.rdma_device))
                .collect::<Vec<_>>(),
            "rdma devices provisioned"
        );
        Ok(allocation.devices)
    }
}

#[async_trait]
impl HookHandler for Orchestrator {
    async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>> {
        debug!(pod = %pod.pod_key(), "run pod sandbox");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(pod = %pod.pod_key(), container = %container.name))]
    async fn create_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<ContainerAdjustment, Report<HookError>> {
        let Some(netns) = pod.network_namespace() else {
            debug!("host network pod, skipping");
            return Ok(ContainerAdjustment::default());
        };
        let netns = Path::new(netns);
        let pod_ref = pod_ref(pod);

        let _guard = self.locks.lock(&pod.uid).await;

        match self.load_record(&pod_ref)? {
            Some(record) if record.is_committed() => {
                debug!(devices = record.devices.len(), "replaying recorded devices");
                return Ok(device_mounts(&record.devices));
            }
            Some(record) => {
                warn!(
                    devices = record.devices.len(),
                    "found interrupted provisioning, releasing recorded devices"
                );
                self.release(&pod_ref, &pod.id, netns, &record.devices)
                    .await?;
                self.delete_record(&pod_ref)?;
            }
            None => {}
        }

        let devices = self.provision_pod(&pod_ref, &pod.id, netns).await?;
        Ok(device_mounts(&devices))
    }

    #[tracing::instrument(skip_all, fields(pod = %pod.pod_key()))]
    async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>> {
        let pod_ref = pod_ref(pod);
        let _guard = self.locks.lock(&pod.uid).await;

        let Some(record) = self.load_record(&pod_ref)? else {
            return Ok(());
        };

        if !record.devices.is_empty() {
            let netns = pod.network_namespace().ok_or_else(|| {
                Report::new(HookError::Kernel { pod: pod_ref.key() })
                    .attach_printable("sandbox carries no network namespace, record kept")
            })?;
            self.release(&pod_ref, &pod.id, Path::new(netns), &record.devices)
                .await?;
        }

        self.delete_record(&pod_ref)?;
        self.cache.remove_network_status(&pod_ref.key());
        info!(
            target: "audit",
            pod_uid = %pod_ref.uid,
            pod = %pod_ref.key(),
            devices = record.devices.len(),
            "rdma devices released"
        );
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), Report<HookError>> {
        debug!(pod = %pod.pod_key(), "remove pod sandbox");
        Ok(())
    }

    async fn synchronize(
        &self,
        pods: &[PodSandbox],
        _containers: &[Container],
    ) -> Result<Vec<ContainerUpdate>, Report<HookError>> {
        let running: HashSet<&str> = pods.iter().map(|pod| pod.uid.as_str()).collect();
        let records = self
            .tracker
            .list()
            .map_err(Report::new)
            .change_context(HookError::Persistence {
                pod: "*".to_string(),
            })?;

        for record in records
            .iter()
            .filter(|record| !running.contains(record.pod_uid.as_str()))
        {
            warn!(
                pod_uid = %record.pod_uid,
                pod = %format!("{}/{}", record.pod_namespace, record.pod_name),
                devices = record.devices.len(),
                "allocation record without running pod"
            );
        }
        info!(pods = pods.len(), records = records.len(), "synchronized");
        Ok(vec![])
    }

    async fn shutdown(&self) {
        info!("runtime requested shutdown");
    }
}
