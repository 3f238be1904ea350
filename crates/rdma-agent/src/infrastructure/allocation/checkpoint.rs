//! Device-plugin allocations from the kubelet device manager checkpoint

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use super::devices_for_pod;
use super::AllocationError;
use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::types::PodRef;

pub const DEFAULT_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

/// Kubelet device state structure matching the JSON format
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KubeletDeviceState {
    pub data: DeviceStateData,
    pub checksum: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceStateData {
    pub pod_device_entries: Option<Vec<PodDeviceEntry>>,
    // resource name -> registered device ids
    #[serde(default)]
    pub registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodDeviceEntry {
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    pub container_name: String,
    pub resource_name: String,

    // key is the NUMA node, "-1" when unknown
    #[serde(rename = "DeviceIDs")]
    pub device_ids: HashMap<String, Vec<String>>,

    #[serde(rename = "AllocResp", default)]
    pub alloc_resp: String,
}

impl KubeletDeviceState {
    /// resource name -> device ids allocated to `pod_uid`, across all containers
    pub fn devices_of(&self, pod_uid: &str) -> HashMap<String, Vec<String>> {
        let mut devices: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.data.pod_device_entries.iter().flatten() {
            if entry.pod_uid != pod_uid {
                continue;
            }
            // NUMA keys are unordered, sort them for stable output
            let mut numa_nodes: Vec<_> = entry.device_ids.iter().collect();
            numa_nodes.sort_by(|a, b| a.0.cmp(b.0));
            let ids = devices.entry(entry.resource_name.clone()).or_default();
            for (_, device_ids) in numa_nodes {
                ids.extend(device_ids.iter().cloned());
            }
        }
        devices
    }
}

pub struct CheckpointSource {
    path: PathBuf,
    resource_names: Vec<String>,
}

impl CheckpointSource {
    pub fn new(path: PathBuf, resource_names: Vec<String>) -> Self {
        Self {
            path,
            resource_names,
        }
    }

    async fn read_device_state_file(&self) -> Result<KubeletDeviceState, Report<AllocationError>> {
        let content = fs::read_to_string(&self.path).await.change_context_lazy(|| {
            AllocationError::Checkpoint {
                path: self.path.clone(),
            }
        })?;

        serde_json::from_str(&content).change_context_lazy(|| AllocationError::Checkpoint {
            path: self.path.clone(),
        })
    }
}

#[async_trait]
impl AcceleratorSource for CheckpointSource {
    #[tracing::instrument(skip(self), fields(pod = %pod.key(), path = %self.path.display()))]
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        let state = self
            .read_device_state_file()
            .await
            .change_context_lazy(|| ExternalError::Allocation { pod: pod.key() })?;

        let devices = devices_for_pod(&state.devices_of(&pod.uid), &self.resource_names);
        debug!(devices = devices.len(), "read allocation from checkpoint");
        Ok(devices)
    }
}
