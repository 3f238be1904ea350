//! Interfaces of the external collaborators the agent queries

use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;

use super::types::DeviceInventoryEntry;
use super::types::PodRef;

/// Failures of external collaborators, always surfaced to the hook caller
#[derive(Debug, derive_more::Display)]
pub enum ExternalError {
    #[display("device inventory query failed for node {node}")]
    Inventory { node: String },
    #[display("network config {key} unavailable")]
    NetworkConfig { key: String },
    #[display("accelerator allocation query failed for pod {pod}")]
    Allocation { pod: String },
}

impl Error for ExternalError {}

/// Cluster API view of the node's RDMA inventory and network configs
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Lists the inventory advertised for exactly one node by the network driver
    async fn list_device_inventory(
        &self,
        node: &str,
    ) -> Result<Vec<DeviceInventoryEntry>, Report<ExternalError>>;

    /// Returns the raw network-config template body
    async fn get_network_config_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, Report<ExternalError>>;
}

/// Resource accounting view of the accelerators allocated to a pod
#[async_trait]
pub trait AcceleratorSource: Send + Sync {
    /// Accelerator identifiers allocated to the pod, empty when it has none
    async fn allocated_accelerators(&self, pod: &PodRef)
        -> Result<Vec<String>, Report<ExternalError>>;
}
