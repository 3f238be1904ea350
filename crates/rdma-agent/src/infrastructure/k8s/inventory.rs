//! Device inventory and network configs from the cluster API

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use tracing::debug;

use super::resources::BasicDevice;
use super::resources::DeviceAttribute;
use super::resources::NetworkAttachmentDefinition;
use super::resources::ResourceSlice;
use super::KubernetesError;
use crate::domain::ports::ExternalError;
use crate::domain::ports::InventoryApi;
use crate::domain::types::normalize_pci_address;
use crate::domain::types::split_network_configs;
use crate::domain::types::DeviceInventoryEntry;
use crate::domain::types::LinkState;

/// Device attributes published by the network driver
pub mod attributes {
    pub const IF_NAME: &str = "ifName";
    pub const PCI_ADDRESS: &str = "pciAddress";
    pub const STATE: &str = "state";
    pub const RDMA: &str = "rdma";
    pub const NETWORK_CONFIGS: &str = "networkConfigs";
    pub const GPU_AFFINITY: &str = "gpuAffinity";
}

/// Runs an API request under `timeout`
pub(crate) async fn with_deadline<T, F>(
    resource: &str,
    timeout: Duration,
    request: F,
) -> Result<T, Report<KubernetesError>>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| {
            Report::new(KubernetesError::Timeout {
                resource: resource.to_string(),
            })
        })?
        .map_err(|e| {
            Report::new(KubernetesError::RequestFailed {
                resource: resource.to_string(),
                message: e.to_string(),
            })
        })
}

fn string_attribute<'a>(device: &'a BasicDevice, name: &str) -> Option<&'a str> {
    device.attribute(name).and_then(DeviceAttribute::as_str)
}

/// Inventory entries of `node` published by `driver`, in listing order
pub fn inventory_from_slices(
    slices: &[ResourceSlice],
    driver: &str,
    node: &str,
) -> Vec<DeviceInventoryEntry> {
    slices
        .iter()
        .filter(|slice| slice.spec.driver == driver)
        .filter(|slice| slice.spec.node_name.as_deref() == Some(node))
        .flat_map(|slice| slice.spec.devices.iter())
        .map(|device| {
            let basic = device.basic.clone().unwrap_or_default();
            let if_name = string_attribute(&basic, attributes::IF_NAME)
                .unwrap_or(&device.name)
                .to_string();
            let pci_address = string_attribute(&basic, attributes::PCI_ADDRESS)
                .map(|pci| normalize_pci_address(pci).unwrap_or_else(|| pci.to_string()))
                .unwrap_or_default();
            let state = string_attribute(&basic, attributes::STATE)
                .map(LinkState::parse)
                .unwrap_or(LinkState::Down);
            let rdma = basic
                .attribute(attributes::RDMA)
                .and_then(DeviceAttribute::as_bool)
                .unwrap_or(false);
            let network_configs = string_attribute(&basic, attributes::NETWORK_CONFIGS)
                .unwrap_or_default()
                .to_string();
            let affinity = string_attribute(&basic, attributes::GPU_AFFINITY)
                .map(|value| {
                    split_network_configs(value)
                        .map(|id| normalize_pci_address(id).unwrap_or_else(|| id.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            DeviceInventoryEntry {
                name: device.name.clone(),
                if_name,
                pci_address,
                state,
                rdma,
                network_configs,
                affinity,
            }
        })
        .collect()
}

pub struct KubeInventoryApi {
    client: Client,
    driver: String,
    request_timeout: Duration,
}

impl KubeInventoryApi {
    pub fn new(client: Client, driver: String, request_timeout: Duration) -> Self {
        Self {
            client,
            driver,
            request_timeout,
        }
    }
}

#[async_trait]
impl InventoryApi for KubeInventoryApi {
    #[tracing::instrument(skip(self), fields(driver = %self.driver))]
    async fn list_device_inventory(
        &self,
        node: &str,
    ) -> Result<Vec<DeviceInventoryEntry>, Report<ExternalError>> {
        let api: Api<ResourceSlice> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={node},spec.driver={}",
            self.driver
        ));

        let slices = with_deadline("resourceslices", self.request_timeout, api.list(&params))
            .await
            .change_context(ExternalError::Inventory {
                node: node.to_string(),
            })?;

        let inventory = inventory_from_slices(&slices.items, &self.driver, node);
        debug!(
            slices = slices.items.len(),
            devices = inventory.len(),
            "listed device inventory"
        );
        Ok(inventory)
    }

    #[tracing::instrument(skip(self))]
    async fn get_network_config_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, Report<ExternalError>> {
        let key = format!("{namespace}/{name}");
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), namespace);

        let definition = with_deadline(
            "network-attachment-definitions",
            self.request_timeout,
            api.get(name),
        )
        .await
        .change_context(ExternalError::NetworkConfig { key: key.clone() })?;

        if definition.spec.config.trim().is_empty() {
            return Err(Report::new(KubernetesError::InvalidObject {
                resource: "network-attachment-definitions".to_string(),
                message: format!("{key} has an empty config"),
            })
            .change_context(ExternalError::NetworkConfig { key }));
        }
        Ok(definition.spec.config)
    }
}
