//! Maps accelerator identifiers to PCI addresses

use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use nvml_wrapper::Nvml;
use tracing::warn;

use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::types::normalize_pci_address;
use crate::domain::types::PodRef;

/// Resolves accelerator UUIDs to PCI bus ids
pub trait BusIdLookup: Send + Sync {
    fn bus_id(&self, uuid: &str) -> Option<String>;
}

impl BusIdLookup for Nvml {
    fn bus_id(&self, uuid: &str) -> Option<String> {
        match self.device_by_uuid(uuid).and_then(|device| device.pci_info()) {
            Ok(info) => Some(info.bus_id),
            Err(e) => {
                warn!(uuid, "NVML lookup failed: {e}");
                None
            }
        }
    }
}

/// Wraps a source so it reports normalized PCI addresses.
///
/// Identifiers that are neither a PCI address nor a known UUID are passed
/// through unchanged.
pub struct AcceleratorIdNormalizer {
    inner: Arc<dyn AcceleratorSource>,
    lookup: Option<Arc<dyn BusIdLookup>>,
}

impl AcceleratorIdNormalizer {
    pub fn new(inner: Arc<dyn AcceleratorSource>, lookup: Option<Arc<dyn BusIdLookup>>) -> Self {
        Self { inner, lookup }
    }

    fn normalize(&self, id: String) -> String {
        if let Some(pci) = normalize_pci_address(&id) {
            return pci;
        }
        self.lookup
            .as_ref()
            .and_then(|lookup| lookup.bus_id(&id))
            .and_then(|bus_id| normalize_pci_address(&bus_id))
            .unwrap_or(id)
    }
}

#[async_trait]
impl AcceleratorSource for AcceleratorIdNormalizer {
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        let ids = self.inner.allocated_accelerators(pod).await?;
        let mut normalized: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = self.normalize(id);
            if !normalized.contains(&id) {
                normalized.push(id);
            }
        }
        Ok(normalized)
    }
}
