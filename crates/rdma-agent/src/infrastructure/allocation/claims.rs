//! Accelerators allocated through dynamic resource claims

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use tracing::debug;
use tracing::warn;

use super::AllocationError;
use crate::domain::cache::AffinityCache;
use crate::domain::cache::ClaimRecord;
use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::types::PodRef;
use crate::infrastructure::k8s::inventory::with_deadline;
use crate::infrastructure::k8s::resources::DeviceAttribute;
use crate::infrastructure::k8s::resources::ResourceSlice;

pub const PCI_BUS_ID_ATTRIBUTE: &str = "pciBusID";

/// PCI bus ids of the `driver` devices allocated to `claims`, in claim order.
///
/// Devices are looked up by pool and name in `slices`; devices without a
/// bus id attribute are skipped.
pub fn accelerators_from_claims(
    claims: &[ClaimRecord],
    driver: &str,
    slices: &[ResourceSlice],
) -> Vec<String> {
    let mut accelerators: Vec<String> = Vec::new();
    for device in claims
        .iter()
        .flat_map(|claim| claim.devices.iter())
        .filter(|device| device.driver == driver)
    {
        let bus_id = slices
            .iter()
            .filter(|slice| slice.spec.driver == driver && slice.spec.pool.name == device.pool)
            .flat_map(|slice| slice.spec.devices.iter())
            .find(|published| published.name == device.device)
            .and_then(|published| published.basic.as_ref())
            .and_then(|basic| basic.attribute(PCI_BUS_ID_ATTRIBUTE))
            .and_then(DeviceAttribute::as_str);

        match bus_id {
            Some(bus_id) if !accelerators.iter().any(|known| known == bus_id) => {
                accelerators.push(bus_id.to_string())
            }
            Some(_) => {}
            None => warn!(
                pool = %device.pool,
                device = %device.device,
                "claimed accelerator has no PCI bus id"
            ),
        }
    }
    accelerators
}

pub struct ClaimSource {
    client: Client,
    cache: Arc<AffinityCache>,
    driver: String,
    node_name: String,
    request_timeout: Duration,
}

impl ClaimSource {
    pub fn new(
        client: Client,
        cache: Arc<AffinityCache>,
        driver: String,
        node_name: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            driver,
            node_name,
            request_timeout,
        }
    }

    fn claims_of(&self, pod: &PodRef) -> Vec<ClaimRecord> {
        let claims = self.cache.claims_for_pod_uid(&pod.uid);
        if !claims.is_empty() {
            return claims;
        }
        self.cache.claims_for_pod_name(&pod.key())
    }

    async fn list_slices(&self) -> Result<Vec<ResourceSlice>, Report<AllocationError>> {
        let api: Api<ResourceSlice> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={},spec.driver={}",
            self.node_name, self.driver
        ));

        let slices = with_deadline("resourceslices", self.request_timeout, api.list(&params))
            .await
            .change_context_lazy(|| AllocationError::Claims {
                driver: self.driver.clone(),
            })?;
        Ok(slices.items)
    }
}

#[async_trait]
impl AcceleratorSource for ClaimSource {
    #[tracing::instrument(skip(self), fields(pod = %pod.key(), driver = %self.driver))]
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        let claims = self.claims_of(pod);
        if !claims
            .iter()
            .flat_map(|claim| claim.devices.iter())
            .any(|device| device.driver == self.driver)
        {
            return Ok(Vec::new());
        }

        let slices = self
            .list_slices()
            .await
            .change_context_lazy(|| ExternalError::Allocation { pod: pod.key() })?;
        let accelerators = accelerators_from_claims(&claims, &self.driver, &slices);
        debug!(
            claims = claims.len(),
            accelerators = accelerators.len(),
            "resolved claimed accelerators"
        );
        Ok(accelerators)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::cache::ClaimConsumer;
    use crate::domain::cache::ClaimDevice;

    const DRIVER: &str = "gpu.example.com";

    fn claim(devices: &[(&str, &str, &str)]) -> ClaimRecord {
        ClaimRecord {
            namespace: "ml".to_string(),
            name: "trainer-gpus".to_string(),
            reserved_for: vec![ClaimConsumer {
                uid: "uid-1".to_string(),
                name: "trainer".to_string(),
            }],
            devices: devices
                .iter()
                .map(|(driver, pool, device)| ClaimDevice {
                    driver: driver.to_string(),
                    pool: pool.to_string(),
                    device: device.to_string(),
                })
                .collect(),
        }
    }

    fn gpu_slice() -> ResourceSlice {
        serde_json::from_value(json!({
            "metadata": {"name": "node-a-gpu"},
            "spec": {
                "driver": DRIVER,
                "nodeName": "node-a",
                "pool": {"name": "node-a"},
                "devices": [
                    {"name": "gpu-0", "basic": {"attributes": {"gpu.example.com/pciBusID": {"string": "0000:1a:00.0"}}}},
                    {"name": "gpu-1", "basic": {"attributes": {"pciBusID": {"string": "0000:1b:00.0"}}}},
                    {"name": "gpu-2", "basic": {"attributes": {}}}
                ]
            }
        }))
        .expect("should parse resource slice")
    }

    #[test]
    fn test_claimed_devices_map_to_bus_ids() {
        let claims = vec![claim(&[
            (DRIVER, "node-a", "gpu-1"),
            (DRIVER, "node-a", "gpu-0"),
            ("rdma.example.com", "node-a", "pf-0"),
        ])];

        let accelerators = accelerators_from_claims(&claims, DRIVER, &[gpu_slice()]);
        assert_eq!(
            accelerators,
            vec!["0000:1b:00.0".to_string(), "0000:1a:00.0".to_string()]
        );
    }

    #[test]
    fn test_unknown_devices_and_duplicates_are_skipped() {
        let claims = vec![
            claim(&[(DRIVER, "node-a", "gpu-0"), (DRIVER, "node-a", "gpu-2")]),
            claim(&[(DRIVER, "node-a", "gpu-0"), (DRIVER, "node-b", "gpu-1")]),
        ];

        let accelerators = accelerators_from_claims(&claims, DRIVER, &[gpu_slice()]);
        assert_eq!(accelerators, vec!["0000:1a:00.0".to_string()]);
    }
}
