//! Accelerator allocation sources
//!
//! The kubelet reports device-plugin allocations through its pod-resources socket
//! and, as a fallback, through the device manager checkpoint. Accelerators
//! allocated with resource claims are read from the claim index instead.

use core::error::Error;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tracing::warn;

use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::types::PodRef;

pub mod checkpoint;
pub mod claims;
pub mod normalizer;
pub mod pod_resources;

pub use checkpoint::CheckpointSource;
pub use claims::ClaimSource;
pub use normalizer::AcceleratorIdNormalizer;
pub use pod_resources::PodResourcesSource;

#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("kubelet pod-resources API at {socket} unavailable")]
    PodResources { socket: String },
    #[display("kubelet checkpoint {} unreadable", path.display())]
    Checkpoint { path: PathBuf },
    #[display("resource slices of driver {driver} unavailable")]
    Claims { driver: String },
}

impl Error for AllocationError {}

/// Where accelerator allocations are read from
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub pod_resources_socket: PathBuf,
    pub checkpoint_path: PathBuf,
    /// Device-plugin resource names that count as accelerators, all when empty
    pub resource_names: Vec<String>,
    pub snapshot_max_age: Duration,
    pub request_timeout: Duration,
    /// Driver of accelerators allocated through resource claims
    pub claim_driver: Option<String>,
    pub nvml: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            pod_resources_socket: PathBuf::from("/var/lib/kubelet/pod-resources/kubelet.sock"),
            checkpoint_path: PathBuf::from(checkpoint::DEFAULT_CHECKPOINT_PATH),
            resource_names: vec!["nvidia.com/gpu".to_string()],
            snapshot_max_age: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            claim_driver: None,
            nvml: false,
        }
    }
}

/// Device ids of the wanted resources in `resource_names` order, without duplicates
pub fn devices_for_pod(
    devices: &HashMap<String, Vec<String>>,
    resource_names: &[String],
) -> Vec<String> {
    let mut names: Vec<&String> = if resource_names.is_empty() {
        devices.keys().collect()
    } else {
        resource_names.iter().collect()
    };
    if resource_names.is_empty() {
        names.sort();
    }

    let mut ids: Vec<String> = Vec::new();
    for id in names
        .into_iter()
        .filter_map(|name| devices.get(name))
        .flatten()
    {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

/// Asks `primary` first and `fallback` only when `primary` fails
pub struct FallbackSource {
    primary: Arc<dyn AcceleratorSource>,
    fallback: Arc<dyn AcceleratorSource>,
}

impl FallbackSource {
    pub fn new(primary: Arc<dyn AcceleratorSource>, fallback: Arc<dyn AcceleratorSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl AcceleratorSource for FallbackSource {
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        match self.primary.allocated_accelerators(pod).await {
            Ok(ids) => Ok(ids),
            Err(e) => {
                warn!(pod = %pod.key(), "primary allocation source failed, using fallback: {e:?}");
                self.fallback.allocated_accelerators(pod).await
            }
        }
    }
}

/// Union of several sources, any failure fails the query
pub struct CombinedSource {
    sources: Vec<Arc<dyn AcceleratorSource>>,
}

impl CombinedSource {
    pub fn new(sources: Vec<Arc<dyn AcceleratorSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl AcceleratorSource for CombinedSource {
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        let mut ids: Vec<String> = Vec::new();
        for source in &self.sources {
            for id in source.allocated_accelerators(pod).await? {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
