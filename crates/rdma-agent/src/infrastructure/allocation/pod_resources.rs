//! Device-plugin allocations from the kubelet pod-resources API

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::devices_for_pod;
use super::AllocationError;
use crate::domain::cache::AffinityCache;
use crate::domain::cache::PodDevices;
use crate::domain::cache::PodResourcesSnapshot;
use crate::domain::ports::AcceleratorSource;
use crate::domain::ports::ExternalError;
use crate::domain::types::PodRef;

pub mod v1 {
    tonic::include_proto!("v1");
}

use v1::pod_resources_lister_client::PodResourcesListerClient;
use v1::ListPodResourcesRequest;
use v1::ListPodResourcesResponse;

/// Flattens a listing into per-pod device maps, merging all containers
pub fn snapshot_from_response(response: ListPodResourcesResponse) -> PodResourcesSnapshot {
    let pods = response
        .pod_resources
        .into_iter()
        .map(|pod| {
            let mut devices: HashMap<String, Vec<String>> = HashMap::new();
            for container in pod.containers {
                for device in container.devices {
                    devices
                        .entry(device.resource_name)
                        .or_default()
                        .extend(device.device_ids);
                }
            }
            PodDevices {
                namespace: pod.namespace,
                name: pod.name,
                devices,
            }
        })
        .collect();

    PodResourcesSnapshot { pods }
}

pub struct PodResourcesSource {
    socket_path: PathBuf,
    resource_names: Vec<String>,
    cache: Arc<AffinityCache>,
    snapshot_max_age: Duration,
    request_timeout: Duration,
}

impl PodResourcesSource {
    pub fn new(
        socket_path: PathBuf,
        resource_names: Vec<String>,
        cache: Arc<AffinityCache>,
        snapshot_max_age: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            socket_path,
            resource_names,
            cache,
            snapshot_max_age,
            request_timeout,
        }
    }

    fn cache_key(&self) -> String {
        self.socket_path.display().to_string()
    }

    /// Create a gRPC channel connected to the kubelet unix socket
    async fn create_unix_channel(&self) -> Result<tonic::transport::Channel, io::Error> {
        use hyper_util::rt::TokioIo;
        use tonic::transport::Endpoint;
        use tonic::transport::Uri;
        use tower::service_fn;

        let socket_path = self.socket_path.clone();

        // The authority is ignored, every connection goes to the socket
        Endpoint::try_from("http://[::]:50051")
            .map_err(|e| io::Error::other(e.to_string()))?
            .connect_timeout(self.request_timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    tokio::net::UnixStream::connect(socket_path)
                        .await
                        .map(TokioIo::new)
                }
            }))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    #[tracing::instrument(skip(self), fields(socket = %self.socket_path.display()))]
    async fn list(&self) -> Result<PodResourcesSnapshot, Report<AllocationError>> {
        let socket = self.cache_key();
        let error = || AllocationError::PodResources {
            socket: socket.clone(),
        };

        let channel = self.create_unix_channel().await.change_context_lazy(error)?;
        let mut client = PodResourcesListerClient::new(channel);

        let response = tokio::time::timeout(
            self.request_timeout,
            client.list(tonic::Request::new(ListPodResourcesRequest {})),
        )
        .await
        .change_context_lazy(error)?
        .change_context_lazy(error)?;

        let snapshot = snapshot_from_response(response.into_inner());
        debug!(pods = snapshot.pods.len(), "listed pod resources");
        Ok(snapshot)
    }

    async fn snapshot(&self) -> Result<Arc<PodResourcesSnapshot>, Report<AllocationError>> {
        let key = self.cache_key();
        if let Some(snapshot) = self.cache.get_pod_resources(&key, self.snapshot_max_age) {
            return Ok(snapshot);
        }

        let snapshot = self.list().await?;
        self.cache.set_pod_resources(&key, snapshot);
        self.cache
            .get_pod_resources(&key, Duration::ZERO)
            .ok_or_else(|| Report::new(AllocationError::PodResources { socket: key }))
    }
}

#[async_trait]
impl AcceleratorSource for PodResourcesSource {
    async fn allocated_accelerators(
        &self,
        pod: &PodRef,
    ) -> Result<Vec<String>, Report<ExternalError>> {
        let snapshot = self
            .snapshot()
            .await
            .change_context_lazy(|| ExternalError::Allocation { pod: pod.key() })?;

        let devices = snapshot
            .pods
            .iter()
            .find(|entry| entry.namespace == pod.namespace && entry.name == pod.name)
            .map(|entry| devices_for_pod(&entry.devices, &self.resource_names))
            .unwrap_or_default();
        Ok(devices)
    }
}
