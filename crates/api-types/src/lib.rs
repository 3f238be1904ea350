//! Shared API type definitions
//!
//! This crate contains the wire types of the container-runtime hook protocol used
//! between the node agent and the runtime-side shim: pod sandboxes, containers and
//! the adjustments returned for them, plus the response envelopes of the agent's
//! HTTP surface.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Linux namespace type carrying the pod network namespace
pub const NETWORK_NAMESPACE: &str = "network";

/// A Linux namespace reference of a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxNamespace {
    /// Namespace type, e.g. "network", "ipc", "uts"
    #[serde(rename = "type")]
    pub ns_type: String,
    /// Path of the namespace file, empty for the host namespace
    #[serde(default)]
    pub path: String,
}

/// Linux specific sandbox information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxPodSandbox {
    #[serde(default)]
    pub namespaces: Vec<LinuxNamespace>,
    #[serde(default)]
    pub cgroup_parent: String,
}

/// Pod sandbox as announced by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandbox {
    /// Runtime sandbox id
    pub id: String,
    /// Pod name
    pub name: String,
    /// Pod UID
    pub uid: String,
    /// Pod namespace
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub linux: Option<LinuxPodSandbox>,
}

impl PodSandbox {
    /// Path of the sandbox network namespace.
    ///
    /// `None` means the sandbox shares the host network namespace.
    pub fn network_namespace(&self) -> Option<&str> {
        self.linux
            .as_ref()?
            .namespaces
            .iter()
            .find(|ns| ns.ns_type == NETWORK_NAMESPACE)
            .map(|ns| ns.path.as_str())
            .filter(|path| !path.is_empty())
    }

    /// Whether the sandbox runs in the host network namespace
    pub fn is_host_network(&self) -> bool {
        self.network_namespace().is_none()
    }

    /// `namespace/name` key of the pod
    pub fn pod_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Container as announced by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub pod_sandbox_id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A mount added to a container
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Read-write bind mount of a host device node at the same path
    pub fn device_bind(path: &str) -> Self {
        Self {
            destination: path.to_string(),
            mount_type: "bind".to_string(),
            source: path.to_string(),
            options: vec!["rbind".to_string(), "rw".to_string()],
        }
    }
}

/// Changes requested for a container being created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAdjustment {
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ContainerAdjustment {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.annotations.is_empty()
    }
}

/// Update of an already existing container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container_id: String,
    #[serde(default)]
    pub ignore_failure: bool,
}

/// Request body of the `create-container` hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub pod: PodSandbox,
    pub container: Container,
}

/// Response body of the `create-container` hook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContainerResponse {
    pub adjust: ContainerAdjustment,
    #[serde(default)]
    pub update: Vec<ContainerUpdate>,
}

/// Request body of the pod sandbox hooks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandboxRequest {
    pub pod: PodSandbox,
}

/// Request body of the `synchronize` hook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynchronizeRequest {
    #[serde(default)]
    pub pods: Vec<PodSandbox>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Response body of the `synchronize` hook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizeResponse {
    #[serde(default)]
    pub update: Vec<ContainerUpdate>,
}

/// Generic response envelope of the agent HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> HookResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_with_netns(path: &str) -> PodSandbox {
        PodSandbox {
            id: "sandbox-1".to_string(),
            name: "trainer-0".to_string(),
            uid: "7e1c1a4e-0000-4000-8000-000000000001".to_string(),
            namespace: "ml".to_string(),
            linux: Some(LinuxPodSandbox {
                namespaces: vec![
                    LinuxNamespace {
                        ns_type: "ipc".to_string(),
                        path: "/proc/1/ns/ipc".to_string(),
                    },
                    LinuxNamespace {
                        ns_type: NETWORK_NAMESPACE.to_string(),
                        path: path.to_string(),
                    },
                ],
                cgroup_parent: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn network_namespace_is_resolved() {
        let pod = sandbox_with_netns("/var/run/netns/cni-1234");
        assert_eq!(pod.network_namespace(), Some("/var/run/netns/cni-1234"));
        assert!(!pod.is_host_network());
        assert_eq!(pod.pod_key(), "ml/trainer-0");
    }

    #[test]
    fn empty_network_path_means_host_network() {
        let pod = sandbox_with_netns("");
        assert!(pod.is_host_network());

        let pod = PodSandbox::default();
        assert!(pod.is_host_network());
    }

    #[test]
    fn sandbox_deserializes_runtime_payload() {
        let payload = r#"{
            "id": "abc",
            "name": "p",
            "uid": "u",
            "namespace": "default",
            "linux": {"namespaces": [{"type": "network", "path": "/var/run/netns/x"}]}
        }"#;
        let pod: PodSandbox = serde_json::from_str(payload).expect("valid sandbox");
        assert_eq!(pod.network_namespace(), Some("/var/run/netns/x"));
        assert!(pod.labels.is_empty());
    }

    #[test]
    fn device_bind_mount_uses_same_path() {
        let mount = Mount::device_bind("/dev/infiniband/uverbs3");
        assert_eq!(mount.source, mount.destination);
        assert_eq!(mount.mount_type, "bind");
        assert_eq!(mount.options, vec!["rbind", "rw"]);
    }
}
