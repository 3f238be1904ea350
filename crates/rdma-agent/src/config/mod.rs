pub mod cli;
pub mod daemon;

use std::time::Duration;

use crate::domain::orchestrator::OrchestratorConfig;
use crate::domain::provisioner::ProvisionerConfig;
use crate::infrastructure::allocation::AllocationConfig;

impl From<&daemon::DaemonArgs> for ProvisionerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            config_max_age: Duration::from_secs(args.network_config_ttl_secs),
            cni_del_on_teardown: args.cni_del_on_teardown,
        }
    }
}

impl From<&daemon::DaemonArgs> for OrchestratorConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            inventory_max_age: Duration::from_secs(args.inventory_ttl_secs),
        }
    }
}

impl From<&daemon::DaemonArgs> for AllocationConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            pod_resources_socket: args.kubelet_socket_path.clone(),
            checkpoint_path: args.kubelet_device_state_path.clone(),
            resource_names: args.accelerator_resource_names.clone(),
            request_timeout: args.request_timeout(),
            claim_driver: args.accelerator_claim_driver.clone(),
            nvml: args.enable_nvml,
            ..Default::default()
        }
    }
}

pub use cli::*;
pub use daemon::*;
