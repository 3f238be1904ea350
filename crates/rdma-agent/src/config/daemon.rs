use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on, used to select its RDMA inventory"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "RDMA_AGENT_STATE_DIR",
        default_value = "/var/lib/rdma-agent/allocations",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding one allocation record per provisioned pod"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        env = "CNI_PATH",
        value_delimiter = ':',
        default_value = crate::infrastructure::cni::DEFAULT_CNI_BIN_DIR,
        help = "Directories searched for CNI plugin binaries, colon separated"
    )]
    pub cni_bin_dirs: Vec<PathBuf>,

    #[arg(
        long,
        default_value = "30",
        help = "Timeout in seconds of a single CNI plugin invocation"
    )]
    pub cni_timeout_secs: u64,

    #[arg(
        long,
        help = "Run CNI DEL for every device when a pod sandbox stops",
        default_value_t = false,
        env = "CNI_DEL_ON_TEARDOWN",
        action = clap::ArgAction::Set
    )]
    pub cni_del_on_teardown: bool,

    #[arg(
        long,
        help = "Kubelet pod-resources socket used to find the accelerators of a pod",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_socket_path: PathBuf,

    #[arg(
        long,
        help = "Kubelet device manager checkpoint, read when the pod-resources socket fails",
        default_value = crate::infrastructure::allocation::checkpoint::DEFAULT_CHECKPOINT_PATH,
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_device_state_path: PathBuf,

    #[arg(
        long,
        env = "ACCELERATOR_RESOURCE_NAMES",
        value_delimiter = ',',
        default_value = "nvidia.com/gpu",
        help = "Device-plugin resource names counted as accelerators, comma separated"
    )]
    pub accelerator_resource_names: Vec<String>,

    #[arg(
        long,
        env = "ACCELERATOR_CLAIM_DRIVER",
        help = "Driver of accelerators allocated through resource claims, e.g. gpu.nvidia.com"
    )]
    pub accelerator_claim_driver: Option<String>,

    #[arg(
        long,
        env = "RDMA_NETWORK_DRIVER",
        default_value = "rdma.network.k8s.io",
        help = "Driver name of the resource slices publishing the node's RDMA inventory"
    )]
    pub network_driver: String,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds a cached node inventory stays valid, 0 keeps it until refreshed"
    )]
    pub inventory_ttl_secs: u64,

    #[arg(
        long,
        default_value = "300",
        help = "Seconds cached network configs stay valid, 0 keeps them until refreshed"
    )]
    pub network_config_ttl_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Interval in seconds of the background inventory refresh"
    )]
    pub inventory_refresh_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Timeout in seconds of kubelet and API server reads"
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "127.0.0.1:8090",
        help = "Hook API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "RDMA_AGENT_AUDIT_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Daily rotated log of provisioning events, e.g. /logs/rdma-audit.log"
    )]
    pub audit_log_file: Option<PathBuf>,

    #[arg(
        long,
        help = "Map accelerator UUIDs to PCI addresses with NVML",
        default_value_t = true,
        env = "ENABLE_NVML",
        action = clap::ArgAction::Set
    )]
    pub enable_nvml: bool,

    #[arg(
        long,
        default_value = crate::infrastructure::sysfs::DEFAULT_SYSFS_ROOT,
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the sysfs tree scanned for virtual functions"
    )]
    pub sysfs_root: PathBuf,
}

impl DaemonArgs {
    pub fn cni_timeout(&self) -> Duration {
        Duration::from_secs(self.cni_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inventory_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_refresh_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use crate::config::Cli;
    use crate::config::Commands;

    #[test]
    fn test_daemon_defaults() {
        let cli = Cli::try_parse_from(["rdma-agent", "daemon", "--node-name", "node-a"])
            .expect("should parse");
        let Commands::Daemon(args) = cli.command;

        assert_eq!(args.node_name, "node-a");
        assert_eq!(args.accelerator_resource_names, vec!["nvidia.com/gpu"]);
        assert!(!args.cni_del_on_teardown);
        assert_eq!(args.cni_timeout().as_secs(), 30);
    }

    #[test]
    fn test_lists_are_split() {
        let cli = Cli::try_parse_from([
            "rdma-agent",
            "daemon",
            "--node-name",
            "node-a",
            "--cni-bin-dirs",
            "/opt/cni/bin:/usr/libexec/cni",
            "--accelerator-resource-names",
            "nvidia.com/gpu,amd.com/gpu",
            "--cni-del-on-teardown",
            "true",
        ])
        .expect("should parse");
        let Commands::Daemon(args) = cli.command;

        assert_eq!(args.cni_bin_dirs.len(), 2);
        assert_eq!(args.accelerator_resource_names[1], "amd.com/gpu");
        assert!(args.cni_del_on_teardown);
    }
}
