//! Hook flows through the file tracker and real CNI plugin binaries

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use api_types::Container;
use api_types::PodSandbox;
use rdma_agent::domain::cache::AffinityCache;
use rdma_agent::domain::orchestrator::HookError;
use rdma_agent::domain::orchestrator::HookHandler;
use rdma_agent::domain::orchestrator::Orchestrator;
use rdma_agent::domain::orchestrator::OrchestratorConfig;
use rdma_agent::domain::provisioner::NamespaceProvisioner;
use rdma_agent::domain::provisioner::ProvisionerConfig;
use rdma_agent::domain::tracker::FileTracker;
use rdma_agent::domain::tracker::Tracker;
use rdma_agent::domain::types::AllocationPhase;
use rdma_agent::infrastructure::CniExecutor;
use rdma_agent::testing::inventory_entry;
use rdma_agent::testing::sandbox;
use rdma_agent::testing::FakeAcceleratorSource;
use rdma_agent::testing::FakeDiscovery;
use rdma_agent::testing::FakeInventoryApi;
use rdma_agent::testing::FakeRdmaNamespace;
use rdma_agent::testing::RdmaMove;
use similar_asserts::assert_eq;
use tempfile::TempDir;

const NETNS: &str = "/var/run/netns/cni-e2e";

const SRIOV_PLUGIN: &str = r#"#!/bin/sh
echo "$CNI_COMMAND $CNI_IFNAME" >> "$(dirname "$0")/calls.log"
if [ "$CNI_COMMAND" = "ADD" ]; then
  echo '{"cniVersion":"1.0.0","interfaces":[{"name":"net1","mac":"02:00:00:00:00:0a","sandbox":"/var/run/netns/cni-e2e"}],"ips":[{"address":"10.20.0.7/24","interface":0}]}'
fi
exit 0
"#;

const FAILING_PLUGIN: &str = r#"#!/bin/sh
echo "$CNI_COMMAND $CNI_IFNAME" >> "$(dirname "$0")/calls.log"
if [ "$CNI_COMMAND" = "ADD" ]; then
  echo '{"cniVersion":"1.0.0","code":7,"msg":"no free address"}'
  exit 1
fi
exit 0
"#;

/// Node with one RDMA function next to accelerator `0000:1a:00.0`
struct Node {
    bin_dir: TempDir,
    state_dir: TempDir,
    api: Arc<FakeInventoryApi>,
    accelerators: Arc<FakeAcceleratorSource>,
    discovery: Arc<FakeDiscovery>,
    rdma: Arc<FakeRdmaNamespace>,
}

impl Node {
    fn new(plugin: &str) -> Self {
        let bin_dir = TempDir::new().expect("should create bin dir");
        let path = bin_dir.path().join("sriov");
        fs::write(&path, plugin).expect("should write plugin");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("should make plugin executable");

        let api = Arc::new(FakeInventoryApi::default());
        api.set_inventory(
            "node-a",
            vec![inventory_entry("pf-a", &["0000:1a:00.0"], "rdma-a")],
        );
        api.set_config("ml", "rdma-a", r#"{"cniVersion": "1.0.0", "type": "sriov"}"#);

        let discovery = Arc::new(FakeDiscovery::default());
        discovery.add_vf("pf-a", "0000:1a:02.0", "pf-av0", Some("mlx5_10"));

        let accelerators = Arc::new(FakeAcceleratorSource::default());
        accelerators.set("uid-e2e", &["0000:1a:00.0"]);

        Self {
            bin_dir,
            state_dir: TempDir::new().expect("should create state dir"),
            api,
            accelerators,
            discovery,
            rdma: Arc::new(FakeRdmaNamespace::default()),
        }
    }

    /// A fresh agent process over the same node and state directory
    fn agent(&self, config: ProvisionerConfig) -> Orchestrator {
        let cache = Arc::new(AffinityCache::new(self.api.clone()));
        let provisioner = Arc::new(NamespaceProvisioner::new(
            self.discovery.clone(),
            self.rdma.clone(),
            Arc::new(CniExecutor::new(
                vec![self.bin_dir.path().to_path_buf()],
                Duration::from_secs(10),
            )),
            cache.clone(),
            config,
        ));
        Orchestrator::new(
            OrchestratorConfig {
                node_name: "node-a".to_string(),
                inventory_max_age: Duration::from_secs(60),
            },
            cache,
            self.accelerators.clone(),
            Arc::new(self.tracker()),
            provisioner,
        )
    }

    fn tracker(&self) -> FileTracker {
        FileTracker::open(self.state_dir.path()).expect("should open state dir")
    }

    fn plugin_calls(&self) -> Vec<String> {
        read_lines(&self.bin_dir.path().join("calls.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn pod() -> PodSandbox {
    sandbox("uid-e2e", "ml", "trainer", NETNS)
}

fn container() -> Container {
    Container {
        id: "ctr-e2e".to_string(),
        pod_sandbox_id: "sandbox-uid-e2e".to_string(),
        name: "main".to_string(),
        ..Default::default()
    }
}

fn mount_sources(agent_mounts: &api_types::ContainerAdjustment) -> Vec<String> {
    agent_mounts
        .mounts
        .iter()
        .map(|mount| mount.source.clone())
        .collect()
}

#[test_log::test(tokio::test)]
async fn provisioned_pod_survives_agent_restart() {
    let node = Node::new(SRIOV_PLUGIN);

    let adjust = node
        .agent(ProvisionerConfig::default())
        .create_container(&pod(), &container())
        .await
        .expect("create should succeed");
    assert_eq!(
        mount_sources(&adjust),
        vec!["/dev/infiniband/uverbs10", "/dev/infiniband/rdma_cm"]
    );
    assert_eq!(node.plugin_calls(), vec!["ADD net1"]);

    let record = node
        .tracker()
        .get("uid-e2e")
        .expect("record should be readable")
        .expect("record should exist");
    assert_eq!(record.phase, AllocationPhase::Committed);
    assert_eq!(record.devices.len(), 1);
    assert_eq!(record.devices[0].pci_address, "0000:1a:02.0");
    assert_eq!(record.devices[0].rdma_device, "mlx5_10");

    let restarted = node.agent(ProvisionerConfig::default());
    let replayed = restarted
        .create_container(&pod(), &container())
        .await
        .expect("replay should succeed");
    assert_eq!(mount_sources(&replayed), mount_sources(&adjust));
    assert_eq!(node.plugin_calls(), vec!["ADD net1"]);

    restarted
        .stop_pod_sandbox(&pod())
        .await
        .expect("stop should succeed");
    assert!(node
        .tracker()
        .get("uid-e2e")
        .expect("record should be readable")
        .is_none());
    assert_eq!(
        node.rdma.moves(),
        vec![
            RdmaMove::inbound("mlx5_10", NETNS),
            RdmaMove::outbound("mlx5_10", NETNS),
        ]
    );
    assert_eq!(node.plugin_calls(), vec!["ADD net1"]);
}

#[test_log::test(tokio::test)]
async fn teardown_runs_cni_del_when_enabled() {
    let node = Node::new(SRIOV_PLUGIN);
    let agent = node.agent(ProvisionerConfig {
        cni_del_on_teardown: true,
        ..Default::default()
    });

    agent
        .create_container(&pod(), &container())
        .await
        .expect("create should succeed");
    agent
        .stop_pod_sandbox(&pod())
        .await
        .expect("stop should succeed");

    assert_eq!(node.plugin_calls(), vec!["ADD net1", "DEL net1"]);
}

#[test_log::test(tokio::test)]
async fn plugin_failure_leaves_no_trace() {
    let node = Node::new(FAILING_PLUGIN);
    let agent = node.agent(ProvisionerConfig::default());

    let error = agent
        .create_container(&pod(), &container())
        .await
        .expect_err("create should fail");
    assert!(matches!(
        error.current_context(),
        HookError::ExternalCall { .. }
    ));
    assert!(format!("{error:?}").contains("no free address"));

    assert!(node.tracker().list().expect("should list").is_empty());
    assert_eq!(
        node.rdma.moves(),
        vec![
            RdmaMove::inbound("mlx5_10", NETNS),
            RdmaMove::outbound("mlx5_10", NETNS),
        ]
    );
    assert_eq!(node.plugin_calls(), vec!["ADD net1"]);
}
