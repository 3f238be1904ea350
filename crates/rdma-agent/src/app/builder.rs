use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use kube::Client;
use nvml_wrapper::Nvml;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::cache::AffinityCache;
use crate::domain::orchestrator::Orchestrator;
use crate::domain::orchestrator::OrchestratorConfig;
use crate::domain::ports::AcceleratorSource;
use crate::domain::provisioner::NamespaceProvisioner;
use crate::domain::provisioner::ProvisionerConfig;
use crate::domain::tracker::FileTracker;
use crate::infrastructure::allocation::normalizer::BusIdLookup;
use crate::infrastructure::allocation::AcceleratorIdNormalizer;
use crate::infrastructure::allocation::AllocationConfig;
use crate::infrastructure::allocation::CheckpointSource;
use crate::infrastructure::allocation::ClaimSource;
use crate::infrastructure::allocation::CombinedSource;
use crate::infrastructure::allocation::FallbackSource;
use crate::infrastructure::allocation::PodResourcesSource;
use crate::infrastructure::k8s::ClaimWatcher;
use crate::infrastructure::k8s::KubeInventoryApi;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::CniExecutor;
use crate::infrastructure::NetlinkRdma;
use crate::infrastructure::SysfsDiscovery;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let args = &self.daemon_args;
        let client = init_kube_client(args.kubeconfig.clone(), args.request_timeout())
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("failed to create Kubernetes client")?;

        let inventory_api = Arc::new(KubeInventoryApi::new(
            client.clone(),
            args.network_driver.clone(),
            args.request_timeout(),
        ));
        let cache = Arc::new(AffinityCache::new(inventory_api));

        let allocation = AllocationConfig::from(args);
        let accelerators = self.create_accelerator_source(&allocation, &client, &cache);

        let tracker = Arc::new(
            FileTracker::open(&args.state_dir)
                .with_context(|| format!("failed to open state dir {}", args.state_dir.display()))?,
        );

        let provisioner = Arc::new(NamespaceProvisioner::new(
            Arc::new(SysfsDiscovery::new(&args.sysfs_root)),
            Arc::new(NetlinkRdma::new()),
            Arc::new(CniExecutor::new(args.cni_bin_dirs.clone(), args.cni_timeout())),
            cache.clone(),
            ProvisionerConfig::from(args),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::from(args),
            cache.clone(),
            accelerators,
            tracker,
            provisioner,
        ));

        let claim_watcher = allocation
            .claim_driver
            .as_ref()
            .map(|_| Arc::new(ClaimWatcher::new(client.clone(), cache.clone())));

        let services = ApplicationServices {
            orchestrator,
            cache,
            claim_watcher,
        };
        Ok(Application::new(services, self.daemon_args))
    }

    /// Device-plugin allocations from the kubelet, falling back to its checkpoint,
    /// joined with claim allocations when a claim driver is set
    fn create_accelerator_source(
        &self,
        config: &AllocationConfig,
        client: &Client,
        cache: &Arc<AffinityCache>,
    ) -> Arc<dyn AcceleratorSource> {
        let kubelet: Arc<dyn AcceleratorSource> = Arc::new(FallbackSource::new(
            Arc::new(PodResourcesSource::new(
                config.pod_resources_socket.clone(),
                config.resource_names.clone(),
                cache.clone(),
                config.snapshot_max_age,
                config.request_timeout,
            )),
            Arc::new(CheckpointSource::new(
                config.checkpoint_path.clone(),
                config.resource_names.clone(),
            )),
        ));

        let source: Arc<dyn AcceleratorSource> = match &config.claim_driver {
            Some(driver) => {
                let claims: Arc<dyn AcceleratorSource> = Arc::new(ClaimSource::new(
                    client.clone(),
                    cache.clone(),
                    driver.clone(),
                    self.daemon_args.node_name.clone(),
                    config.request_timeout,
                ));
                Arc::new(CombinedSource::new(vec![kubelet, claims]))
            }
            None => kubelet,
        };

        let lookup = if config.nvml { init_nvml() } else { None };
        Arc::new(AcceleratorIdNormalizer::new(source, lookup))
    }
}

/// NVML handle for UUID lookups, `None` on hosts without the NVIDIA driver
fn init_nvml() -> Option<Arc<dyn BusIdLookup>> {
    let nvml = Nvml::init().or_else(|_| {
        tracing::warn!("Standard NVML init failed, trying with explicit library path");
        Nvml::builder()
            .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
            .init()
    });
    match nvml {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Some(Arc::new(nvml))
        }
        Err(e) => {
            tracing::warn!("NVML unavailable, accelerator UUIDs are passed through: {e}");
            None
        }
    }
}
