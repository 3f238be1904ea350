pub mod allocation;
pub mod cni;
pub mod k8s;
pub mod kube_client;
pub mod logging;
pub mod netns;
pub mod rdma_netlink;
pub mod sysfs;

pub use cni::CniExecutor;
pub use rdma_netlink::NetlinkRdma;
pub use sysfs::SysfsDiscovery;
