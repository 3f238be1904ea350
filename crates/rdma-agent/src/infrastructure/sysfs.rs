//! SR-IOV and RDMA device discovery through sysfs

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use crate::domain::provisioner::DeviceDiscovery;
use crate::domain::provisioner::ProvisionError;
use crate::domain::provisioner::RdmaDevice;
use crate::domain::provisioner::VirtualFunction;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
const DEV_INFINIBAND: &str = "/dev/infiniband";

/// Character device classes exposed per RDMA function, with their node prefixes
const CHAR_DEVICE_CLASSES: [(&str, &[&str]); 2] = [
    ("infiniband_verbs", &["uverbs"]),
    ("infiniband_mad", &["umad", "issm"]),
];

pub struct SysfsDiscovery {
    root: PathBuf,
}

impl Default for SysfsDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pci_device(&self, pci_address: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci_address)
    }
}

/// Entry names of `dir`, empty when it does not exist
fn entry_names(dir: &Path) -> io::Result<Vec<String>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn virtfn_index(name: &str) -> Option<u32> {
    name.strip_prefix("virtfn")?.parse().ok()
}

impl DeviceDiscovery for SysfsDiscovery {
    fn available_vfs(&self, pf: &str) -> Result<Vec<VirtualFunction>, Report<ProvisionError>> {
        let error = || ProvisionError::Discovery {
            device: pf.to_string(),
        };
        let device_dir = self.root.join("class/net").join(pf).join("device");

        let mut indices: Vec<u32> = entry_names(&device_dir)
            .change_context_lazy(error)?
            .iter()
            .filter_map(|name| virtfn_index(name))
            .collect();
        indices.sort_unstable();

        let mut vfs = Vec::new();
        for index in indices {
            let link = device_dir.join(format!("virtfn{index}"));
            let target = fs::read_link(&link)
                .change_context_lazy(error)
                .attach_printable_lazy(|| format!("link: {}", link.display()))?;
            let Some(pci_address) = target.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            // A VF moved into a pod namespace has no netdev left in the host view
            let mut netdevs = entry_names(&link.join("net")).change_context_lazy(error)?;
            netdevs.sort();
            let Some(netdev) = netdevs.into_iter().next() else {
                debug!(pf, vf = %pci_address, "virtual function in use");
                continue;
            };

            vfs.push(VirtualFunction {
                index,
                pci_address,
                netdev,
            });
        }
        Ok(vfs)
    }

    fn rdma_device_for_pci(
        &self,
        pci_address: &str,
    ) -> Result<Option<RdmaDevice>, Report<ProvisionError>> {
        let error = || ProvisionError::Discovery {
            device: pci_address.to_string(),
        };
        let device_dir = self.pci_device(pci_address);

        let mut names = entry_names(&device_dir.join("infiniband")).change_context_lazy(error)?;
        names.sort();
        let Some(name) = names.into_iter().next() else {
            return Ok(None);
        };

        let mut char_devices = Vec::new();
        for (class, prefixes) in CHAR_DEVICE_CLASSES {
            let mut nodes: Vec<String> = entry_names(&device_dir.join(class))
                .change_context_lazy(error)?
                .into_iter()
                .filter(|node| prefixes.iter().any(|prefix| node.starts_with(prefix)))
                .collect();
            nodes.sort();
            char_devices.extend(
                nodes
                    .into_iter()
                    .map(|node| format!("{DEV_INFINIBAND}/{node}")),
            );
        }

        Ok(Some(RdmaDevice { name, char_devices }))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    struct SysfsFixture {
        root: TempDir,
    }

    impl SysfsFixture {
        fn new() -> Self {
            Self {
                root: TempDir::new().expect("should create temp dir"),
            }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.root.path().join(relative)
        }

        fn mkdir(&self, relative: &str) {
            fs::create_dir_all(self.path(relative)).expect("should create dir");
        }

        fn add_vf(&self, pf: &str, index: u32, pci: &str, netdev: Option<&str>) {
            self.mkdir(&format!("class/net/{pf}/device"));
            self.mkdir(&format!("bus/pci/devices/{pci}/net"));
            if let Some(netdev) = netdev {
                self.mkdir(&format!("bus/pci/devices/{pci}/net/{netdev}"));
            }
            symlink(
                self.path(&format!("bus/pci/devices/{pci}")),
                self.path(&format!("class/net/{pf}/device/virtfn{index}")),
            )
            .expect("should create virtfn link");
        }

        fn discovery(&self) -> SysfsDiscovery {
            SysfsDiscovery::new(self.root.path())
        }
    }

    #[test]
    fn test_available_vfs_in_numeric_order_skipping_used_ones() {
        let fixture = SysfsFixture::new();
        fixture.add_vf("ens1f0", 10, "0000:3b:03.2", Some("ens1f0v10"));
        fixture.add_vf("ens1f0", 2, "0000:3b:02.2", Some("ens1f0v2"));
        fixture.add_vf("ens1f0", 1, "0000:3b:02.1", None);

        let vfs = fixture
            .discovery()
            .available_vfs("ens1f0")
            .expect("should scan virtual functions");
        assert_eq!(
            vfs,
            vec![
                VirtualFunction {
                    index: 2,
                    pci_address: "0000:3b:02.2".to_string(),
                    netdev: "ens1f0v2".to_string(),
                },
                VirtualFunction {
                    index: 10,
                    pci_address: "0000:3b:03.2".to_string(),
                    netdev: "ens1f0v10".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_unknown_pf_has_no_vfs() {
        let fixture = SysfsFixture::new();
        let vfs = fixture
            .discovery()
            .available_vfs("ens9f0")
            .expect("missing pf should not fail");
        assert!(vfs.is_empty());
    }

    #[test]
    fn test_rdma_device_and_char_devices() {
        let fixture = SysfsFixture::new();
        let pci = "0000:3b:02.2";
        fixture.mkdir(&format!("bus/pci/devices/{pci}/infiniband/mlx5_4"));
        fixture.mkdir(&format!("bus/pci/devices/{pci}/infiniband_verbs/uverbs4"));
        fixture.mkdir(&format!("bus/pci/devices/{pci}/infiniband_mad/umad4"));
        fixture.mkdir(&format!("bus/pci/devices/{pci}/infiniband_mad/issm4"));
        fixture.mkdir(&format!("bus/pci/devices/{pci}/infiniband_mad/abi_version"));

        let device = fixture
            .discovery()
            .rdma_device_for_pci(pci)
            .expect("should read rdma device");
        assert_eq!(
            device,
            Some(RdmaDevice {
                name: "mlx5_4".to_string(),
                char_devices: vec![
                    "/dev/infiniband/uverbs4".to_string(),
                    "/dev/infiniband/issm4".to_string(),
                    "/dev/infiniband/umad4".to_string(),
                ],
            })
        );
    }

    #[test]
    fn test_function_without_rdma_device() {
        let fixture = SysfsFixture::new();
        fixture.mkdir("bus/pci/devices/0000:3b:02.3/net/ens1f0v3");

        let device = fixture
            .discovery()
            .rdma_device_for_pci("0000:3b:02.3")
            .expect("should read rdma device");
        assert_eq!(device, None);
    }
}
