//! Network-config documents handed to the secondary network backend and the results
//! it returns.

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::ProvisionError;
use crate::domain::types::NetworkConfigRef;
use crate::domain::types::NetworkDeviceInfo;
use crate::domain::types::NetworkStatus;

/// CNI version assumed when a template does not declare one
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

const DEVICE_ID_KEY: &str = "deviceID";

/// Builds the backend document of `config` for one virtual function.
///
/// The VF PCI address is written as `deviceID` into every plugin that already
/// declares the key, or into the first plugin when none does. `name` and
/// `cniVersion` are filled in when the template leaves them out.
pub fn render_network_config(
    template: &str,
    device_id: &str,
    config: &NetworkConfigRef,
) -> Result<Value, Report<ProvisionError>> {
    let invalid = || ProvisionError::InvalidNetworkConfig {
        config: config.key(),
    };

    let mut document: Value = serde_json::from_str(template).map_err(|e| {
        Report::new(invalid()).attach_printable(format!("template is not valid JSON: {e}"))
    })?;
    let root = document
        .as_object_mut()
        .ok_or_else(|| Report::new(invalid()).attach_printable("template is not a JSON object"))?;

    root.entry("name")
        .or_insert_with(|| Value::String(config.name.clone()));
    root.entry("cniVersion")
        .or_insert_with(|| Value::String(DEFAULT_CNI_VERSION.to_string()));

    if let Some(plugins) = root.get_mut("plugins") {
        let plugins = plugins
            .as_array_mut()
            .filter(|plugins| !plugins.is_empty())
            .ok_or_else(|| {
                Report::new(invalid()).attach_printable("`plugins` must be a non-empty list")
            })?;

        let declared = plugins
            .iter()
            .filter(|plugin| plugin.get(DEVICE_ID_KEY).is_some())
            .count();
        for (idx, plugin) in plugins.iter_mut().enumerate() {
            let plugin = plugin.as_object_mut().ok_or_else(|| {
                Report::new(invalid()).attach_printable(format!("plugin {idx} is not an object"))
            })?;
            if plugin.contains_key(DEVICE_ID_KEY) || (declared == 0 && idx == 0) {
                plugin.insert(DEVICE_ID_KEY.to_string(), Value::String(device_id.to_string()));
            }
        }
    } else {
        if !root.contains_key("type") {
            return Err(Report::new(invalid()).attach_printable("plugin `type` missing"));
        }
        root.insert(DEVICE_ID_KEY.to_string(), Value::String(device_id.to_string()));
    }

    Ok(document)
}

/// Plugin documents of a rendered config in chain order.
///
/// A single-plugin config yields itself; a plugin list yields each plugin with the
/// list's `name` and `cniVersion` copied in.
pub fn plugin_chain(document: &Value) -> Vec<Value> {
    let Some(root) = document.as_object() else {
        return vec![];
    };
    let Some(plugins) = root.get("plugins").and_then(Value::as_array) else {
        return vec![document.clone()];
    };

    plugins
        .iter()
        .filter_map(Value::as_object)
        .map(|plugin| {
            let mut plugin: Map<String, Value> = plugin.clone();
            for key in ["name", "cniVersion"] {
                if let Some(value) = root.get(key) {
                    plugin.insert(key.to_string(), value.clone());
                }
            }
            Value::Object(plugin)
        })
        .collect()
}

/// Interface entry of a backend result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
}

/// IP configuration entry of a backend result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniIpConfig {
    /// Address in CIDR notation
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    /// Index into `interfaces`
    #[serde(default)]
    pub interface: Option<usize>,
}

/// Structured result of the backend "add" operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
    #[serde(default)]
    pub routes: Vec<Value>,
    #[serde(default)]
    pub dns: Option<Value>,
}

impl CniResult {
    /// Converts the result into the network status of `interface_name`.
    ///
    /// The reported interface is the first one placed in a sandbox, falling back to
    /// the requested name when the backend reports none.
    pub fn to_network_status(
        &self,
        network_name: &str,
        interface_name: &str,
        pci_address: &str,
        rdma_device: &str,
    ) -> NetworkStatus {
        let sandboxed = self
            .interfaces
            .iter()
            .enumerate()
            .find(|(_, iface)| !iface.sandbox.is_empty());

        let (interface_idx, interface, mac) = match sandboxed {
            Some((idx, iface)) => (Some(idx), iface.name.clone(), iface.mac.clone()),
            None => (None, interface_name.to_string(), String::new()),
        };

        let matching_ips: Vec<&CniIpConfig> = self
            .ips
            .iter()
            .filter(|ip| match (ip.interface, interface_idx) {
                (Some(ip_idx), Some(idx)) => ip_idx == idx,
                _ => true,
            })
            .collect();

        let ips = matching_ips
            .iter()
            .map(|ip| {
                ip.address
                    .split_once('/')
                    .map_or(ip.address.as_str(), |(addr, _)| addr)
                    .to_string()
            })
            .collect();
        let gateway = matching_ips
            .iter()
            .filter_map(|ip| ip.gateway.clone())
            .collect();
        let dns = self
            .dns
            .clone()
            .filter(|dns| dns.as_object().is_some_and(|obj| !obj.is_empty()));

        NetworkStatus {
            name: network_name.to_string(),
            interface,
            ips,
            mac,
            default: false,
            dns,
            gateway,
            device_info: Some(NetworkDeviceInfo::pci(pci_address, rdma_device)),
        }
    }
}
