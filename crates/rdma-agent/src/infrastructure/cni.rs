//! Secondary network attachment through CNI plugin binaries

use core::error::Error;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::domain::provisioner::netconf::plugin_chain;
use crate::domain::provisioner::netconf::CniResult;
use crate::domain::provisioner::BackendOperation;
use crate::domain::provisioner::NetworkBackend;
use crate::domain::provisioner::ProvisionError;
use crate::domain::provisioner::RuntimeConf;

pub const DEFAULT_CNI_BIN_DIR: &str = "/opt/cni/bin";

#[derive(Debug, derive_more::Display)]
pub enum CniError {
    #[display("plugin {plugin} not found")]
    PluginNotFound { plugin: String },
    #[display("network config has no plugins")]
    EmptyChain,
    #[display("failed to run plugin {plugin}")]
    Exec { plugin: String },
    #[display("plugin {plugin} timed out")]
    Timeout { plugin: String },
    #[display("plugin {plugin} failed with code {code}: {message}")]
    Plugin {
        plugin: String,
        code: u32,
        message: String,
    },
    #[display("plugin {plugin} returned an invalid result")]
    InvalidResult { plugin: String },
}

impl Error for CniError {}

/// Error document a plugin prints on failure
#[derive(Debug, Default, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
enum CniCommand {
    #[display("ADD")]
    Add,
    #[display("DEL")]
    Del,
}

pub struct CniExecutor {
    bin_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl CniExecutor {
    pub fn new(bin_dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self { bin_dirs, timeout }
    }

    fn find_plugin(&self, plugin: &str) -> Result<PathBuf, Report<CniError>> {
        let not_found = || CniError::PluginNotFound {
            plugin: plugin.to_string(),
        };
        if plugin.is_empty() || plugin.contains('/') {
            return Err(Report::new(not_found()));
        }
        self.bin_dirs
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|path| path.is_file())
            .ok_or_else(|| Report::new(not_found()))
    }

    fn cni_path(&self) -> String {
        self.bin_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Runs one plugin, returning its stdout document (`None` when it printed nothing)
    async fn exec(
        &self,
        command: CniCommand,
        config: &Value,
        runtime: &RuntimeConf,
    ) -> Result<Option<Value>, Report<CniError>> {
        let plugin = config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let binary = self.find_plugin(&plugin)?;
        let exec_error = || CniError::Exec {
            plugin: plugin.clone(),
        };
        let stdin = serde_json::to_vec(config).change_context_lazy(exec_error)?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command.to_string())
            .env("CNI_CONTAINERID", &runtime.container_id)
            .env("CNI_NETNS", &runtime.netns)
            .env("CNI_IFNAME", &runtime.if_name)
            .env("CNI_ARGS", runtime.cni_args())
            .env("CNI_PATH", self.cni_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .change_context_lazy(exec_error)
            .attach_printable_lazy(|| format!("binary: {}", binary.display()))?;

        let run = async move {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&stdin).await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .change_context_lazy(|| CniError::Timeout {
                plugin: plugin.clone(),
            })?
            .change_context_lazy(exec_error)?;

        if !output.status.success() {
            let error: PluginError = serde_json::from_slice(&output.stdout).unwrap_or_default();
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Report::new(CniError::Plugin {
                plugin,
                code: error.code,
                message: if error.msg.is_empty() {
                    stderr.trim().to_string()
                } else {
                    error.msg
                },
            })
            .attach_printable(format!("details: {}", error.details))
            .attach_printable(format!("exit status: {}", output.status)));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&output.stdout)
            .map(Some)
            .change_context(CniError::InvalidResult { plugin })
    }

    async fn add_chain(&self, config: &Value, runtime: &RuntimeConf) -> Result<CniResult, Report<CniError>> {
        let chain = plugin_chain(config);
        if chain.is_empty() {
            return Err(Report::new(CniError::EmptyChain));
        }

        let mut previous: Option<Value> = None;
        for mut plugin in chain {
            if let (Some(result), Some(object)) = (&previous, plugin.as_object_mut()) {
                object.insert("prevResult".to_string(), result.clone());
            }
            if let Some(result) = self.exec(CniCommand::Add, &plugin, runtime).await? {
                previous = Some(result);
            }
        }

        let result = previous.unwrap_or_else(|| Value::Object(Default::default()));
        serde_json::from_value(result).change_context(CniError::InvalidResult {
            plugin: "chain".to_string(),
        })
    }

    /// Deletes through every plugin in reverse order, reporting the first failure
    async fn del_chain(&self, config: &Value, runtime: &RuntimeConf) -> Result<(), Report<CniError>> {
        let mut first_error = None;
        for plugin in plugin_chain(config).iter().rev() {
            if let Err(e) = self.exec(CniCommand::Del, plugin, runtime).await {
                warn!("CNI DEL failed: {e:?}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl NetworkBackend for CniExecutor {
    #[tracing::instrument(skip(self, config), fields(pod = %runtime.pod.key(), interface = %runtime.if_name))]
    async fn add(
        &self,
        config: &Value,
        runtime: &RuntimeConf,
    ) -> Result<CniResult, Report<ProvisionError>> {
        let result = self
            .add_chain(config, runtime)
            .await
            .change_context_lazy(|| ProvisionError::Backend {
                operation: BackendOperation::Add,
                interface: runtime.if_name.clone(),
            })?;
        debug!(interfaces = result.interfaces.len(), ips = result.ips.len(), "CNI ADD succeeded");
        Ok(result)
    }

    #[tracing::instrument(skip(self, config), fields(pod = %runtime.pod.key(), interface = %runtime.if_name))]
    async fn del(&self, config: &Value, runtime: &RuntimeConf) -> Result<(), Report<ProvisionError>> {
        self.del_chain(config, runtime)
            .await
            .change_context_lazy(|| ProvisionError::Backend {
                operation: BackendOperation::Del,
                interface: runtime.if_name.clone(),
            })
    }
}
