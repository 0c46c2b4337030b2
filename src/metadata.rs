use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::host::HostInfo;

pub const DEFAULT_COMMENT: &str = "created by oci2local";

/// Minimal v1 metadata for a layer imported from a bare filesystem tarball.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerMeta {
    pub id: String,
    pub comment: String,
    pub created: String,
    pub architecture: String,
    pub os: String,
    pub size: u64,
    pub container_config: ContainerConfig,
    pub config: ContainerConfig,
}

/// The Docker v1 container configuration block, empty for imported layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Domainname")]
    pub domainname: String,
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Memory")]
    pub memory: u64,
    #[serde(rename = "MemorySwap")]
    pub memory_swap: u64,
    #[serde(rename = "CpuShares")]
    pub cpu_shares: u64,
    #[serde(rename = "Cpuset")]
    pub cpuset: String,
    #[serde(rename = "AttachStdin")]
    pub attach_stdin: bool,
    #[serde(rename = "AttachStdout")]
    pub attach_stdout: bool,
    #[serde(rename = "AttachStderr")]
    pub attach_stderr: bool,
    #[serde(rename = "PortSpecs")]
    pub port_specs: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts")]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "OpenStdin")]
    pub open_stdin: bool,
    #[serde(rename = "StdinOnce")]
    pub stdin_once: bool,
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Volumes")]
    pub volumes: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "NetworkDisabled")]
    pub network_disabled: bool,
    #[serde(rename = "OnBuild")]
    pub on_build: Option<Vec<String>>,
    #[serde(rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
}

impl ContainerMeta {
    /// Builds the record for `layer_id`. An unknown `layer_size` is stored as 0.
    pub fn for_layer(layer_id: &str, comment: &str, host: &HostInfo, layer_size: Option<u64>) -> Self {
        Self {
            id: layer_id.to_string(),
            comment: comment.to_string(),
            created: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            architecture: host.arch(),
            os: host.osversion(),
            size: layer_size.unwrap_or(0),
            container_config: ContainerConfig::default(),
            config: ContainerConfig::default(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
