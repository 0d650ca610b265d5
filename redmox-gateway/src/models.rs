//! Records returned by the hypervisor's REST API, as the gateway consumes them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Flat VM configuration as returned by `/nodes/{node}/qemu/{vmid}/config`.
/// Values are mostly strings, some are numbers (`cores`, `memory`...).
pub type RawConfig = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntry {
    pub storage: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// One volume of a storage target. `volid` is `storageId:contentType/volumeName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    pub volid: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Entry of `/cluster/resources?type=vm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmResource {
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub node: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: f64,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
    #[serde(default)]
    pub diskread: u64,
    #[serde(default)]
    pub diskwrite: u64,
    #[serde(default)]
    pub netin: u64,
    #[serde(default)]
    pub netout: u64,
}

impl VmResource {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }

    /// Tags are stored `;`-separated upstream.
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|t| t.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Reply of `/status/current`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl VmStatus {
    #[cfg(test)]
    pub fn with_status(status: &str) -> Self {
        VmStatus { status: status.to_string(), qmpstatus: Some(status.to_string()), uptime: None }
    }

    /// QMP status when the hypervisor reports one, plain status otherwise.
    pub fn power_status(&self) -> &str {
        self.qmpstatus.as_deref().unwrap_or(&self.status)
    }
}

/// Guest agent `get-osinfo` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestOsInfo {
    #[serde(default, rename = "pretty-name")]
    pub pretty_name: Option<String>,
    #[serde(default, rename = "version-id")]
    pub version: Option<String>,
    #[serde(default, rename = "kernel-version")]
    pub kernel_version: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
}

/// Task handle returned by lifecycle calls (`UPID:node:pid:pstart:starttime:type:id:user:`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskId {
    pub raw: String,
    pub node: Option<String>,
    pub pid_hex: Option<String>,
    pub pstart_hex: Option<String>,
    pub start_hex: Option<String>,
    pub task_type: Option<String>,
    pub id: Option<String>,
    pub user: Option<String>,
}

impl TaskId {
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split(':').collect();
        let field = |i: usize| parts.get(i).filter(|s| !s.is_empty()).map(|s| s.to_string());
        if parts.len() >= 8 && parts[0] == "UPID" {
            TaskId {
                raw: raw.to_string(),
                node: field(1),
                pid_hex: field(2),
                pstart_hex: field(3),
                start_hex: field(4),
                task_type: field(5),
                id: field(6),
                user: field(7),
            }
        } else {
            TaskId {
                raw: raw.to_string(),
                node: None,
                pid_hex: None,
                pstart_hex: None,
                start_hex: None,
                task_type: None,
                id: None,
                user: None,
            }
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_parse() {
        let task = TaskId::parse("UPID:pve1:0000A1B2:0012C3D4:65F0A1B2:qmstart:100:root@pam:");
        assert_eq!(task.node.as_deref(), Some("pve1"));
        assert_eq!(task.task_type.as_deref(), Some("qmstart"));
        assert_eq!(task.id.as_deref(), Some("100"));
        assert_eq!(task.user.as_deref(), Some("root@pam"));
    }

    #[test]
    fn test_task_id_keeps_unknown_format() {
        let task = TaskId::parse("OK");
        assert_eq!(task.raw, "OK");
        assert!(task.node.is_none());
    }

    #[test]
    fn test_vm_resource_from_listing() {
        let json = serde_json::json!({
            "id": "qemu/100", "vmid": 100, "node": "pve1", "type": "qemu",
            "name": "web", "status": "running", "tags": "prod;web",
            "cpu": 0.02, "maxcpu": 4, "mem": 1024, "maxmem": 4096
        });
        let vm: VmResource = serde_json::from_value(json).unwrap();
        assert_eq!(vm.vmid, Some(100));
        assert!(vm.is_running());
        assert_eq!(vm.tag_list(), vec!["prod", "web"]);
    }

    #[test]
    fn test_power_status_prefers_qmp() {
        let status = VmStatus { status: "running".into(), qmpstatus: Some("paused".into()), uptime: None };
        assert_eq!(status.power_status(), "paused");
        let status = VmStatus { status: "stopped".into(), qmpstatus: None, uptime: None };
        assert_eq!(status.power_status(), "stopped");
    }
}
