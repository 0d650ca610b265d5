//! In-memory hypervisor for tests: scripted answers, every call recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{Hypervisor, HypervisorConnector, UpstreamResult};
use crate::error::UpstreamError;
use crate::models::{
    ContentEntry, GuestOsInfo, NodeEntry, RawConfig, StorageEntry, TaskId, VmResource, VmStatus,
};

#[derive(Default)]
struct MockInner {
    nodes: Vec<String>,
    storage: HashMap<String, Vec<String>>,
    isos: HashMap<(String, String), Vec<String>>,
    vms: Vec<VmResource>,
    configs: HashMap<u32, RawConfig>,
    statuses: VecDeque<String>,
    failing: HashSet<String>,
    guest: Option<GuestOsInfo>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockHypervisor {
    inner: Arc<Mutex<MockInner>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, vmid: u32, node: &str, status: &str) -> Self {
        {
            let mut inner = self.inner.lock();
            if !inner.nodes.iter().any(|n| n == node) {
                inner.nodes.push(node.to_string());
            }
            inner.vms.push(VmResource {
                vmid: Some(vmid),
                node: node.to_string(),
                kind: "qemu".into(),
                name: Some(format!("vm{vmid}")),
                status: Some(status.to_string()),
                ..VmResource::default()
            });
        }
        self
    }

    pub fn with_config(self, vmid: u32, entries: &[(&str, &str)]) -> Self {
        let config = entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        self.inner.lock().configs.insert(vmid, config);
        self
    }

    /// Registers iso volumes (`volume name` only) on `node`/`storage`.
    pub fn with_isos(self, node: &str, storage: &str, names: &[&str]) -> Self {
        {
            let mut inner = self.inner.lock();
            if !inner.nodes.iter().any(|n| n == node) {
                inner.nodes.push(node.to_string());
            }
            let stgs = inner.storage.entry(node.to_string()).or_default();
            if !stgs.iter().any(|s| s == storage) {
                stgs.push(storage.to_string());
            }
            inner
                .isos
                .entry((node.to_string(), storage.to_string()))
                .or_default()
                .extend(names.iter().map(|n| format!("{storage}:iso/{n}")));
        }
        self
    }

    /// Successive answers of `vm_status`; the last one repeats.
    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        self.inner.lock().statuses = statuses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_guest(self, info: GuestOsInfo) -> Self {
        self.inner.lock().guest = Some(info);
        self
    }

    /// Makes every call of that name (`start`, `stop`, `set_config`...) fail.
    pub fn failing(self, call: &str) -> Self {
        self.inner.lock().failing.insert(call.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn config_of(&self, vmid: u32) -> RawConfig {
        self.inner.lock().configs.get(&vmid).cloned().unwrap_or_default()
    }

    fn record(&self, call: &str, detail: String) -> UpstreamResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(detail);
        if inner.failing.contains(call) {
            return Err(UpstreamError::api(500, format!("{call} failed")));
        }
        Ok(())
    }

    fn task(node: &str, kind: &str, vmid: u32) -> TaskId {
        TaskId::parse(&format!("UPID:{node}:00001234:00005678:6500AAAA:{kind}:{vmid}:root@pam:"))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn product_name(&self) -> &str {
        "Proxmox VE 8.2.4"
    }

    async fn list_nodes(&self) -> UpstreamResult<Vec<NodeEntry>> {
        self.record("list_nodes", "list_nodes".into())?;
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .iter()
            .map(|n| NodeEntry { node: n.clone(), status: Some("online".into()) })
            .collect())
    }

    async fn list_storage(&self, node: &str) -> UpstreamResult<Vec<StorageEntry>> {
        self.record("list_storage", format!("list_storage:{node}"))?;
        let inner = self.inner.lock();
        Ok(inner
            .storage
            .get(node)
            .map(|stgs| {
                stgs.iter()
                    .map(|s| StorageEntry { storage: s.clone(), kind: Some("dir".into()), content: Some("iso".into()) })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_content(&self, node: &str, storage: &str, content: &str) -> UpstreamResult<Vec<ContentEntry>> {
        self.record("list_content", format!("list_content:{node}/{storage}"))?;
        let inner = self.inner.lock();
        if content != "iso" {
            return Ok(Vec::new());
        }
        Ok(inner
            .isos
            .get(&(node.to_string(), storage.to_string()))
            .map(|vols| {
                vols.iter()
                    .map(|v| ContentEntry { volid: v.clone(), content: Some("iso".into()), size: None })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_vm_resources(&self) -> UpstreamResult<Vec<VmResource>> {
        self.record("list_vms", "list_vms".into())?;
        Ok(self.inner.lock().vms.clone())
    }

    async fn vm_config(&self, _node: &str, vmid: u32) -> UpstreamResult<RawConfig> {
        self.record("config", format!("config:{vmid}"))?;
        Ok(self.config_of(vmid))
    }

    async fn set_vm_config(&self, _node: &str, vmid: u32, key: &str, value: &str) -> UpstreamResult<()> {
        self.record("set_config", format!("set_config:{vmid}:{key}={value}"))?;
        self.inner
            .lock()
            .configs
            .entry(vmid)
            .or_default()
            .insert(key.to_string(), serde_json::Value::String(value.to_string()));
        Ok(())
    }

    async fn start(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.record("start", format!("start:{vmid}"))?;
        Ok(Self::task(node, "qmstart", vmid))
    }

    async fn stop(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.record("stop", format!("stop:{vmid}"))?;
        Ok(Self::task(node, "qmstop", vmid))
    }

    async fn shutdown(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.record("shutdown", format!("shutdown:{vmid}"))?;
        Ok(Self::task(node, "qmshutdown", vmid))
    }

    async fn vm_status(&self, _node: &str, vmid: u32) -> UpstreamResult<VmStatus> {
        self.record("status", format!("status:{vmid}"))?;
        let mut inner = self.inner.lock();
        let status = if inner.statuses.len() > 1 {
            inner.statuses.pop_front()
        } else {
            inner.statuses.front().cloned()
        };
        Ok(VmStatus::with_status(status.as_deref().unwrap_or("stopped")))
    }

    async fn guest_os_info(&self, _node: &str, vmid: u32) -> UpstreamResult<GuestOsInfo> {
        self.record("guest", format!("guest:{vmid}"))?;
        self.inner
            .lock()
            .guest
            .clone()
            .ok_or_else(|| UpstreamError::api(500, "QEMU guest agent is not running"))
    }
}

/// Accepts exactly the registered credential pairs, handing out the same mock.
#[derive(Clone, Default)]
pub struct MockConnector {
    accepted: Arc<Mutex<HashMap<String, String>>>,
    hypervisor: MockHypervisor,
}

impl MockConnector {
    pub fn new(hypervisor: MockHypervisor) -> Self {
        Self { accepted: Arc::default(), hypervisor }
    }

    pub fn accept(self, username: &str, password: &str) -> Self {
        self.accepted.lock().insert(username.to_string(), password.to_string());
        self
    }
}

#[async_trait]
impl HypervisorConnector for MockConnector {
    async fn connect(&self, username: &str, password: &str) -> UpstreamResult<Arc<dyn Hypervisor>> {
        match self.accepted.lock().get(username) {
            Some(expected) if expected == password => Ok(Arc::new(self.hypervisor.clone())),
            _ => Err(UpstreamError::api(401, "authentication failure")),
        }
    }
}
