//! Redfish-side identity (inbound host address, VM id) to hypervisor-side identity.

use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult, ResourceKind};
use crate::hypervisor::Hypervisor;
use crate::models::VmResource;

/// Static `host address -> vmid` table, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct BmcMap {
    entries: HashMap<String, u32>,
}

impl BmcMap {
    /// One `address vmid` pair per line. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next().and_then(|v| v.parse::<u32>().ok())) {
                (Some(addr), Some(vmid)) => {
                    entries.insert(addr.to_string(), vmid);
                }
                _ => warn!("bmc_map line {}: malformed entry {:?}", lineno + 1, line),
            }
        }
        Self { entries }
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let map = Self::parse(&text);
        info!("loaded {} host mappings from {:?}", map.len(), path.as_ref());
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, u32)> for BmcMap {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

pub struct IdentityResolver {
    map: BmcMap,
}

impl IdentityResolver {
    pub fn new(map: BmcMap) -> Self {
        Self { map }
    }

    pub fn resolve_vm_by_host(&self, address: &str) -> GatewayResult<u32> {
        self.map
            .entries
            .get(address)
            .copied()
            .ok_or_else(|| GatewayError::UnknownHost(address.to_string()))
    }

    /// Fresh scan of the cluster listing; the hypervisor is the only source of truth.
    pub async fn find_vm(&self, hv: &dyn Hypervisor, vmid: u32) -> GatewayResult<VmResource> {
        hv.list_vm_resources()
            .await?
            .into_iter()
            .find(|vm| vm.vmid == Some(vmid))
            .ok_or_else(|| GatewayError::not_found(ResourceKind::Vm, vmid))
    }
}

/// Strips the port from a `Host` header value, IPv6 brackets included.
pub fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}
