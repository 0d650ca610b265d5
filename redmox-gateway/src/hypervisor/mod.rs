//! Boundary with the hypervisor's management API.
//!
//! The gateway only talks to the hypervisor through [`Hypervisor`], one handle
//! per authenticated session, obtained from a [`HypervisorConnector`].

pub mod proxmox;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::UpstreamError;
use crate::models::{
    ContentEntry, GuestOsInfo, NodeEntry, RawConfig, StorageEntry, TaskId, VmResource, VmStatus,
};

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Typed calls on an authenticated hypervisor connection.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Product name and version, e.g. `Proxmox VE 8.2.4`.
    fn product_name(&self) -> &str;

    async fn list_nodes(&self) -> UpstreamResult<Vec<NodeEntry>>;
    async fn list_storage(&self, node: &str) -> UpstreamResult<Vec<StorageEntry>>;
    async fn list_content(&self, node: &str, storage: &str, content: &str) -> UpstreamResult<Vec<ContentEntry>>;
    async fn list_vm_resources(&self) -> UpstreamResult<Vec<VmResource>>;

    async fn vm_config(&self, node: &str, vmid: u32) -> UpstreamResult<RawConfig>;
    /// Sets a single configuration key.
    async fn set_vm_config(&self, node: &str, vmid: u32, key: &str, value: &str) -> UpstreamResult<()>;

    async fn start(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId>;
    async fn stop(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId>;
    async fn shutdown(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId>;
    async fn vm_status(&self, node: &str, vmid: u32) -> UpstreamResult<VmStatus>;

    async fn guest_os_info(&self, node: &str, vmid: u32) -> UpstreamResult<GuestOsInfo>;
}

/// Establishes a hypervisor connection for a credential pair.
/// Failing here means the hypervisor rejected the credentials.
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(&self, username: &str, password: &str) -> UpstreamResult<Arc<dyn Hypervisor>>;
}
