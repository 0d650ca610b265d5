//! ISO images as Redfish virtual media.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::decoder::{decode, CdromInfo, VmDescriptor};
use crate::error::{GatewayError, GatewayResult, ResourceKind};
use crate::hypervisor::Hypervisor;
use crate::identity::IdentityResolver;
use crate::models::VmResource;

/// Drive value of a CD-ROM device with no image loaded.
const EMPTY_CDROM: &str = "none,media=cdrom";

/// A mountable image: `node` + storage volume id (`storage:iso/name.iso`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsoRef {
    pub node: String,
    pub storage: String,
    pub volid: String,
}

impl IsoRef {
    pub fn new(node: &str, volid: &str) -> Self {
        let storage = volid.split_once(':').map(|(s, _)| s).unwrap_or_default();
        Self { node: node.to_string(), storage: storage.to_string(), volid: volid.to_string() }
    }

    /// `node/storage/iso/name.iso`.
    pub fn path(&self) -> String {
        let volume = self.volid.split_once(':').map(|(_, v)| v).unwrap_or(&self.volid);
        format!("{}/{}/{}", self.node, self.storage, volume)
    }

    /// Last path segment, the id Redfish clients use.
    pub fn id(&self) -> &str {
        self.volid.rsplit(|c: char| c == '/' || c == ':').next().unwrap_or(&self.volid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaScope {
    /// Every node of the cluster.
    Global,
    /// Storage visible from the node hosting this VM.
    Vm(u32),
}

pub struct VirtualMediaResolver {
    identity: Arc<IdentityResolver>,
}

impl VirtualMediaResolver {
    pub fn new(identity: Arc<IdentityResolver>) -> Self {
        Self { identity }
    }

    pub async fn list_global(&self, hv: &dyn Hypervisor) -> GatewayResult<Vec<IsoRef>> {
        let mut isos = Vec::new();
        for node in hv.list_nodes().await? {
            isos.extend(scan_node(hv, &node.node).await?);
        }
        Ok(isos)
    }

    pub async fn list_for_vm(&self, hv: &dyn Hypervisor, vmid: u32) -> GatewayResult<Vec<IsoRef>> {
        let vm = self.identity.find_vm(hv, vmid).await?;
        scan_node(hv, &vm.node).await
    }

    pub async fn list(&self, hv: &dyn Hypervisor, scope: MediaScope) -> GatewayResult<Vec<IsoRef>> {
        match scope {
            MediaScope::Global => self.list_global(hv).await,
            MediaScope::Vm(vmid) => self.list_for_vm(hv, vmid).await,
        }
    }

    pub async fn resolve_by_id(&self, hv: &dyn Hypervisor, iso_id: &str, scope: MediaScope) -> GatewayResult<IsoRef> {
        find_iso(self.list(hv, scope).await?, iso_id)
    }

    /// Attaches the image as the VM's CD-ROM. Returns the mounted reference.
    pub async fn insert(&self, hv: &dyn Hypervisor, vmid: u32, iso_id: &str) -> GatewayResult<IsoRef> {
        let vm = self.identity.find_vm(hv, vmid).await?;
        let iso = find_iso(scan_node(hv, &vm.node).await?, iso_id)?;
        hv.set_vm_config(&vm.node, vmid, "cdrom", &iso.volid).await?;
        info!("VM {}: mounted {}", vmid, iso.volid);
        Ok(iso)
    }

    /// Empties the CD-ROM device holding `iso_id`, leaving other devices untouched.
    pub async fn eject(&self, hv: &dyn Hypervisor, vmid: u32, iso_id: &str) -> GatewayResult<()> {
        let vm = self.identity.find_vm(hv, vmid).await?;
        let descriptor = describe(hv, &vm).await?;
        let Some(cdrom) = descriptor.cdrom_holding(iso_id) else {
            warn!("VM {}: eject of {} refused, media not mounted", vmid, iso_id);
            return Err(GatewayError::MediaNotMounted { vmid, media: iso_id.to_string() });
        };
        hv.set_vm_config(&vm.node, vmid, &cdrom.mount, EMPTY_CDROM).await?;
        info!("VM {}: ejected {} from {}", vmid, iso_id, cdrom.mount);
        Ok(())
    }

    /// CD-ROM devices attached to the VM, in key order.
    pub async fn mounted_on(&self, hv: &dyn Hypervisor, vmid: u32) -> GatewayResult<Vec<CdromInfo>> {
        let vm = self.identity.find_vm(hv, vmid).await?;
        Ok(describe(hv, &vm).await?.cdroms)
    }
}

async fn describe(hv: &dyn Hypervisor, vm: &VmResource) -> GatewayResult<VmDescriptor> {
    let vmid = vm.vmid.unwrap_or_default();
    let config = hv.vm_config(&vm.node, vmid).await?;
    Ok(decode(vm, &config))
}

/// Storage targets in enumeration order, iso content of each.
async fn scan_node(hv: &dyn Hypervisor, node: &str) -> GatewayResult<Vec<IsoRef>> {
    let mut isos = Vec::new();
    for storage in hv.list_storage(node).await? {
        for content in hv.list_content(node, &storage.storage, "iso").await? {
            isos.push(IsoRef::new(node, &content.volid));
        }
    }
    Ok(isos)
}

fn find_iso(candidates: Vec<IsoRef>, iso_id: &str) -> GatewayResult<IsoRef> {
    candidates
        .into_iter()
        .find(|iso| iso.id() == iso_id)
        .ok_or_else(|| GatewayError::not_found(ResourceKind::Iso, iso_id))
}
