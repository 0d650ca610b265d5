//! Per-endpoint orchestration: token check, identity resolution, hypervisor
//! calls, decoding. Owns no state besides the injected components.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::decoder::{decode, encode_boot_order, CdromInfo, VmDescriptor};
use crate::error::{GatewayError, GatewayResult, ResourceKind};
use crate::hypervisor::Hypervisor;
use crate::identity::IdentityResolver;
use crate::media::{IsoRef, MediaScope, VirtualMediaResolver};
use crate::power::{PowerActionController, PowerOutcome, ResetType};
use crate::sessions::{Session, SessionStore, SessionView};

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub id: u64,
    pub token: String,
    pub username: String,
    /// Hypervisor product name that accepted the credentials.
    pub backend: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub descriptor: VmDescriptor,
    pub manufacturer: String,
    pub power_on: bool,
    pub cpu_count: u32,
    pub memory_gb: f64,
    pub os: GuestOs,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestOs {
    pub pretty_name: String,
    pub version: Option<String>,
    pub kernel_version: Option<String>,
    pub machine: Option<String>,
    /// Set when the guest agent did not answer; `pretty_name` then holds the fault.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChassisInfo {
    pub vmid: u32,
    pub power_on: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerInfo {
    pub vmid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub date_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub iso: IsoRef,
    pub inserted: bool,
}

pub struct Gateway {
    sessions: Arc<SessionStore>,
    identity: Arc<IdentityResolver>,
    media: VirtualMediaResolver,
    power: PowerActionController,
}

impl Gateway {
    pub fn new(sessions: Arc<SessionStore>, identity: Arc<IdentityResolver>, power: PowerActionController) -> Self {
        let media = VirtualMediaResolver::new(identity.clone());
        Self { sessions, identity, media, power }
    }

    pub fn authenticate(&self, token: Option<&str>) -> GatewayResult<Arc<Session>> {
        let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
            GatewayError::Authentication("a valid token is missing".into())
        })?;
        self.sessions
            .validate(token)
            .ok_or_else(|| GatewayError::Authentication("invalid token".into()))
    }

    // -- sessions

    pub async fn create_session(&self, username: &str, password: &str) -> GatewayResult<SessionCreated> {
        let session = self.sessions.create(username, password).await?;
        Ok(SessionCreated {
            id: session.id,
            token: session.token.clone(),
            username: session.username.clone(),
            backend: session.client().product_name().to_string(),
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        self.sessions.list_all()
    }

    pub fn get_session(&self, token: Option<&str>, id: u64) -> GatewayResult<SessionView> {
        self.authenticate(token)?;
        self.sessions
            .get_by_sequence_id(id)
            .map(|s| s.view())
            .ok_or_else(|| GatewayError::not_found(ResourceKind::Session, id))
    }

    pub fn delete_session(&self, token: Option<&str>, id: u64) -> GatewayResult<()> {
        self.authenticate(token)?;
        if self.sessions.delete(id) {
            Ok(())
        } else {
            warn!("session {} not found", id);
            Err(GatewayError::not_found(ResourceKind::Session, id))
        }
    }

    // -- systems

    pub async fn list_systems(&self, token: Option<&str>) -> GatewayResult<Vec<u32>> {
        let session = self.authenticate(token)?;
        let vms = session.client().list_vm_resources().await?;
        Ok(vms.into_iter().filter_map(|vm| vm.vmid).collect())
    }

    pub async fn get_system(&self, token: Option<&str>, vmid: u32) -> GatewayResult<SystemSummary> {
        let session = self.authenticate(token)?;
        let descriptor = self.describe(&session, vmid).await?;
        let os = guest_os(session.client(), &descriptor.node, vmid).await;
        Ok(SystemSummary {
            os,
            manufacturer: session.client().product_name().to_string(),
            power_on: descriptor.is_running(),
            cpu_count: descriptor.logical_cpus(),
            memory_gb: descriptor.memory_gb(),
            descriptor,
        })
    }

    pub async fn get_guest_os(&self, token: Option<&str>, vmid: u32) -> GatewayResult<GuestOs> {
        let session = self.authenticate(token)?;
        let hv = session.client();
        let vm = self.identity.find_vm(hv, vmid).await?;
        Ok(guest_os(hv, &vm.node, vmid).await)
    }

    pub async fn reset_system(
        &self,
        token: Option<&str>,
        vmid: u32,
        reset_type: ResetType,
        cancel: &CancellationToken,
    ) -> GatewayResult<PowerOutcome> {
        let session = self.authenticate(token)?;
        let hv = session.client();
        let vm = self.identity.find_vm(hv, vmid).await?;
        self.power.execute(hv, &vm.node, vmid, reset_type, cancel).await
    }

    pub async fn set_boot_order(&self, token: Option<&str>, vmid: u32, order: &[String]) -> GatewayResult<()> {
        let session = self.authenticate(token)?;
        let hv = session.client();
        let vm = self.identity.find_vm(hv, vmid).await?;
        let value = encode_boot_order(order);
        hv.set_vm_config(&vm.node, vmid, "boot", &value).await?;
        info!("VM {}: boot {}", vmid, value);
        Ok(())
    }

    // -- chassis / manager singletons, picked by the address the client called

    pub async fn get_chassis(&self, token: Option<&str>, host: &str) -> GatewayResult<ChassisInfo> {
        let session = self.authenticate(token)?;
        let vmid = self.identity.resolve_vm_by_host(host)?;
        let vm = self.identity.find_vm(session.client(), vmid).await?;
        Ok(ChassisInfo { vmid, power_on: vm.is_running() })
    }

    pub fn get_manager(&self, token: Option<&str>, host: &str) -> GatewayResult<ManagerInfo> {
        self.authenticate(token)?;
        let vmid = self.identity.resolve_vm_by_host(host)?;
        Ok(ManagerInfo { vmid, date_time: OffsetDateTime::now_utc() })
    }

    // -- virtual media

    pub async fn list_virtual_media(&self, token: Option<&str>, scope: MediaScope) -> GatewayResult<Vec<IsoRef>> {
        let session = self.authenticate(token)?;
        self.media.list(session.client(), scope).await
    }

    pub async fn get_virtual_media(&self, token: Option<&str>, scope: MediaScope, iso_id: &str) -> GatewayResult<MediaInfo> {
        let session = self.authenticate(token)?;
        let hv = session.client();
        let iso = self.media.resolve_by_id(hv, iso_id, scope).await?;
        let inserted = match scope {
            MediaScope::Vm(vmid) => is_mounted(&self.media.mounted_on(hv, vmid).await?, iso_id),
            // no VM to compare against, every listed image counts as available
            MediaScope::Global => true,
        };
        Ok(MediaInfo { iso, inserted })
    }

    pub async fn insert_media(&self, token: Option<&str>, vmid: u32, iso_id: &str) -> GatewayResult<IsoRef> {
        let session = self.authenticate(token)?;
        self.media.insert(session.client(), vmid, iso_id).await
    }

    pub async fn eject_media(&self, token: Option<&str>, vmid: u32, iso_id: &str) -> GatewayResult<()> {
        let session = self.authenticate(token)?;
        self.media.eject(session.client(), vmid, iso_id).await
    }

    async fn describe(&self, session: &Session, vmid: u32) -> GatewayResult<VmDescriptor> {
        let hv = session.client();
        // unknown VM ids fail here, before any config fetch
        let vm = self.identity.find_vm(hv, vmid).await?;
        let config = hv.vm_config(&vm.node, vmid).await?;
        Ok(decode(&vm, &config))
    }
}

/// Guest agent answer; an agent fault yields a partial result instead of an error.
async fn guest_os(hv: &dyn Hypervisor, node: &str, vmid: u32) -> GuestOs {
    match hv.guest_os_info(node, vmid).await {
        Ok(info) => GuestOs {
            pretty_name: info.pretty_name.unwrap_or_else(|| "Unknown".to_string()),
            version: info.version,
            kernel_version: info.kernel_version,
            machine: info.machine,
            partial: false,
        },
        Err(e) => {
            warn!("VM {}: guest agent unavailable: {}", vmid, e);
            GuestOs { pretty_name: e.to_string(), version: None, kernel_version: None, machine: None, partial: true }
        }
    }
}

fn is_mounted(cdroms: &[CdromInfo], iso_id: &str) -> bool {
    cdroms.iter().any(|c| c.iso == iso_id)
}
