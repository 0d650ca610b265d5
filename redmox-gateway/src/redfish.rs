//! Redfish JSON documents rendered from gateway results.

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::gateway::{ChassisInfo, GuestOs, ManagerInfo, MediaInfo, SessionCreated, SystemSummary};
use crate::media::{IsoRef, MediaScope};
use crate::sessions::SessionView;

pub const ROOT: &str = "/redfish/v1";
pub const SESSIONS: &str = "/redfish/v1/SessionService/Sessions";
pub const CHASSIS_ID: &str = "1U";
pub const MANAGER_ID: &str = "1";

fn odata(id: impl AsRef<str>) -> Value {
    json!({ "@odata.id": id.as_ref() })
}

fn collection(kind: &str, name: &str, id: &str, members: Vec<Value>) -> Value {
    json!({
        "@odata.type": format!("#{kind}Collection.{kind}Collection"),
        "@odata.id": id,
        "Name": name,
        "Members@odata.count": members.len(),
        "Members": members,
    })
}

pub fn links() -> Value {
    json!({ "v1": ROOT })
}

pub fn service_root(product: Option<&str>) -> Value {
    json!({
        "@odata.type": "#ServiceRoot.v1_5_0.ServiceRoot",
        "@odata.id": ROOT,
        "Id": "RootService",
        "Name": "Redfish Proxmox Gateway",
        "RedfishVersion": "1.6.0",
        "Product": product.unwrap_or("Proxmox VE"),
        "Systems": odata(format!("{ROOT}/Systems")),
        "Chassis": odata(format!("{ROOT}/Chassis")),
        "Managers": odata(format!("{ROOT}/Managers")),
        "SessionService": odata(format!("{ROOT}/SessionService")),
        "Links": { "Sessions": odata(SESSIONS) },
    })
}

pub fn session_service() -> Value {
    json!({
        "@odata.type": "#SessionService.v1_1_8.SessionService",
        "@odata.id": format!("{ROOT}/SessionService"),
        "Id": "SessionService",
        "Name": "Session Service",
        "ServiceEnabled": true,
        "SessionTimeout": 0,
        "Sessions": odata(SESSIONS),
    })
}

pub fn session_location(id: u64) -> String {
    format!("{SESSIONS}/{id}")
}

pub fn session_created(created: &SessionCreated) -> Value {
    json!({
        "@odata.type": "#Session.v1_3_0.Session",
        "@odata.id": session_location(created.id),
        "Id": created.id.to_string(),
        "Name": "User Session",
        "Description": format!("{} session", created.backend),
        "UserName": created.username,
    })
}

pub fn session(view: &SessionView) -> Value {
    json!({
        "@odata.type": "#Session.v1_3_0.Session",
        "@odata.id": session_location(view.id),
        "Id": view.id.to_string(),
        "Name": "User Session",
        "UserName": view.username,
        "CreatedTime": view.created_at.format(&Rfc3339).unwrap_or_default(),
    })
}

/// Listing keeps the masked password, as the session listing always did.
pub fn sessions(views: &[SessionView]) -> Value {
    let members = views
        .iter()
        .map(|v| {
            let mut doc = session(v);
            doc["Password"] = json!(v.password);
            doc
        })
        .collect();
    collection("Session", "Session Collection", SESSIONS, members)
}

pub fn systems(ids: &[u32]) -> Value {
    let members = ids.iter().map(|id| odata(format!("{ROOT}/Systems/{id}"))).collect();
    collection("ComputerSystem", "Computer System Collection", &format!("{ROOT}/Systems"), members)
}

pub fn power_state(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}

pub fn system(summary: &SystemSummary) -> Value {
    let vm = &summary.descriptor;
    let id = format!("{ROOT}/Systems/{}", vm.id);
    let mut doc = json!({
        "@odata.type": "#ComputerSystem.v1_13_0.ComputerSystem",
        "@odata.id": id,
        "Id": vm.id.to_string(),
        "Name": vm.name,
        "SystemType": "Virtual",
        "Manufacturer": summary.manufacturer,
        "Model": vm.kind,
        "UUID": vm.vmgenid,
        "PowerState": power_state(summary.power_on),
        "Status": {
            "State": if summary.power_on { "Enabled" } else { "Disabled" },
            "Health": "OK",
        },
        "Boot": {
            "BootOrder": vm.boot.order,
            "BootSourceOverrideEnabled": "None",
            "BootSourceOverrideTarget": "None",
            "BootSourceOverrideMode": "None",
        },
        "ProcessorSummary": {
            "Count": summary.cpu_count,
            "Model": vm.cpu.cpu_type,
        },
        "MemorySummary": { "TotalSystemMemoryGiB": summary.memory_gb },
        "VirtualMedia": odata(format!("{id}/VirtualMedia")),
        "Actions": {
            "#ComputerSystem.Reset": {
                "target": format!("{id}/Actions/ComputerSystem.Reset"),
                "ResetType@Redfish.AllowableValues": crate::power::ResetType::ALL
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>(),
            }
        },
        "Links": {
            "Chassis": [odata(format!("{ROOT}/Chassis/{CHASSIS_ID}"))],
            "ManagedBy": [odata(format!("{ROOT}/Managers/{MANAGER_ID}"))],
        },
    });
    doc["Oem"] = json!({ "Proxmox": guest_os(vm.id, &summary.os) });
    doc
}

/// Guest agent report, also embedded in the system document under `Oem.Proxmox`.
pub fn guest_os(vmid: u32, os: &GuestOs) -> Value {
    json!({
        "@odata.id": format!("{ROOT}/Systems/{vmid}/Oem/Proxmox/OperatingSystem"),
        "OperatingSystem": os.pretty_name,
        "OsVersion": os.version,
        "KernelVersion": os.kernel_version,
        "Machine": os.machine,
        "Partial": os.partial,
    })
}

pub fn chassis_collection() -> Value {
    let id = format!("{ROOT}/Chassis");
    collection("Chassis", "Chassis Collection", &id, vec![odata(format!("{id}/{CHASSIS_ID}"))])
}

pub fn chassis(info: &ChassisInfo) -> Value {
    let id = format!("{ROOT}/Chassis/{CHASSIS_ID}");
    json!({
        "@odata.type": "#Chassis.v1_14_0.Chassis",
        "@odata.id": id,
        "Id": CHASSIS_ID,
        "Name": format!("VM {}", info.vmid),
        "ChassisType": "RackMount",
        "UUID": Uuid::from_u128(1).to_string(),
        "PowerState": power_state(info.power_on),
        "Power": odata(format!("{id}/Power")),
        "Thermal": odata(format!("{id}/Thermal")),
        "Links": {
            "ComputerSystems": [odata(format!("{ROOT}/Systems/{}", info.vmid))],
            "ManagedBy": [odata(format!("{ROOT}/Managers/{MANAGER_ID}"))],
        },
    })
}

pub fn chassis_power() -> Value {
    json!({
        "@odata.type": "#Power.v1_7_0.Power",
        "@odata.id": format!("{ROOT}/Chassis/{CHASSIS_ID}/Power"),
        "Id": "Power",
        "Name": "Power",
        "PowerControl": [],
        "PowerSupplies": [],
    })
}

pub fn chassis_thermal() -> Value {
    json!({
        "@odata.type": "#Thermal.v1_7_0.Thermal",
        "@odata.id": format!("{ROOT}/Chassis/{CHASSIS_ID}/Thermal"),
        "Id": "Thermal",
        "Name": "Thermal",
        "Fans": [],
        "Temperatures": [],
    })
}

pub fn managers() -> Value {
    let id = format!("{ROOT}/Managers");
    collection("Manager", "Manager Collection", &id, vec![odata(format!("{id}/{MANAGER_ID}"))])
}

pub fn manager(info: &ManagerInfo) -> Value {
    let id = format!("{ROOT}/Managers/{MANAGER_ID}");
    json!({
        "@odata.type": "#Manager.v1_10_0.Manager",
        "@odata.id": id,
        "Id": MANAGER_ID,
        "Name": "Manager",
        "ManagerType": "BMC",
        "DateTime": info.date_time.format(&Rfc3339).unwrap_or_default(),
        "Status": { "State": "Enabled", "Health": "OK" },
        "VirtualMedia": odata(format!("{id}/VirtualMedia")),
        "Links": {
            "ManagerForServers": [odata(format!("{ROOT}/Systems/{}", info.vmid))],
            "ManagerForChassis": [odata(format!("{ROOT}/Chassis/{CHASSIS_ID}"))],
        },
    })
}

fn media_prefix(scope: MediaScope) -> String {
    match scope {
        MediaScope::Global => format!("{ROOT}/Managers/{MANAGER_ID}/VirtualMedia"),
        MediaScope::Vm(vmid) => format!("{ROOT}/Systems/{vmid}/VirtualMedia"),
    }
}

pub fn virtual_media_collection(scope: MediaScope, isos: &[IsoRef]) -> Value {
    let prefix = media_prefix(scope);
    let members = isos.iter().map(|iso| odata(format!("{prefix}/{}", iso.id()))).collect();
    collection("VirtualMedia", "Virtual Media Services", &prefix, members)
}

pub fn virtual_media(scope: MediaScope, media: &MediaInfo) -> Value {
    let id = format!("{}/{}", media_prefix(scope), media.iso.id());
    let mut doc = json!({
        "@odata.type": "#VirtualMedia.v1_3_0.VirtualMedia",
        "@odata.id": id,
        "Id": media.iso.id(),
        "Name": media.iso.id(),
        "MediaTypes": ["CD", "DVD"],
        "Image": media.iso.path(),
        "ImageName": media.iso.id(),
        "Inserted": media.inserted,
        "WriteProtected": true,
    });
    if let MediaScope::Vm(_) = scope {
        doc["Actions"] = json!({
            "#VirtualMedia.InsertMedia": { "target": format!("{id}/Actions/VirtualMedia.InsertMedia") },
            "#VirtualMedia.EjectMedia": { "target": format!("{id}/Actions/VirtualMedia.EjectMedia") },
        });
    }
    doc
}

pub fn error(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}
