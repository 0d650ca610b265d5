//! Decoding of the flat `key=value` VM configuration into a [`VmDescriptor`].
//!
//! The hypervisor packs most devices into one string per key, using `,` between
//! segments, `:` between datastore and volume and `=` inside attributes. Which
//! device a key describes is only recognisable by substrings of the key or of
//! its value, so decoding runs an ordered table of [`Rule`]s over every key.
//! Rules are independent: several may fire for the same key and all of them
//! are applied.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{RawConfig, VmResource};

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize)]
pub struct VmDescriptor {
    pub id: u32,
    pub vmgenid: String,
    pub name: String,
    pub status: String,
    pub node: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: Vec<String>,
    pub uptime: u64,
    pub template: bool,
    pub digest: String,
    /// Raw value of the primary CD-ROM slot (`ide2`).
    pub media: String,
    pub boot: BootInfo,
    pub ostype: String,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    pub network: NetworkInfo,
    pub bios: Option<FirmwareInfo>,
    pub meta: Attributes,
    /// Last CD-ROM device in key order.
    pub cdrom: Option<CdromInfo>,
    /// Every CD-ROM device, in key order.
    pub cdroms: Vec<CdromInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BootInfo {
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub usage: CpuUsage,
    pub cores: u32,
    pub sockets: u32,
    #[serde(rename = "type")]
    pub cpu_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuUsage {
    pub current: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub usage: MemoryUsage,
    pub assigned_mb: u64,
    pub numa: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub usage: DiskUsage,
    pub list: Vec<DiskEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub current: u64,
    pub read: u64,
    pub write: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Mounted,
    Unused,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskEntry {
    pub device: String,
    pub datastore: String,
    pub name: String,
    pub status: DiskStatus,
    pub extra: Attributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub usage: NetworkUsage,
    pub interfaces: Vec<NetInterface>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkUsage {
    #[serde(rename = "in")]
    pub bytes_in: u64,
    #[serde(rename = "out")]
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetInterface {
    pub name: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirmwareInfo {
    pub name: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CdromInfo {
    /// Config key of the device, e.g. `ide2`.
    pub mount: String,
    pub datastore: String,
    pub iso: String,
    pub extra: Attributes,
}

impl VmDescriptor {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn logical_cpus(&self) -> u32 {
        self.cpu.cores.saturating_mul(self.cpu.sockets)
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory.assigned_mb as f64 / 1024.0
    }

    /// CD-ROM device currently holding `iso`.
    pub fn cdrom_holding(&self, iso: &str) -> Option<&CdromInfo> {
        self.cdroms.iter().find(|c| c.iso == iso)
    }
}

/// Matchers, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Any string value containing `iso/`.
    Cdrom,
    /// The `meta` key.
    Meta,
    /// Keys starting with `net`.
    Network,
    /// Any string value containing `iothread`.
    MountedDisk,
    /// Keys containing `bios`.
    Firmware,
    /// Keys containing `unused`.
    UnusedDisk,
}

pub const RULES: [Rule; 6] = [
    Rule::Cdrom,
    Rule::Meta,
    Rule::Network,
    Rule::MountedDisk,
    Rule::Firmware,
    Rule::UnusedDisk,
];

impl Rule {
    pub fn matches(self, key: &str, value: &Value) -> bool {
        match self {
            Rule::Cdrom => value.as_str().is_some_and(|v| v.contains("iso/")),
            Rule::Meta => key == "meta",
            Rule::Network => key.starts_with("net"),
            Rule::MountedDisk => value.as_str().is_some_and(|v| v.contains("iothread")),
            Rule::Firmware => key.contains("bios"),
            Rule::UnusedDisk => key.contains("unused"),
        }
    }

    fn apply(self, key: &str, value: &str, out: &mut Devices) {
        let segments: Vec<&str> = value.split(',').collect();
        let head = segments.first().copied().unwrap_or_default();
        let tail = segments.get(1..).unwrap_or_default();
        match self {
            Rule::Cdrom => {
                let (datastore, path) = split_volume(head);
                out.cdroms.push(CdromInfo {
                    mount: key.to_string(),
                    datastore,
                    iso: path.replace("iso/", ""),
                    extra: attributes(tail),
                });
            }
            Rule::Meta => out.meta.extend(attributes(&segments)),
            Rule::Network => out.interfaces.push(NetInterface {
                name: key.to_string(),
                attributes: attributes(&segments),
            }),
            Rule::MountedDisk => {
                let (datastore, name) = split_volume(head);
                out.disks.push(DiskEntry {
                    device: key.to_string(),
                    datastore,
                    name,
                    status: DiskStatus::Mounted,
                    extra: attributes(tail),
                });
            }
            Rule::Firmware => {
                out.bios = Some(FirmwareInfo { name: key.to_string(), attributes: attributes(&segments) });
            }
            Rule::UnusedDisk => {
                let (datastore, name) = split_volume(head);
                out.disks.push(DiskEntry {
                    device: key.to_string(),
                    datastore,
                    name,
                    status: DiskStatus::Unused,
                    extra: Attributes::new(),
                });
            }
        }
    }
}

#[derive(Default)]
struct Devices {
    cdroms: Vec<CdromInfo>,
    meta: Attributes,
    interfaces: Vec<NetInterface>,
    disks: Vec<DiskEntry>,
    bios: Option<FirmwareInfo>,
}

/// Builds the descriptor from the cluster listing entry and the VM config.
pub fn decode(resource: &VmResource, config: &RawConfig) -> VmDescriptor {
    let mut devices = Devices::default();
    for (key, value) in config {
        let text = value_text(value);
        for rule in RULES {
            if rule.matches(key, value) {
                rule.apply(key, &text, &mut devices);
            }
        }
    }

    VmDescriptor {
        id: resource.vmid.unwrap_or_default(),
        vmgenid: text_of(config, "vmgenid").unwrap_or_default(),
        name: resource.name.clone().unwrap_or_else(|| "Unknown".into()),
        status: resource.status.clone().unwrap_or_else(|| "Unknown".into()),
        node: resource.node.clone(),
        kind: resource.kind.clone(),
        tags: resource.tag_list(),
        uptime: resource.uptime,
        template: resource.template != 0,
        digest: text_of(config, "digest").unwrap_or_default(),
        media: text_of(config, "ide2").unwrap_or_default(),
        boot: BootInfo { order: config.get("boot").map(|v| boot_order(&value_text(v))).unwrap_or_default() },
        ostype: text_of(config, "ostype").unwrap_or_else(|| "Unknown".into()),
        cpu: CpuInfo {
            usage: CpuUsage { current: resource.cpu, total: resource.maxcpu },
            cores: count_of(config, "cores"),
            sockets: count_of(config, "sockets"),
            cpu_type: text_of(config, "cpu").unwrap_or_else(|| "Unknown".into()),
        },
        memory: MemoryInfo {
            usage: MemoryUsage { current: resource.mem, total: resource.maxmem },
            assigned_mb: number_of(config, "memory").unwrap_or(0),
            numa: number_of(config, "numa").unwrap_or(0) != 0,
        },
        disk: DiskInfo {
            usage: DiskUsage {
                current: resource.disk,
                read: resource.diskread,
                write: resource.diskwrite,
                total: resource.maxdisk,
            },
            list: devices.disks,
        },
        network: NetworkInfo {
            usage: NetworkUsage { bytes_in: resource.netin, bytes_out: resource.netout },
            interfaces: devices.interfaces,
        },
        bios: devices.bios,
        meta: devices.meta,
        cdrom: devices.cdroms.last().cloned(),
        cdroms: devices.cdroms,
    }
}

/// `order=scsi0;ide2;net0` -> `["scsi0", "ide2", "net0"]`.
pub fn boot_order(value: &str) -> Vec<String> {
    let list = value.replace("order=", "");
    if list.is_empty() {
        return Vec::new();
    }
    list.split(';').map(str::to_string).collect()
}

/// Reverse of [`boot_order`].
pub fn encode_boot_order(devices: &[String]) -> String {
    format!("order={}", devices.join(";"))
}

/// `local-lvm:vm-100-disk-0` -> (`local-lvm`, `vm-100-disk-0`). No `:` means no datastore.
fn split_volume(segment: &str) -> (String, String) {
    match segment.split_once(':') {
        Some((store, name)) => (store.to_string(), name.to_string()),
        None => (String::new(), segment.to_string()),
    }
}

fn attributes(segments: &[&str]) -> Attributes {
    segments
        .iter()
        .filter_map(|s| s.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_of(config: &RawConfig, key: &str) -> Option<String> {
    config.get(key).map(value_text)
}

fn number_of(config: &RawConfig, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// CPU topology count, defaulting to 1; out-of-range values clamp to `u32::MAX`.
fn count_of(config: &RawConfig, key: &str) -> u32 {
    number_of(config, key).map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX))
}
