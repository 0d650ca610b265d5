use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub proxmox: ProxmoxConf,
    pub listen: String,
    pub bmc_map: String, // fichier "adresse vmid" par ligne
    pub debug: bool,
    pub power: PowerConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxmoxConf {
    pub host: String,
    pub port: u16,
    pub verify_tls: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PowerConf {
    pub poll_interval_secs: u64,
    pub max_polls: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxmox: ProxmoxConf::default(),
            listen: "0.0.0.0:5000".into(),
            bmc_map: "bmc_map".into(),
            debug: false,
            power: PowerConf::default(),
        }
    }
}

impl Default for ProxmoxConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 8006, verify_tls: false, timeout_secs: 20 }
    }
}

impl Default for PowerConf {
    fn default() -> Self {
        Self { poll_interval_secs: 3, max_polls: 10 }
    }
}

impl GatewayConfig {
    /// Environment wins over the YAML file.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(host) = get("PMOX_ADDR").filter(|h| !h.is_empty()) {
            self.proxmox.host = host;
        }
        if let Some(port) = get("PMOX_PORT") {
            match port.parse() {
                Ok(p) => self.proxmox.port = p,
                Err(_) => eprintln!("[config] ignoring invalid PMOX_PORT {:?}", port),
            }
        }
        if let Some(debug) = get("DEBUG") {
            self.debug = debug.eq_ignore_ascii_case("yes");
        }
        if let Some(listen) = get("REDMOX_LISTEN").filter(|l| !l.is_empty()) {
            self.listen = listen;
        }
    }
}

pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("REDMOX_CONFIG").unwrap_or_else(|_| "redmox.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            GatewayConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                // le logger n'est pas encore initialisé à ce stade
                eprintln!("[config] invalid config {}: {e}", path);
                GatewayConfig::default()
            })
        }
    } else {
        GatewayConfig::default()
    };
    cfg.apply_env(|k| std::env::var(k).ok());
    cfg
}
