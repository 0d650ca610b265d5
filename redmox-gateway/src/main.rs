/**
 * REDMOX GATEWAY - Point d'entrée
 *
 * RÔLE : Bootstrap de la passerelle Redfish → Proxmox : config, logs,
 * table BMC, connecteur hyperviseur, sessions, routeur HTTP.
 *
 * ARCHITECTURE : HTTP (axum) → Gateway → Hypervisor (REST Proxmox), un client
 * hyperviseur par session authentifiée.
 */

mod config;
mod decoder;
mod error;
mod gateway;
mod http;
mod hypervisor;
mod identity;
mod media;
mod models;
mod power;
mod redfish;
mod sessions;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

use crate::config::load_config;
use crate::gateway::Gateway;
use crate::http::AppState;
use crate::hypervisor::proxmox::ProxmoxConnector;
use crate::identity::{BmcMap, IdentityResolver};
use crate::power::{PowerActionController, TokioPause};
use crate::sessions::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = load_config().await;

    tracing_subscriber::fmt()
        .with_max_level(if cfg.debug { Level::DEBUG } else { Level::INFO })
        .init();

    // table adresse BMC → VM, chargée une seule fois
    let bmc_map = match BmcMap::load(&cfg.bmc_map).await {
        Ok(map) => {
            if map.is_empty() {
                warn!("[gateway] BMC map {} is empty, Chassis/Manager will answer 404", cfg.bmc_map);
            } else {
                info!("[gateway] loaded {} BMC mappings from {}", map.len(), cfg.bmc_map);
            }
            map
        }
        Err(e) => {
            warn!("[gateway] no BMC map at {} ({}), Chassis/Manager will answer 404", cfg.bmc_map, e);
            BmcMap::default()
        }
    };

    let connector = ProxmoxConnector::new(&cfg.proxmox).context("building the Proxmox HTTP client")?;
    info!("[gateway] hypervisor at {}:{}", cfg.proxmox.host, cfg.proxmox.port);

    let sessions = Arc::new(SessionStore::new(Arc::new(connector)));
    let identity = Arc::new(IdentityResolver::new(bmc_map));
    let power = PowerActionController::new(&cfg.power, Arc::new(TokioPause));
    let gateway = Arc::new(Gateway::new(sessions, identity, power));

    let app = http::build_router(AppState { gateway });

    let addr: SocketAddr = cfg.listen.parse().with_context(|| format!("invalid listen address {}", cfg.listen))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!("[gateway] listening on http://{addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
