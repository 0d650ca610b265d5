/**
 * API REDFISH - Serveur HTTP de la passerelle
 *
 * RÔLE :
 * Expose la surface Redfish (DMTF) aux outils de provisioning bare-metal
 * et traduit chaque requête en appels vers l'hyperviseur via le Gateway.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, middleware de log + contrôle du header X-Auth-Token
 * - Routes publiques : /health, /redfish, SessionService, création/liste des sessions
 * - Erreurs du Gateway converties en statut HTTP + corps {"error": {...}}
 * - Chassis/Manager : la VM est choisie d'après le header Host
 *
 * SÉCURITÉ :
 * - Token obligatoire sur toutes les autres routes (401 sinon)
 * - Mots de passe et tokens jamais écrits dans les logs
 */

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::{HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::identity::host_without_port;
use crate::media::MediaScope;
use crate::power::ResetType;
use crate::redfish;

pub const TOKEN_HEADER: &str = "x-auth-token";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

type ApiResult<T> = Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownHost(_) | GatewayError::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unsupported(_) => StatusCode::BAD_REQUEST,
            GatewayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::MediaNotMounted { .. }
            | GatewayError::PowerActionTimeout { .. }
            | GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(redfish::error(self.code(), &self.to_string()))).into_response()
    }
}

fn token(headers: &HeaderMap) -> Option<&str> {
    headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok())
}

fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(host_without_port)
        .unwrap_or_default()
}

fn is_open(method: &axum::http::Method, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    matches!(path, "" | "/health" | "/redfish" | "/redfish/v1/SessionService")
        || (path == redfish::SESSIONS && (method == "GET" || method == "POST"))
}

async fn log_requests(req: Request, next: Next) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".into());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("{} {} {}", remote, method, path);

    let resp = next.run(req).await;
    if !resp.status().is_success() {
        warn!("{} {} => {}", method, path, resp.status());
    }
    resp
}

async fn require_token(State(app): State<AppState>, req: Request, next: Next) -> Response {
    if is_open(req.method(), req.uri().path()) {
        return next.run(req).await;
    }
    match app.gateway.authenticate(token(req.headers())) {
        Ok(_) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "" }))
        .route("/health", get(|| async { "ok" }))
        .route("/redfish", get(|| async { Json(redfish::links()) }))
        .route("/redfish/v1", get(service_root))
        .route("/redfish/v1/SessionService", get(|| async { Json(redfish::session_service()) }))
        .route("/redfish/v1/SessionService/Sessions", get(list_sessions).post(create_session))
        .route("/redfish/v1/SessionService/Sessions/{id}", get(get_session).delete(delete_session))
        .route("/redfish/v1/Systems", get(list_systems))
        .route("/redfish/v1/Systems/{id}", get(get_system).patch(patch_system))
        .route("/redfish/v1/Systems/{id}/Oem/Proxmox/OperatingSystem", get(get_guest_os))
        .route("/redfish/v1/Systems/{id}/Actions/ComputerSystem.Reset", post(reset_system))
        .route("/redfish/v1/Systems/{id}/VirtualMedia", get(list_vm_media))
        .route("/redfish/v1/Systems/{id}/VirtualMedia/{iso}", get(get_vm_media))
        .route(
            "/redfish/v1/Systems/{id}/VirtualMedia/{iso}/Actions/VirtualMedia.InsertMedia",
            post(insert_media),
        )
        .route(
            "/redfish/v1/Systems/{id}/VirtualMedia/{iso}/Actions/VirtualMedia.EjectMedia",
            post(eject_media),
        )
        .route("/redfish/v1/Chassis", get(|| async { Json(redfish::chassis_collection()) }))
        .route("/redfish/v1/Chassis/1U", get(get_chassis))
        .route("/redfish/v1/Chassis/1U/Power", get(|| async { Json(redfish::chassis_power()) }))
        .route("/redfish/v1/Chassis/1U/Thermal", get(|| async { Json(redfish::chassis_thermal()) }))
        .route("/redfish/v1/Managers", get(|| async { Json(redfish::managers()) }))
        .route("/redfish/v1/Managers/1", get(get_manager))
        .route("/redfish/v1/Managers/1/VirtualMedia", get(list_global_media))
        .route("/redfish/v1/Managers/1/VirtualMedia/{iso}", get(get_global_media))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(app_state.clone(), require_token))
        .layer(middleware::from_fn(log_requests))
        .with_state(app_state)
}

async fn not_found(req: Request) -> Response {
    let message = format!("[{} {}] Redfish endpoint not found", req.method(), req.uri().path());
    (StatusCode::NOT_FOUND, Json(redfish::error("NotFound", &message))).into_response()
}

// GET /redfish/v1
async fn service_root(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let session = app.gateway.authenticate(token(&headers))?;
    Ok(Json(redfish::service_root(Some(session.client().product_name()))))
}

// -- sessions

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(rename = "UserName")]
    username: String,
    #[serde(rename = "Password")]
    password: String,
}

async fn create_session(State(app): State<AppState>, Json(creds): Json<Credentials>) -> ApiResult<Response> {
    let created = app.gateway.create_session(&creds.username, &creds.password).await?;
    let headers = [
        (LOCATION, redfish::session_location(created.id)),
        (axum::http::HeaderName::from_static(TOKEN_HEADER), created.token.clone()),
    ];
    Ok((StatusCode::CREATED, headers, Json(redfish::session_created(&created))).into_response())
}

async fn list_sessions(State(app): State<AppState>) -> Json<Value> {
    Json(redfish::sessions(&app.gateway.list_sessions()))
}

async fn get_session(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<Json<Value>> {
    let view = app.gateway.get_session(token(&headers), id)?;
    Ok(Json(redfish::session(&view)))
}

async fn delete_session(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    app.gateway.delete_session(token(&headers), id)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- systems

async fn list_systems(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let ids = app.gateway.list_systems(token(&headers)).await?;
    Ok(Json(redfish::systems(&ids)))
}

async fn get_system(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> ApiResult<Json<Value>> {
    let summary = app.gateway.get_system(token(&headers), id).await?;
    Ok(Json(redfish::system(&summary)))
}

async fn get_guest_os(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> ApiResult<Json<Value>> {
    let os = app.gateway.get_guest_os(token(&headers), id).await?;
    Ok(Json(redfish::guest_os(id, &os)))
}

#[derive(Debug, Deserialize)]
struct SystemPatch {
    #[serde(rename = "Boot")]
    boot: Option<BootPatch>,
}

#[derive(Debug, Deserialize)]
struct BootPatch {
    #[serde(rename = "BootOrder")]
    order: Option<Vec<String>>,
}

async fn patch_system(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
    Json(patch): Json<SystemPatch>,
) -> ApiResult<StatusCode> {
    let Some(order) = patch.boot.and_then(|b| b.order) else {
        return Err(GatewayError::Unsupported("only Boot.BootOrder can be patched".into()));
    };
    app.gateway.set_boot_order(token(&headers), id, &order).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    #[serde(rename = "ResetType")]
    reset_type: String,
}

async fn reset_system(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
    Json(req): Json<ResetRequest>,
) -> ApiResult<StatusCode> {
    let reset_type: ResetType = req.reset_type.parse()?;
    // client gone => handler future dropped => polling stops
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let outcome = app.gateway.reset_system(token(&headers), id, reset_type, &cancel).await?;
    debug!("VM {}: {} done after {} polls", id, outcome.reset_type, outcome.polls);
    Ok(StatusCode::NO_CONTENT)
}

// -- virtual media

async fn list_vm_media(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> ApiResult<Json<Value>> {
    let scope = MediaScope::Vm(id);
    let isos = app.gateway.list_virtual_media(token(&headers), scope).await?;
    Ok(Json(redfish::virtual_media_collection(scope, &isos)))
}

async fn get_vm_media(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path((id, iso)): Path<(u32, String)>,
) -> ApiResult<Json<Value>> {
    let scope = MediaScope::Vm(id);
    let media = app.gateway.get_virtual_media(token(&headers), scope, &iso).await?;
    Ok(Json(redfish::virtual_media(scope, &media)))
}

async fn insert_media(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path((id, iso)): Path<(u32, String)>,
) -> ApiResult<StatusCode> {
    app.gateway.insert_media(token(&headers), id, &iso).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn eject_media(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path((id, iso)): Path<(u32, String)>,
) -> ApiResult<StatusCode> {
    app.gateway.eject_media(token(&headers), id, &iso).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_global_media(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let isos = app.gateway.list_virtual_media(token(&headers), MediaScope::Global).await?;
    Ok(Json(redfish::virtual_media_collection(MediaScope::Global, &isos)))
}

async fn get_global_media(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(iso): Path<String>,
) -> ApiResult<Json<Value>> {
    let media = app.gateway.get_virtual_media(token(&headers), MediaScope::Global, &iso).await?;
    Ok(Json(redfish::virtual_media(MediaScope::Global, &media)))
}

// -- singletons

async fn get_chassis(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let info = app.gateway.get_chassis(token(&headers), request_host(&headers)).await?;
    Ok(Json(redfish::chassis(&info)))
}

async fn get_manager(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let info = app.gateway.get_manager(token(&headers), request_host(&headers))?;
    Ok(Json(redfish::manager(&info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerConf;
    use crate::hypervisor::mock::{MockConnector, MockHypervisor};
    use crate::identity::{BmcMap, IdentityResolver};
    use crate::power::testing::RecordingPause;
    use crate::power::PowerActionController;
    use crate::sessions::SessionStore;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        hv: MockHypervisor,
    }

    impl TestServer {
        async fn start() -> Self {
            let hv = MockHypervisor::new()
                .with_vm(100, "pve1", "running")
                .with_config(100, &[("ide2", "local:iso/ubuntu.iso,media=cdrom"), ("cores", "1"), ("sockets", "1")])
                .with_isos("pve1", "local", &["ubuntu.iso", "debian.iso"])
                .with_statuses(&["stopped"]);
            let connector = MockConnector::new(hv.clone()).accept("root@pam", "secret");
            let sessions = Arc::new(SessionStore::new(Arc::new(connector)));
            let map: BmcMap = [("127.0.0.1".to_string(), 100)].into_iter().collect();
            let power = PowerActionController::new(&PowerConf::default(), Arc::new(RecordingPause::default()));
            let gateway = Gateway::new(sessions, Arc::new(IdentityResolver::new(map)), power);
            let app = build_router(AppState { gateway: Arc::new(gateway) });

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                    .unwrap();
            });
            Self { base: format!("http://{addr}"), client: reqwest::Client::new(), hv }
        }

        async fn login(&self) -> String {
            let resp = self
                .client
                .post(format!("{}/redfish/v1/SessionService/Sessions", self.base))
                .json(&json!({"UserName": "root@pam", "Password": "secret"}))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201);
            assert_eq!(resp.headers()["location"], "/redfish/v1/SessionService/Sessions/1");
            resp.headers()[TOKEN_HEADER].to_str().unwrap().to_string()
        }

        async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
            let mut req = self.client.get(format!("{}{}", self.base, path));
            if let Some(t) = token {
                req = req.header(TOKEN_HEADER, t);
            }
            req.send().await.unwrap()
        }

        async fn post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
            self.client
                .post(format!("{}{}", self.base, path))
                .header(TOKEN_HEADER, token)
                .json(&body)
                .send()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_open_and_protected_routes() {
        let srv = TestServer::start().await;
        assert_eq!(srv.get("/health", None).await.status(), 200);
        assert_eq!(srv.get("/redfish", None).await.status(), 200);
        assert_eq!(srv.get("/redfish/v1/SessionService", None).await.status(), 200);

        let resp = srv.get("/redfish/v1/Systems", None).await;
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "AuthenticationError");
    }

    #[tokio::test]
    async fn test_bad_credentials_are_401() {
        let srv = TestServer::start().await;
        let resp = srv
            .client
            .post(format!("{}/redfish/v1/SessionService/Sessions", srv.base))
            .json(&json!({"UserName": "root@pam", "Password": "wrong"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_session_listing_masks_password() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let body: Value = srv.get("/redfish/v1/SessionService/Sessions", None).await.json().await.unwrap();
        assert_eq!(body["Members"][0]["Password"], "********");

        let one: Value = srv.get("/redfish/v1/SessionService/Sessions/1", Some(&token)).await.json().await.unwrap();
        assert!(one.get("Password").is_none());
        assert_eq!(one["UserName"], "root@pam");
    }

    #[tokio::test]
    async fn test_systems_and_member() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let body: Value = srv.get("/redfish/v1/Systems", Some(&token)).await.json().await.unwrap();
        assert_eq!(body["Members"][0]["@odata.id"], "/redfish/v1/Systems/100");

        let system: Value = srv.get("/redfish/v1/Systems/100", Some(&token)).await.json().await.unwrap();
        assert_eq!(system["PowerState"], "On");
        assert_eq!(system["Manufacturer"], "Proxmox VE 8.2.4");
        assert_eq!(system["Oem"]["Proxmox"]["Partial"], true);

        let missing = srv.get("/redfish/v1/Systems/999", Some(&token)).await;
        assert_eq!(missing.status(), 404);

        let os: Value = srv
            .get("/redfish/v1/Systems/100/Oem/Proxmox/OperatingSystem", Some(&token))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(os["Partial"], true);
        assert_eq!(os["OperatingSystem"], "QEMU guest agent is not running");
        let missing = srv.get("/redfish/v1/Systems/999/Oem/Proxmox/OperatingSystem", Some(&token)).await;
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_reset_and_unknown_reset_type() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let path = "/redfish/v1/Systems/100/Actions/ComputerSystem.Reset";
        let resp = srv.post(path, &token, json!({"ResetType": "ForceRestart"})).await;
        assert_eq!(resp.status(), 204);
        assert_eq!(srv.hv.count("start:100"), 1);

        let resp = srv.post(path, &token, json!({"ResetType": "Nmi"})).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_eject_of_unmounted_media_is_500() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let base = "/redfish/v1/Systems/100/VirtualMedia";
        let resp = srv.post(&format!("{base}/debian.iso/Actions/VirtualMedia.EjectMedia"), &token, json!({})).await;
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "MediaNotMounted");

        let resp = srv.post(&format!("{base}/ubuntu.iso/Actions/VirtualMedia.EjectMedia"), &token, json!({})).await;
        assert_eq!(resp.status(), 204);
    }

    #[tokio::test]
    async fn test_manager_resolved_from_host_header() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let body: Value = srv.get("/redfish/v1/Managers/1", Some(&token)).await.json().await.unwrap();
        assert_eq!(body["Links"]["ManagerForServers"][0]["@odata.id"], "/redfish/v1/Systems/100");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let srv = TestServer::start().await;
        let token = srv.login().await;
        let resp = srv.get("/redfish/v1/Nope", Some(&token)).await;
        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn test_open_paths() {
        use axum::http::Method;
        assert!(is_open(&Method::GET, "/health"));
        assert!(is_open(&Method::POST, "/redfish/v1/SessionService/Sessions"));
        assert!(!is_open(&Method::DELETE, "/redfish/v1/SessionService/Sessions"));
        assert!(!is_open(&Method::GET, "/redfish/v1/Systems"));
    }
}
