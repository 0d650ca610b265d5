//! Proxmox VE REST client (`/api2/json`), ticket based authentication.

use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Hypervisor, HypervisorConnector, UpstreamResult};
use crate::config::ProxmoxConf;
use crate::error::UpstreamError;
use crate::models::{
    ContentEntry, GuestOsInfo, NodeEntry, RawConfig, StorageEntry, TaskId, VmResource, VmStatus,
};

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketReply {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct VersionReply {
    version: String,
}

#[derive(Deserialize)]
struct AgentReply<T> {
    result: T,
}

/// Builds authenticated [`ProxmoxClient`]s against one cluster endpoint.
pub struct ProxmoxConnector {
    http: reqwest::Client,
    base_url: String,
}

impl ProxmoxConnector {
    pub fn new(conf: &ProxmoxConf) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            // PVE ships a self-signed certificate unless configured otherwise
            .danger_accept_invalid_certs(!conf.verify_tls)
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("https://{}:{}/api2/json", conf.host, conf.port),
        })
    }
}

#[async_trait]
impl HypervisorConnector for ProxmoxConnector {
    async fn connect(&self, username: &str, password: &str) -> UpstreamResult<Arc<dyn Hypervisor>> {
        debug!("requesting PVE ticket for {}", username);
        let resp = self
            .http
            .post(format!("{}/access/ticket", self.base_url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let ticket: TicketReply = unwrap_data(resp).await?;

        let mut client = ProxmoxClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_token,
            product: String::new(),
        };
        let version: VersionReply = client.call(Method::GET, "/version", &[]).await?;
        client.product = format!("Proxmox VE {}", version.version);
        Ok(Arc::new(client))
    }
}

/// Authenticated connection, one per gateway session.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    ticket: String,
    csrf_token: String,
    product: String,
}

impl ProxmoxClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mutating = method != Method::GET;
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(header::COOKIE, format!("PVEAuthCookie={}", self.ticket));
        if mutating {
            req = req.header("CSRFPreventionToken", &self.csrf_token);
        }
        req
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> UpstreamResult<T> {
        debug!("PVE {} {}", method, path);
        let req = self.request(method.clone(), path);
        let req = if method == Method::GET { req.query(params) } else { req.form(params) };
        unwrap_data(req.send().await?).await
    }

    async fn lifecycle(&self, node: &str, vmid: u32, action: &str, params: &[(&str, &str)]) -> UpstreamResult<TaskId> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/{action}");
        let upid: String = self.call(Method::POST, &path, params).await?;
        Ok(TaskId::parse(&upid))
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    fn product_name(&self) -> &str {
        &self.product
    }

    async fn list_nodes(&self) -> UpstreamResult<Vec<NodeEntry>> {
        self.call(Method::GET, "/nodes", &[]).await
    }

    async fn list_storage(&self, node: &str) -> UpstreamResult<Vec<StorageEntry>> {
        self.call(Method::GET, &format!("/nodes/{node}/storage"), &[]).await
    }

    async fn list_content(&self, node: &str, storage: &str, content: &str) -> UpstreamResult<Vec<ContentEntry>> {
        let path = format!("/nodes/{node}/storage/{storage}/content");
        self.call(Method::GET, &path, &[("content", content)]).await
    }

    async fn list_vm_resources(&self) -> UpstreamResult<Vec<VmResource>> {
        self.call(Method::GET, "/cluster/resources", &[("type", "vm")]).await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> UpstreamResult<RawConfig> {
        self.call(Method::GET, &format!("/nodes/{node}/qemu/{vmid}/config"), &[]).await
    }

    async fn set_vm_config(&self, node: &str, vmid: u32, key: &str, value: &str) -> UpstreamResult<()> {
        let path = format!("/nodes/{node}/qemu/{vmid}/config");
        let _: serde_json::Value = self.call(Method::PUT, &path, &[(key, value)]).await?;
        Ok(())
    }

    async fn start(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.lifecycle(node, vmid, "start", &[]).await
    }

    async fn stop(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.lifecycle(node, vmid, "stop", &[("skiplock", "1")]).await
    }

    async fn shutdown(&self, node: &str, vmid: u32) -> UpstreamResult<TaskId> {
        self.lifecycle(node, vmid, "shutdown", &[("forceStop", "1"), ("skiplock", "1")]).await
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> UpstreamResult<VmStatus> {
        self.call(Method::GET, &format!("/nodes/{node}/qemu/{vmid}/status/current"), &[]).await
    }

    async fn guest_os_info(&self, node: &str, vmid: u32) -> UpstreamResult<GuestOsInfo> {
        let path = format!("/nodes/{node}/qemu/{vmid}/agent/get-osinfo");
        let reply: AgentReply<GuestOsInfo> = self.call(Method::GET, &path, &[]).await?;
        Ok(reply.result)
    }
}

/// Strips the `{"data": ...}` envelope, or turns a non-2xx reply into [`UpstreamError::Api`].
async fn unwrap_data<T: DeserializeOwned>(resp: Response) -> UpstreamResult<T> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(UpstreamError::api(status.as_u16(), error_message(status, &body)));
    }
    serde_json::from_str::<Envelope<T>>(&body)
        .map(|e| e.data)
        .map_err(|e| UpstreamError::Decode(format!("{e} (body: {body})")))
}

fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    // PVE answers `{"data":null,"errors":{"param":"reason"}}` on validation failures
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(errors) = value.get("errors").and_then(|e| e.as_object()) {
            let joined: Vec<String> = errors
                .iter()
                .map(|(k, v)| format!("{k}: {}", v.as_str().unwrap_or_default().trim()))
                .collect();
            if !joined.is_empty() {
                return joined.join("; ");
            }
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.trim().to_string();
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() && !trimmed.starts_with('{') {
        return trimmed.to_string();
    }
    status.canonical_reason().unwrap_or("unknown error").to_string()
}
