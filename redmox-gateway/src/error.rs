//! Error taxonomy of the gateway and of the hypervisor client boundary.

use std::fmt;

/// Fault reported by the hypervisor client layer.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-2xx reply; `message` is the hypervisor's own text, kept verbatim.
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        UpstreamError::Api { status, message: message.into() }
    }
}

/// Kind of resource a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Vm,
    Iso,
    Session,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Vm => f.write_str("VM"),
            ResourceKind::Iso => f.write_str("ISO"),
            ResourceKind::Session => f.write_str("session"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("no VM mapped to host {0}")]
    UnknownHost(String),
    #[error("{kind} {id} not found")]
    ResourceNotFound { kind: ResourceKind, id: String },
    #[error("media {media} is not mounted on VM {vmid}")]
    MediaNotMounted { vmid: u32, media: String },
    #[error("timeout powering off VM {vmid} after {attempts} status polls")]
    PowerActionTimeout { vmid: u32, attempts: u32 },
    #[error("request cancelled")]
    Cancelled,
    #[error("unsupported value: {0}")]
    Unsupported(String),
    #[error("upstream fault: {0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    pub fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        GatewayError::ResourceNotFound { kind, id: id.to_string() }
    }

    /// Stable machine-readable code carried in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "AuthenticationError",
            GatewayError::UnknownHost(_) => "UnknownHost",
            GatewayError::ResourceNotFound { .. } => "ResourceNotFound",
            GatewayError::MediaNotMounted { .. } => "MediaNotMounted",
            GatewayError::PowerActionTimeout { .. } => "PowerActionTimeout",
            GatewayError::Cancelled => "Cancelled",
            GatewayError::Unsupported(_) => "Unsupported",
            GatewayError::Upstream(_) => "UpstreamFault",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_verbatim() {
        let err = GatewayError::from(UpstreamError::api(500, "VM 100 not running"));
        assert_eq!(err.code(), "UpstreamFault");
        assert_eq!(err.to_string(), "upstream fault: VM 100 not running");
    }

    #[test]
    fn test_not_found_display() {
        let err = GatewayError::not_found(ResourceKind::Iso, "debian.iso");
        assert_eq!(err.to_string(), "ISO debian.iso not found");
    }
}
