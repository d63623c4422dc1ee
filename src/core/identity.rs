//! Client identity resolution.
//!
//! Forwarding headers are honored without checking that they were set by a
//! trusted proxy, so any client can choose its own identity by sending
//! `X-Forwarded-For`. Deployments must strip or overwrite the header at the
//! edge. Clients with no usable address all share the `unknown` identity.

use crate::core::request::RequestDescriptor;
use crate::models::IdentityConfig;

pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Default)]
pub struct ClientIdentityResolver {
    config: IdentityConfig,
}

impl ClientIdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// First forwarded-for hop, then the real-IP header, then the peer address.
    pub fn resolve(&self, req: &RequestDescriptor) -> String {
        req.header(&self.config.forwarded_for_header)
            .and_then(|value| value.split(',').next())
            .and_then(non_empty)
            .or_else(|| req.header(&self.config.real_ip_header).and_then(non_empty))
            .or_else(|| req.remote_addr.as_deref().and_then(non_empty).map(strip_port))
            .unwrap_or(UNKNOWN_CLIENT)
            .to_string()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// `1.2.3.4:5678` -> `1.2.3.4`; `[::1]:80` -> `::1`. Bare addresses pass through.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}
