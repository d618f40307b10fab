use crate::config::SocketType;
use serde::Serialize;
use std::net::IpAddr;

/// Read-only snapshot of a running listener, for management
/// consumers that want to display or export it.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_type: &'static str,
    pub port: u16,
    pub bind_address: Option<IpAddr>,
    pub socket_type: SocketType,
    pub enabled: bool,
    pub hello_name: String,
    pub connection_limit: Option<usize>,
    pub connection_limit_per_source: Option<usize>,
    pub active_connections: usize,
}

impl ServiceInfo {
    pub const SERVICE_TYPE: &'static str = "SMTP Service";

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
