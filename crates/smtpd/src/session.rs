//! Per-connection state.
//!
//! A `Session` is owned by the task serving its connection; nothing
//! else reads or mutates it. State is split into a connection scope
//! that lives until the socket closes, and a transaction scope that
//! is cleared by HELO/EHLO, RSET and the end of each message.
use crate::config::SmtpServerConfig;
use rfc5321::{ForwardPath, ReversePath};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeloMode {
    Helo,
    Ehlo,
}

impl HeloMode {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeloInfo {
    pub mode: HeloMode,
    pub name: String,
}

/// Protocol settings shared by every session of a listener
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hello_name: String,
    pub helo_ehlo_enforcement: bool,
    pub address_brackets_enforcement: bool,
    pub default_domain: String,
    /// 0 means unlimited
    pub max_message_size: u64,
}

impl SessionSettings {
    pub fn from_config(config: &SmtpServerConfig) -> Self {
        Self {
            hello_name: config.hello_name.resolve(),
            helo_ehlo_enforcement: config.helo_ehlo_enforcement,
            address_brackets_enforcement: config.address_brackets_enforcement,
            default_domain: config.default_domain.clone(),
            max_message_size: config.max_message_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    pub helo: Option<HeloInfo>,
    /// Set by external authentication collaborators
    pub authenticated_user: Option<String>,
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct TransactionState {
    pub sender: Option<ReversePath>,
    pub recipients: Vec<ForwardPath>,
    /// From the SIZE parameter of MAIL FROM
    pub declared_size: Option<u64>,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl TransactionState {
    pub fn is_empty(&self) -> bool {
        self.sender.is_none()
            && self.recipients.is_empty()
            && self.declared_size.is_none()
            && self.attributes.is_empty()
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    /// Reverse DNS name of the peer, or its textual address
    pub remote_host: String,
    pub local_addr: SocketAddr,
    /// The peer is within the authorized networks
    pub trusted: bool,
    pub secure: bool,
    pub settings: Arc<SessionSettings>,
    pub connection: ConnectionState,
    pub transaction: TransactionState,
}

impl Session {
    pub fn new(
        remote_addr: SocketAddr,
        remote_host: String,
        local_addr: SocketAddr,
        trusted: bool,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            remote_host,
            local_addr,
            trusted,
            secure: false,
            settings,
            connection: ConnectionState::default(),
            transaction: TransactionState::default(),
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip().to_canonical()
    }

    pub fn hello_name(&self) -> &str {
        &self.settings.hello_name
    }

    pub fn reset_transaction(&mut self) {
        self.transaction = TransactionState::default();
    }
}
