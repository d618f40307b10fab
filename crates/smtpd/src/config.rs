use crate::hooks::CapabilityKind;
use anyhow::Context;
use cidr::AnyIpCidr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The daemon configuration file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub smtp: SmtpServerConfig,

    /// Worker pool name to thread count
    #[serde(default)]
    pub thread_pools: HashMap<String, usize>,

    #[serde(default)]
    pub hooks: HooksConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.smtp.validate()?;
        if self.hooks.max_rcpt == Some(0) {
            anyhow::bail!("hooks.max_rcpt must be at least 1; omit it for no limit");
        }
        for (name, &threads) in &self.thread_pools {
            if threads == 0 {
                anyhow::bail!("thread_pools.{name} must have at least 1 thread");
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    #[default]
    Plain,
    Secure,
}

/// Either a fixed name, or a request to use the machine host name.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum HelloNameConfig {
    Fixed(String),
    Detect {
        #[serde(default)]
        autodetect: bool,
        #[serde(default)]
        name: Option<String>,
    },
}

impl Default for HelloNameConfig {
    fn default() -> Self {
        Self::Detect {
            autodetect: true,
            name: None,
        }
    }
}

impl HelloNameConfig {
    pub fn resolve(&self) -> String {
        match self {
            Self::Fixed(name) => name.clone(),
            Self::Detect {
                autodetect: false,
                name: Some(name),
            } => name.clone(),
            Self::Detect {
                autodetect: true, ..
            } => {
                let host = gethostname::gethostname().to_string_lossy().to_string();
                if host.is_empty() {
                    "localhost".to_string()
                } else {
                    host
                }
            }
            Self::Detect { name: None, .. } => "localhost".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HandlerPoolConfig {
    /// How long to wait for a free handler when the pool is bounded.
    /// Zero refuses the connection immediately.
    #[serde(
        default = "HandlerPoolConfig::default_acquire_timeout",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Duration,

    #[serde(default = "HandlerPoolConfig::default_max_idle")]
    pub max_idle: usize,

    #[serde(
        default = "HandlerPoolConfig::default_idle_timeout",
        with = "humantime_serde"
    )]
    pub idle_timeout: Duration,
}

impl HandlerPoolConfig {
    fn default_acquire_timeout() -> Duration {
        Duration::from_secs(30)
    }
    fn default_max_idle() -> usize {
        30
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for HandlerPoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Self::default_acquire_timeout(),
            max_idle: Self::default_max_idle(),
            idle_timeout: Self::default_idle_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SmtpServerConfig {
    #[serde(default = "SmtpServerConfig::default_enabled")]
    pub enabled: bool,

    #[serde(default = "SmtpServerConfig::default_port")]
    pub port: u16,

    /// Unset means all interfaces
    #[serde(default)]
    pub bind_address: Option<IpAddr>,

    #[serde(default = "SmtpServerConfig::default_backlog")]
    pub backlog: u32,

    #[serde(
        default = "SmtpServerConfig::default_connection_timeout",
        with = "humantime_serde"
    )]
    pub connection_timeout: Duration,

    #[serde(default)]
    pub connection_limit: Option<usize>,

    #[serde(default)]
    pub connection_limit_per_source: Option<usize>,

    #[serde(default)]
    pub hello_name: HelloNameConfig,

    #[serde(default)]
    pub socket_type: SocketType,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    #[serde(default = "SmtpServerConfig::default_thread_pool")]
    pub thread_pool: String,

    /// 0 means unlimited
    #[serde(default)]
    pub max_message_size: u64,

    #[serde(default = "SmtpServerConfig::default_true")]
    pub helo_ehlo_enforcement: bool,

    #[serde(default = "SmtpServerConfig::default_true")]
    pub address_brackets_enforcement: bool,

    #[serde(default = "SmtpServerConfig::default_domain")]
    pub default_domain: String,

    #[serde(default = "SmtpServerConfig::default_authorized_networks")]
    pub authorized_networks: Vec<AnyIpCidr>,

    #[serde(default = "SmtpServerConfig::default_true")]
    pub resolve_remote_host: bool,

    #[serde(
        default = "SmtpServerConfig::default_shutdown_grace",
        with = "humantime_serde"
    )]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub handler_pool: HandlerPoolConfig,
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            port: Self::default_port(),
            bind_address: None,
            backlog: Self::default_backlog(),
            connection_timeout: Self::default_connection_timeout(),
            connection_limit: None,
            connection_limit_per_source: None,
            hello_name: HelloNameConfig::default(),
            socket_type: SocketType::default(),
            tls_certificate: None,
            tls_private_key: None,
            thread_pool: Self::default_thread_pool(),
            max_message_size: 0,
            helo_ehlo_enforcement: true,
            address_brackets_enforcement: true,
            default_domain: Self::default_domain(),
            authorized_networks: Self::default_authorized_networks(),
            resolve_remote_host: true,
            shutdown_grace: Self::default_shutdown_grace(),
            handler_pool: HandlerPoolConfig::default(),
        }
    }
}

impl SmtpServerConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_port() -> u16 {
        25
    }
    fn default_backlog() -> u32 {
        5
    }
    fn default_connection_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_thread_pool() -> String {
        server_runtime::DEFAULT_POOL.to_string()
    }
    fn default_true() -> bool {
        true
    }
    fn default_domain() -> String {
        "localhost".to_string()
    }
    fn default_authorized_networks() -> Vec<AnyIpCidr> {
        ["127.0.0.0/8", "::1/128"]
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect()
    }
    fn default_shutdown_grace() -> Duration {
        Duration::from_secs(30)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_limit == Some(0) {
            anyhow::bail!("smtp.connection_limit must be at least 1; omit it for no limit");
        }
        if self.connection_limit_per_source == Some(0) {
            anyhow::bail!(
                "smtp.connection_limit_per_source must be at least 1; omit it for no limit"
            );
        }
        if self.backlog == 0 {
            anyhow::bail!("smtp.backlog must be at least 1");
        }
        if self.connection_timeout.is_zero() {
            anyhow::bail!("smtp.connection_timeout must be greater than zero");
        }
        if self.tls_certificate.is_some() != self.tls_private_key.is_some() {
            anyhow::bail!("smtp.tls_certificate and smtp.tls_private_key must be set together");
        }
        Ok(())
    }

    /// Whether the peer address falls within authorized_networks
    pub fn is_authorized(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.authorized_networks
            .iter()
            .any(|cidr| cidr.contains(&addr))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolvableHeloConfig {
    /// Apply the check to authorized networks as well
    #[serde(default)]
    pub check_authorized_networks: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    #[serde(default)]
    pub resolvable_helo: Option<ResolvableHeloConfig>,

    #[serde(default)]
    pub max_rcpt: Option<usize>,

    /// Capabilities that must have at least one registered hook
    #[serde(default)]
    pub required: Vec<CapabilityKind>,
}
