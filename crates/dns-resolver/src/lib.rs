//! Name resolution for the server: forward lookups used by policy
//! hooks to validate greeting names, and reverse lookups used to
//! label connecting peers.
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("{0}: no records found")]
    NotFound(String),
    #[error("{0}: lookup timed out")]
    Timeout(String),
    #[error("{name}: {reason}")]
    Other { name: String, reason: String },
}

impl DnsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve a host name to its A and AAAA addresses
    async fn resolve_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// Resolve an address to the names published in its PTR records.
    /// Names are returned without the trailing dot.
    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError>;
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A resolver backed by the system configuration, via hickory.
pub struct HickoryResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|err| DnsError::Other {
                name: "system configuration".to_string(),
                reason: format!("{err:#}"),
            })?
            .build();
        Ok(Self {
            resolver,
            timeout: Duration::from_secs(10),
        })
    }

    /// Bound the total time spent on a single lookup
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn map_error(name: &str, err: hickory_resolver::ResolveError) -> DnsError {
        if err.is_nx_domain() || err.is_no_records_found() {
            DnsError::NotFound(name.to_string())
        } else {
            DnsError::Other {
                name: name.to_string(),
                reason: format!("{err:#}"),
            }
        }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(name))
            .await
            .map_err(|_| DnsError::Timeout(name.to_string()))?
            .map_err(|err| Self::map_error(name, err))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(DnsError::NotFound(name.to_string()));
        }
        Ok(addrs)
    }

    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        let label = addr.to_string();
        let lookup = tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(addr))
            .await
            .map_err(|_| DnsError::Timeout(label.clone()))?
            .map_err(|err| Self::map_error(&label, err))?;
        let names: Vec<String> = lookup
            .iter()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .collect();
        if names.is_empty() {
            return Err(DnsError::NotFound(label));
        }
        Ok(names)
    }
}

/// An in-memory resolver with a fixed set of answers.
/// Anything not explicitly registered resolves as not found.
#[derive(Default, Debug, Clone)]
pub struct TestResolver {
    ips: HashMap<String, Vec<IpAddr>>,
    ptrs: HashMap<IpAddr, Vec<String>>,
}

impl TestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, name: &str, addr: IpAddr) -> Self {
        self.ips.entry(normalize_name(name)).or_default().push(addr);
        self
    }

    pub fn with_ptr(mut self, addr: IpAddr, name: &str) -> Self {
        self.ptrs
            .entry(addr)
            .or_default()
            .push(name.trim_end_matches('.').to_string());
        self
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.ips
            .get(&normalize_name(name))
            .cloned()
            .ok_or_else(|| DnsError::NotFound(name.to_string()))
    }

    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        self.ptrs
            .get(&addr)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(addr.to_string()))
    }
}
