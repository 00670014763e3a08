//! Remote host and agent (mirror) descriptors.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::NetError;
use crate::net::socket::{resolve, HostAddr};
use crate::wire::API_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFamily {
    Inet,
    Unix,
}

/// Generic descriptor of a remote host.
#[derive(Debug, Clone)]
pub struct HostDesc {
    pub family: HostFamily,
    /// Remote host name or IP, or the filesystem path for a local socket.
    pub addr: String,
    pub port: u16,
    /// Cached resolver result; ignored when `needs_resolve` is set.
    pub resolved: Option<Ipv4Addr>,
    /// Re-resolve the name on every connect instead of keeping the cache.
    pub needs_resolve: bool,
    pub blackhole: bool,
    pub persistent: bool,
}

impl HostDesc {
    pub fn inet(addr: impl Into<String>, port: u16) -> Self {
        Self {
            family: HostFamily::Inet,
            addr: addr.into(),
            port,
            resolved: None,
            needs_resolve: false,
            blackhole: false,
            persistent: false,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            family: HostFamily::Unix,
            addr: path.into(),
            port: 0,
            resolved: None,
            needs_resolve: false,
            blackhole: false,
            persistent: false,
        }
    }

    /// Key into the dashboard registry. Dashboards are the canonical owner of
    /// host identity; descriptors refer to them by this key.
    pub fn dash_key(&self) -> String {
        match self.family {
            HostFamily::Inet => format!("{}:{}", self.addr, self.port),
            HostFamily::Unix => format!("unix:{}", self.addr),
        }
    }

    pub fn url(&self) -> String {
        self.dash_key()
    }

    /// Resolve this host into a connect target.
    pub async fn connect_target(&self) -> Result<HostAddr, NetError> {
        match self.family {
            HostFamily::Unix => Ok(HostAddr::Unix(PathBuf::from(&self.addr))),
            HostFamily::Inet => {
                let ip = match (self.resolved, self.needs_resolve) {
                    (Some(ip), false) => ip,
                    _ => resolve(&self.addr, false).await?,
                };
                Ok(HostAddr::Inet(std::net::SocketAddr::from((ip, self.port))))
            }
        }
    }
}

/// Mirror descriptor: a host plus the remote index names it serves.
#[derive(Debug, Clone)]
pub struct AgentDesc {
    pub host: HostDesc,
    pub indexes: Vec<String>,
}

impl AgentDesc {
    pub fn new(host: HostDesc, indexes: Vec<String>) -> Self {
        Self { host, indexes }
    }

    /// Comma-joined remote index list as it travels on the wire.
    pub fn index_list(&self) -> String {
        self.indexes.join(",")
    }
}

/// Default agent port when the config line omits one.
pub const DEFAULT_AGENT_PORT: u16 = API_PORT;
