//! Listener endpoint grammar:
//!
//! ```text
//! listen := (address ":" port | port | path | address ":" portStart "-" portEnd) [":" protocol] ["_vip"]
//! protocol := "sphinx" | "mysql41" | "http" | "replication"
//! ```
//!
//! The canonical formatting round-trips: `parse_listener(d.to_string()) == d`
//! for every accepted descriptor.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::wire::API_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    /// The legacy binary search protocol.
    Sphinx,
    Mysql41,
    Http,
    Replication,
}

impl Proto {
    pub fn parse(s: &str) -> Option<Proto> {
        Some(match s {
            "sphinx" => Proto::Sphinx,
            "mysql41" => Proto::Mysql41,
            "http" => Proto::Http,
            "replication" => Proto::Replication,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Proto::Sphinx => "sphinx",
            Proto::Mysql41 => "mysql41",
            Proto::Http => "http",
            Proto::Replication => "replication",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDesc {
    pub proto: Proto,
    /// Local-socket path; when set, ip/port are unused.
    pub unix_path: Option<PathBuf>,
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Non-zero for a port range starting at `port`.
    pub ports_count: u16,
    pub vip: bool,
}

impl Default for ListenerDesc {
    fn default() -> Self {
        Self {
            proto: Proto::Sphinx,
            unix_path: None,
            ip: Ipv4Addr::UNSPECIFIED,
            port: API_PORT,
            ports_count: 0,
            vip: false,
        }
    }
}

impl fmt::Display for ListenerDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.unix_path {
            write!(f, "{}:{}", path.display(), self.proto)?;
        } else if self.ports_count > 0 {
            write!(
                f,
                "{}:{}-{}:{}",
                self.ip,
                self.port,
                self.port + self.ports_count,
                self.proto
            )?;
        } else {
            write!(f, "{}:{}:{}", self.ip, self.port, self.proto)?;
        }
        if self.vip {
            write!(f, "_vip")?;
        }
        Ok(())
    }
}

fn check_port(port: i64) -> Result<u16> {
    if !(1..=0xffff).contains(&port) {
        bail!("port {port} is out of range");
    }
    Ok(port as u16)
}

/// Split a protocol part like `mysql41` or `http_vip` into the descriptor.
fn apply_proto(part: &str, desc: &mut ListenerDesc) -> Result<()> {
    let lower = part.to_lowercase();
    let mut pieces = lower.split('_');
    let name = pieces.next().unwrap_or("");
    desc.proto = Proto::parse(name).ok_or_else(|| anyhow!("unknown listen protocol type '{part}'"))?;
    match pieces.next() {
        None => Ok(()),
        Some("vip") if pieces.next().is_none() => {
            desc.vip = true;
            Ok(())
        }
        _ => bail!("unknown listen protocol type '{part}'"),
    }
}

fn parse_addr(s: &str) -> Result<Ipv4Addr> {
    if s.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(ip) = s.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    // hostname: resolve once at config time
    use std::net::ToSocketAddrs;
    let addrs = (s, 0u16)
        .to_socket_addrs()
        .map_err(|_| anyhow!("no AF_INET address found for: {s}"))?;
    addrs
        .filter_map(|a| match a {
            std::net::SocketAddr::V4(sa) => Some(*sa.ip()),
            _ => None,
        })
        .next()
        .ok_or_else(|| anyhow!("no AF_INET address found for: {s}"))
}

/// Parse one `listen =` specification.
pub fn parse_listener(spec: &str) -> Result<ListenerDesc> {
    let mut desc = ListenerDesc::default();

    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() > 3 {
        bail!("invalid listen format (too many fields)");
    }

    // local socket: path on its own, or path:proto
    if spec.starts_with('/') {
        if parts.len() > 2 {
            bail!("invalid listen format (too many fields)");
        }
        if parts.len() == 2 {
            apply_proto(parts[1], &mut desc)?;
        }
        desc.unix_path = Some(PathBuf::from(parts[0]));
        return Ok(desc);
    }

    let first = parts[0];
    let all_digits = !first.is_empty() && first.chars().all(|c| c.is_ascii_digit());
    let lone_port = if all_digits && first.len() <= 5 {
        Some(check_port(first.parse::<i64>().unwrap_or(0))?)
    } else {
        None
    };

    match parts.len() {
        // one part: a bare port or a bare address
        1 => {
            if let Some(port) = lone_port {
                desc.port = port;
            } else {
                desc.ip = parse_addr(first)?;
            }
            Ok(desc)
        }
        // port:proto
        2 if lone_port.is_some() => {
            desc.port = lone_port.unwrap();
            apply_proto(parts[1], &mut desc)?;
            Ok(desc)
        }
        // address:port[-portEnd][:proto]
        _ => {
            if parts.len() == 3 {
                apply_proto(parts[2], &mut desc)?;
            }
            desc.ip = parse_addr(first)?;
            let ports: Vec<&str> = parts[1].split('-').collect();
            desc.port = check_port(ports[0].parse::<i64>().unwrap_or(0))?;
            if ports.len() == 2 {
                let end = check_port(ports[1].parse::<i64>().unwrap_or(0))?;
                if end <= desc.port {
                    bail!("ports range invalid {}-{}", desc.port, end);
                }
                if end - desc.port < 2 {
                    bail!(
                        "ports range {}-{} count should be at least 2, got {}",
                        desc.port,
                        end,
                        end - desc.port
                    );
                }
                desc.ports_count = end - desc.port;
            } else if ports.len() > 2 {
                bail!("invalid listen format (bad port range)");
            }
            Ok(desc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port() {
        let d = parse_listener("9312").unwrap();
        assert_eq!(d.port, 9312);
        assert_eq!(d.ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(d.proto, Proto::Sphinx);
        assert!(!d.vip);
    }

    #[test]
    fn address_port_proto() {
        let d = parse_listener("127.0.0.1:9306:mysql41").unwrap();
        assert_eq!(d.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(d.port, 9306);
        assert_eq!(d.proto, Proto::Mysql41);
    }

    #[test]
    fn vip_suffix() {
        let d = parse_listener("9312:sphinx_vip").unwrap();
        assert!(d.vip);
        assert_eq!(d.proto, Proto::Sphinx);
        assert!(parse_listener("9312:sphinx_bogus").is_err());
    }

    #[test]
    fn unix_path_with_proto() {
        let d = parse_listener("/var/run/seekd.sock:http").unwrap();
        assert_eq!(d.unix_path.as_deref(), Some(std::path::Path::new("/var/run/seekd.sock")));
        assert_eq!(d.proto, Proto::Http);
    }

    #[test]
    fn port_range() {
        let d = parse_listener("127.0.0.1:9320-9328:replication").unwrap();
        assert_eq!(d.port, 9320);
        assert_eq!(d.ports_count, 8);
        assert_eq!(d.proto, Proto::Replication);

        assert!(parse_listener("127.0.0.1:9328-9320").is_err());
        assert!(parse_listener("127.0.0.1:9320-9321").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_listener("a:b:c:d").is_err());
        assert!(parse_listener("0").is_err());
        assert!(parse_listener("99999").is_err());
        assert!(parse_listener("9312:smtp").is_err());
    }

    #[test]
    fn format_parse_roundtrip() {
        let specs = [
            "9312",
            "127.0.0.1:9306:mysql41",
            "0.0.0.0:9308:http_vip",
            "/tmp/seekd.sock:sphinx",
            "10.1.2.3:9320-9330:sphinx",
            "9312:sphinx_vip",
        ];
        for spec in specs {
            let desc = parse_listener(spec).unwrap();
            let reparsed = parse_listener(&desc.to_string()).unwrap();
            assert_eq!(desc, reparsed, "spec {spec} did not round-trip");
        }
    }
}
