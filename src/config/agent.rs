//! Agent line grammar: `host[:port][:idx1,idx2]` with `|`-separated mirrors.
//! Mirrors that omit their index list inherit it from the last mirror that
//! spells one out, so `a:9312|b:9312:shard` targets `shard` on both.

use anyhow::{anyhow, bail, Result};

use crate::agent::desc::{AgentDesc, HostDesc, DEFAULT_AGENT_PORT};
use crate::agent::mirror::Strategy;

/// Options applied to every agent line of one distributed index.
#[derive(Debug, Clone, Copy)]
pub struct AgentOptions {
    pub blackhole: bool,
    pub persistent: bool,
    pub strategy: Strategy,
    pub retry_count: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            blackhole: false,
            persistent: false,
            strategy: Strategy::default(),
            retry_count: 0,
        }
    }
}

/// Parse `idx1,idx2` into a trimmed, non-empty list.
pub fn parse_index_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_one_mirror(spec: &str, opts: &AgentOptions) -> Result<AgentDesc> {
    let spec = spec.trim();
    if spec.is_empty() {
        bail!("empty agent specification");
    }

    let (mut host, rest) = if let Some(stripped) = spec.strip_prefix('/') {
        // local socket: path[:indexes]
        let mut parts = stripped.splitn(2, ':');
        let path = format!("/{}", parts.next().unwrap_or_default());
        (HostDesc::unix(path), parts.next())
    } else {
        let mut parts = spec.splitn(3, ':');
        let addr = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("agent '{spec}': missing host"))?;
        match parts.next() {
            None => (HostDesc::inet(addr, DEFAULT_AGENT_PORT), None),
            Some(second) => {
                if let Ok(port) = second.parse::<u16>() {
                    if port == 0 {
                        bail!("agent '{spec}': port 0 is out of range");
                    }
                    (HostDesc::inet(addr, port), parts.next())
                } else {
                    // no port given; the second field is the index list
                    if parts.next().is_some() {
                        bail!("agent '{spec}': expected host[:port][:indexes]");
                    }
                    (HostDesc::inet(addr, DEFAULT_AGENT_PORT), Some(second))
                }
            }
        }
    };

    host.blackhole = opts.blackhole;
    host.persistent = opts.persistent;
    let indexes = rest.map(parse_index_list).unwrap_or_default();
    Ok(AgentDesc::new(host, indexes))
}

/// Parse a full agent line into its mirror set.
pub fn parse_agent_line(line: &str, opts: &AgentOptions) -> Result<Vec<AgentDesc>> {
    let mut mirrors: Vec<AgentDesc> = line
        .split('|')
        .map(|m| parse_one_mirror(m, opts))
        .collect::<Result<_>>()?;

    // propagate the trailing index list to mirrors that omitted theirs
    let shared = mirrors
        .iter()
        .rev()
        .find(|m| !m.indexes.is_empty())
        .map(|m| m.indexes.clone())
        .ok_or_else(|| anyhow!("agent '{line}': no remote index list given"))?;
    for mirror in mirrors.iter_mut() {
        if mirror.indexes.is_empty() {
            mirror.indexes = shared.clone();
        }
    }
    Ok(mirrors)
}

/// Parse an `ha_strategy` value.
pub fn parse_strategy(name: &str) -> Result<Strategy> {
    Strategy::parse(name).ok_or_else(|| anyhow!("unknown ha_strategy '{name}'"))
}
