//! Configuration for the search daemon.

mod agent;
mod daemon;
mod listen;
mod logging;

pub use agent::{parse_agent_line, parse_index_list, parse_strategy, AgentOptions};
pub use daemon::DaemonConfig;
pub use listen::{parse_listener, ListenerDesc, Proto};
pub use logging::{LogFormat, LogLevel, LoggingConfig};

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One `[index.<name>]` table: a locally served index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    #[serde(rename = "type", default = "default_index_type")]
    pub index_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub preopen: bool,
    #[serde(default)]
    pub killlist_targets: Vec<String>,
    #[serde(default)]
    pub rotation_priority: i32,
    /// Seed documents loaded at startup, `id => text`.
    #[serde(default)]
    pub seed_docs: BTreeMap<String, String>,
}

fn default_index_type() -> String {
    "rt".to_string()
}

/// One `[distributed.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedDef {
    #[serde(default)]
    pub locals: Vec<String>,
    /// Plain remote agents, one mirror set per line.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Agents whose replies are discarded.
    #[serde(default)]
    pub agents_blackhole: Vec<String>,
    /// Agents kept on persistent connections.
    #[serde(default)]
    pub agents_persistent: Vec<String>,
    #[serde(default = "default_strategy")]
    pub ha_strategy: String,
    #[serde(default)]
    pub agent_connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub agent_query_timeout_ms: Option<u64>,
    #[serde(default)]
    pub agent_retry_count: Option<usize>,
}

fn default_strategy() -> String {
    "random".to_string()
}

/// Root configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub index: BTreeMap<String, IndexDef>,
    #[serde(default)]
    pub distributed: BTreeMap<String, DistributedDef>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for spec in &self.daemon.listen {
            parse_listener(spec).with_context(|| format!("bad listen spec '{spec}'"))?;
        }
        for (name, def) in &self.index {
            crate::index::served::IndexType::parse(&def.index_type)
                .with_context(|| format!("index '{name}': unknown type '{}'", def.index_type))?;
        }
        for (name, def) in &self.distributed {
            parse_strategy(&def.ha_strategy)
                .with_context(|| format!("distributed index '{name}'"))?;
            let opts = AgentOptions::default();
            for line in def
                .agents
                .iter()
                .chain(&def.agents_blackhole)
                .chain(&def.agents_persistent)
            {
                parse_agent_line(line, &opts)
                    .with_context(|| format!("distributed index '{name}'"))?;
            }
            if def.locals.is_empty()
                && def.agents.is_empty()
                && def.agents_blackhole.is_empty()
                && def.agents_persistent.is_empty()
            {
                anyhow::bail!("distributed index '{name}' has no locals and no agents");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[daemon]
listen = ["127.0.0.1:9312", "127.0.0.1:9306:mysql41", "127.0.0.1:9308:http"]
max_packet_size = 1048576
persistent_pool_size = 2

[logging]
level = "debug"

[index.docs]
type = "rt"
path = "./data/docs"

[index.docs.seed_docs]
1 = "hello world"

[distributed.all]
locals = ["docs"]
agents = ["10.0.0.1:9312|10.0.0.2:9312:docs"]
ha_strategy = "avoid-dead-weighted"
agent_retry_count = 2
"#;

    #[test]
    fn sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon.listen.len(), 3);
        assert_eq!(config.daemon.persistent_pool_size, 2);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.index["docs"].seed_docs["1"], "hello world");
        assert_eq!(config.distributed["all"].agent_retry_count, Some(2));
    }

    #[test]
    fn bad_strategy_is_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config
            .distributed
            .get_mut("all")
            .unwrap()
            .ha_strategy = "fastest".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_distributed_index_is_rejected() {
        let toml_src = r#"
[distributed.hollow]
ha_strategy = "random"
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(config.validate().is_err());
    }
}
