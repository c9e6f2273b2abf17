use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_PROXY_TYPE: &str = "BUNGEE";

fn default_proxy_type() -> String {
    DEFAULT_PROXY_TYPE.into()
}

/// Static description of the fleet: server types, node tokens and nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Singleton type every linked node keeps exactly one instance of.
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    /// Every type that may be requested, in reconciliation order.
    #[serde(default)]
    pub server_types: Vec<String>,
    /// Opaque link token -> node id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            proxy_type: default_proxy_type(),
            server_types: Vec::new(),
            tokens: HashMap::new(),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub max_servers: usize,
    #[serde(default)]
    pub types: HashMap<String, TypeLimits>,
}

/// Replica bounds of one server type on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeLimits {
    #[serde(default)]
    pub min: usize,
    #[serde(default)]
    pub max: Option<usize>,
}

impl FleetConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(Error::InvalidConfig("node with an empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate node id {}", node.id)));
            }
            for (server_type, limits) in &node.types {
                if let Some(max) = limits.max
                    && limits.min > max
                {
                    return Err(Error::InvalidConfig(format!(
                        "node {}: min {} of type {server_type} exceeds max {max}",
                        node.id, limits.min
                    )));
                }
            }
        }

        if self.tokens.values().any(|id| id.trim().is_empty()) {
            return Err(Error::InvalidConfig("token mapped to an empty node id".into()));
        }

        Ok(())
    }

    /// Whether `server_type` may be requested at all.
    pub fn has_type(&self, server_type: &str) -> bool {
        self.server_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(server_type))
    }

    pub fn is_proxy(&self, server_type: &str) -> bool {
        self.proxy_type.eq_ignore_ascii_case(server_type)
    }

    /// Resolve the node id a link token authenticates as.
    pub fn node_for_token(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }
}

impl NodeConfig {
    fn limits(&self, server_type: &str) -> Option<&TypeLimits> {
        self.types
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(server_type))
            .map(|(_, limits)| limits)
    }

    /// Minimum number of instances of `server_type` this node should run.
    pub fn min_for(&self, server_type: &str) -> usize {
        self.limits(server_type).map_or(0, |l| l.min)
    }

    /// Maximum number of instances of `server_type` this node may run.
    pub fn max_for(&self, server_type: &str) -> usize {
        self.limits(server_type)
            .and_then(|l| l.max)
            .unwrap_or(self.max_servers)
    }
}

/// Where the fleet configuration comes from. Read again on every reload.
pub trait ConfigSource: Send + Sync + 'static {
    fn load(&self) -> Result<FleetConfig>;
}

/// JSON fleet configuration on disk.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<FleetConfig> {
        let raw = std::fs::read_to_string(&self.path)?;
        let config = FleetConfig::from_json(&raw)?;
        tracing::debug!(
            path = %self.path.display(),
            nodes = config.nodes.len(),
            types = config.server_types.len(),
            "loaded fleet config"
        );
        Ok(config)
    }
}

/// In-memory configuration, replaceable at runtime.
pub struct StaticConfigSource {
    config: RwLock<FleetConfig>,
}

impl StaticConfigSource {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn set(&self, config: FleetConfig) {
        *self.config.write() = config;
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<FleetConfig> {
        let config = self.config.read().clone();
        config.validate()?;
        Ok(config)
    }
}
