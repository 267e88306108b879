//! Node Configuration Module
//!
//! Loads node configuration from compiled defaults, an optional TOML file and
//! `NODE__`-prefixed environment variables, in that order of precedence.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Environment variable prefix, e.g. `NODE__CLUSTER__PORT=25521`
pub const ENV_PREFIX: &str = "NODE";

/// Time a downed singleton holder is given to stop its instance
pub const STEP_DOWN_ALLOWANCE_MS: u64 = 1_000;

/// Main node configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub system: SystemConfig,
    pub supervision: SupervisionConfig,
    pub persistence: PersistenceConfig,
    pub cluster: ClusterConfig,
    pub relay: RelayConfig,
}

/// Actor system settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub log_level: String,
    /// Permits for work piped back into actors from blocking or long-running tasks
    pub worker_pool_size: usize,
    pub ask_timeout_ms: u64,
}

/// Default supervisor restart limits
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisionConfig {
    pub max_restarts: u32,
    pub within_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Save a snapshot every N events; 0 disables snapshots
    pub snapshot_every: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub hostname: String,
    pub port: u16,
    /// `host:port` addresses contacted on startup
    pub seed_nodes: Vec<String>,
    pub roles: Vec<String>,
    pub singleton: SingletonConfig,
    pub split_brain: SplitBrainConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SingletonConfig {
    /// Messages kept while no singleton holder is known
    pub buffer_size: usize,
    /// Only members with this role may host singletons
    pub role: Option<String>,
    /// Delay between observing the previous holder downed and taking over.
    /// Never shorter than the split-brain stable period plus the step-down allowance.
    pub down_removal_margin_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SplitBrainStrategyKind {
    Off,
    KeepMajority,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SplitBrainConfig {
    pub strategy: SplitBrainStrategyKind,
    /// Unreachability must be stable this long before a decision is made
    pub stable_after_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Heartbeat delivered to local subscribers; 0 disables
    pub heartbeat_interval_secs: u64,
    /// Out-of-order sequence numbers remembered per origin node
    pub dedup_window: usize,
    /// Own events kept for replay to peers that missed them
    pub replay_window: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "cluster-node".to_string(),
            log_level: "info".to_string(),
            worker_pool_size: 4,
            ask_timeout_ms: 3_000,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            within_secs: 60,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { snapshot_every: 10 }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 25520,
            seed_nodes: vec!["127.0.0.1:25520".to_string()],
            roles: Vec::new(),
            singleton: SingletonConfig::default(),
            split_brain: SplitBrainConfig::default(),
        }
    }
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1_000,
            role: None,
            down_removal_margin_ms: SplitBrainConfig::default().stable_after_ms
                + STEP_DOWN_ALLOWANCE_MS,
        }
    }
}

impl Default for SplitBrainConfig {
    fn default() -> Self {
        Self {
            strategy: SplitBrainStrategyKind::KeepMajority,
            stable_after_ms: 20_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            dedup_window: 1_024,
            replay_window: 1_024,
        }
    }
}

impl NodeConfig {
    /// Load configuration with optional file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading node config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        } else {
            debug!("No config file given, using defaults");
        }

        // Override with environment variables (NODE__ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.seed_nodes")
                .with_list_parse_key("cluster.roles")
                .try_parsing(true),
        );

        let config: NodeConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.system.name.trim().is_empty() {
            bail!("system.name must not be empty");
        }
        if self.system.worker_pool_size == 0 {
            bail!("system.worker_pool_size must be at least 1");
        }
        if self.system.ask_timeout_ms == 0 {
            bail!("system.ask_timeout_ms must be positive");
        }
        if self.supervision.within_secs == 0 {
            bail!("supervision.within_secs must be positive");
        }
        if self.cluster.hostname.trim().is_empty() {
            bail!("cluster.hostname must not be empty");
        }
        if self.cluster.singleton.buffer_size == 0 {
            bail!("cluster.singleton.buffer_size must be at least 1");
        }
        for seed in &self.cluster.seed_nodes {
            let valid = seed
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                bail!("cluster.seed_nodes entry '{}' is not host:port", seed);
            }
        }
        Ok(())
    }

    /// Singleton takeover delay after a holder is downed. A minority holder
    /// downs itself once its resolver has been stable for `stable_after_ms`,
    /// so a majority node must not take over before then.
    pub fn singleton_takeover_margin_ms(&self) -> u64 {
        let floor = match self.cluster.split_brain.strategy {
            SplitBrainStrategyKind::Off => 0,
            SplitBrainStrategyKind::KeepMajority => {
                self.cluster.split_brain.stable_after_ms + STEP_DOWN_ALLOWANCE_MS
            }
        };
        self.cluster.singleton.down_removal_margin_ms.max(floor)
    }

    /// Address this node binds to, as `host:port`
    pub fn self_address(&self) -> String {
        format!("{}:{}", self.cluster.hostname, self.cluster.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.persistence.snapshot_every, 10);
        assert_eq!(config.supervision.max_restarts, 5);
        assert_eq!(config.cluster.port, 25520);
        assert_eq!(config.cluster.singleton.buffer_size, 1_000);
        assert_eq!(config.relay.heartbeat_interval_secs, 30);
        assert_eq!(config.cluster.singleton.down_removal_margin_ms, 21_000);
        assert_eq!(config.self_address(), "127.0.0.1:25520");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file_with_partial_sections() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("node.toml");

        let config_content = r#"
[system]
name = "test-node"
log_level = "debug"

[persistence]
snapshot_every = 25

[cluster]
port = 25521
seed_nodes = ["127.0.0.1:25520", "127.0.0.1:25521"]
roles = ["backend"]

[cluster.split_brain]
strategy = "off"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = NodeConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.system.name, "test-node");
        assert_eq!(config.system.log_level, "debug");
        // untouched keys keep their defaults
        assert_eq!(config.system.ask_timeout_ms, 3_000);
        assert_eq!(config.persistence.snapshot_every, 25);
        assert_eq!(config.cluster.port, 25521);
        assert_eq!(config.cluster.seed_nodes.len(), 2);
        assert_eq!(config.cluster.roles, vec!["backend".to_string()]);
        assert_eq!(config.cluster.split_brain.strategy, SplitBrainStrategyKind::Off);
        assert_eq!(config.cluster.split_brain.stable_after_ms, 20_000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(NodeConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = NodeConfig::from_toml_str("[system]\nworker_pool_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("worker_pool_size"));

        let err = NodeConfig::from_toml_str("[cluster]\nseed_nodes = [\"nohost\"]\n").unwrap_err();
        assert!(err.to_string().contains("nohost"));
    }

    #[test]
    fn test_takeover_margin_covers_split_brain_decision() {
        let mut config = NodeConfig::default();
        config.cluster.singleton.down_removal_margin_ms = 0;
        config.cluster.split_brain.stable_after_ms = 50;
        assert_eq!(config.singleton_takeover_margin_ms(), 50 + STEP_DOWN_ALLOWANCE_MS);

        config.cluster.singleton.down_removal_margin_ms = 5_000;
        assert_eq!(config.singleton_takeover_margin_ms(), 5_000);

        config.cluster.singleton.down_removal_margin_ms = 0;
        config.cluster.split_brain.strategy = SplitBrainStrategyKind::Off;
        assert_eq!(config.singleton_takeover_margin_ms(), 0);
    }

    #[test]
    fn test_toml_roundtrip_of_effective_config() {
        let mut config = NodeConfig::default();
        config.cluster.singleton.role = Some("singleton-host".to_string());
        let rendered = config.to_toml_string().unwrap();
        let parsed = NodeConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
