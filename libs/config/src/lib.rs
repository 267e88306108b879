//! # Node Configuration
//!
//! Centralized configuration for cluster nodes. Every runtime crate in the
//! workspace reads its tunables from one section of [`NodeConfig`]:
//!
//! - **system**: actor system name, log level, worker pool size, ask timeout
//! - **supervision**: default restart limits
//! - **persistence**: default snapshot cadence for event-sourced entities
//! - **cluster**: node address, seed nodes, roles, singleton and split-brain settings
//! - **relay**: topic relay heartbeat and duplicate-suppression window
//!
//! ## Usage
//!
//! ```rust,no_run
//! use node_config::NodeConfig;
//! use std::path::Path;
//!
//! let config = NodeConfig::load(Some(Path::new("config/node.toml"))).unwrap();
//! assert!(config.persistence.snapshot_every > 0);
//! ```

pub mod node_config;

pub use node_config::{
    ClusterConfig, NodeConfig, PersistenceConfig, RelayConfig, SingletonConfig,
    SplitBrainConfig, SplitBrainStrategyKind, SupervisionConfig, SystemConfig,
    STEP_DOWN_ALLOWANCE_MS,
};
