//! Configuration for a Gravel storage node
//!
//! Supports YAML configuration files; command line flags override file
//! values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::migrate::DEFAULT_FILE_TARGET;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Address other nodes and clients use to reach this one.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.node.port)
    }
}

fn default_etcd() -> String {
    "localhost:2379".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_num_shards() -> u32 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_file_target() -> u64 {
    DEFAULT_FILE_TARGET
}

fn default_threads() -> usize {
    2
}

fn default_level() -> String {
    "info".to_string()
}

/// Cluster membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Coordinator (etcd) endpoint.
    #[serde(default = "default_etcd")]
    pub etcd: String,
    /// Hostname advertised to the cluster.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of shards created when this node bootstraps a new cluster.
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            etcd: "localhost:2379".to_string(),
            host: "127.0.0.1".to_string(),
            port: 50051,
            num_shards: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage engine directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Target size in bytes of one streamed bulk-ingest file.
    #[serde(default = "default_file_target")]
    pub file_target: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            file_target: DEFAULT_FILE_TARGET,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Worker threads serving requests.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { threads: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.node.port, 50051);
        assert_eq!(config.advertise_addr(), "127.0.0.1:50051");
        assert_eq!(config.server.threads, 2);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("node:\n  port: 6000\n  etcd: etcd:2379\n").unwrap();
        assert_eq!(config.node.port, 6000);
        assert_eq!(config.node.etcd, "etcd:2379");
        assert_eq!(config.node.num_shards, 10);
        assert_eq!(config.storage.file_target, DEFAULT_FILE_TARGET);
    }
}
