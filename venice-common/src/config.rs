//! Configuration management for the ingestion core.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::StoreVersionConfig;

/// Top-level configuration assembled from per-subsystem structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Store-versions this node ingests. In production these are
    /// pushed by the controller; a static list here is what lets a
    /// single binary bootstrap without one.
    #[serde(default)]
    pub store_versions: Vec<StoreVersionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
            cluster: ClusterConfig::default(),
            store_versions: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file, selected by extension.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse JSON config: {}", e)))?
        };

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub node_id: u64,
    pub bind_address: String,
    pub data_dir: String,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_address: "0.0.0.0".to_string(),
            data_dir: "/var/lib/venice".to_string(),
            workers: 0,
        }
    }
}

/// Configuration for the local key/value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: String,
    pub max_memory_bytes: usize,
    pub wal_enabled: bool,
    pub wal_sync_mode: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/venice/data".to_string(),
            max_memory_bytes: 4 * 1024 * 1024 * 1024,
            wal_enabled: true,
            wal_sync_mode: "fsync".to_string(),
        }
    }
}

/// Configuration governing the Partition Ingestor, DIV validator,
/// version-topic producer, and shared consumer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Grace period a newly promoted leader waits before producing, to
    /// let the prior leader's in-flight produces drain.
    pub promotion_to_leader_replica_delay_seconds: u64,
    pub shared_consumer_pool_enabled: bool,
    pub consumer_pool_size_per_cluster: usize,
    pub max_user_payload_bytes: usize,
    pub database_checksum_verification_enabled: bool,
    /// Producer retry budget before a produce failure is treated as fatal.
    pub producer_retries: u32,
    pub stop_drain_timeout_seconds: u64,
    /// Bound on each partition's shared-consumer delivery queue.
    pub partition_queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            promotion_to_leader_replica_delay_seconds: 3,
            shared_consumer_pool_enabled: true,
            consumer_pool_size_per_cluster: 3,
            max_user_payload_bytes: 1024 * 1024,
            database_checksum_verification_enabled: true,
            producer_retries: u32::MAX,
            stop_drain_timeout_seconds: 30,
            partition_queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub node_id: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "venice-cluster".to_string(),
            node_id: 1,
        }
    }
}
