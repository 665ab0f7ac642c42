//! The local key/value store each Partition Ingestor commits into.
//!
//! Every replica of a `(store_version, partition)` owns one sled tree for
//! data and shares one tree, keyed by partition, for the persisted
//! checkpoint tuple described in the external-interfaces section of the
//! spec. A batch of data mutations and its checkpoint update are applied
//! in a single sled transaction so that invariant 1 (atomic commit of
//! data + checkpoint) holds even across a crash mid-batch.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::Db;
use tracing::info;

use venice_common::config::StorageConfig;
use venice_common::error::{Error, Result, StorageError};
use venice_common::types::{Offset, PartitionId, Timestamp};

use crate::cache::BufferPool;
use crate::wal::WriteAheadLog;

/// One mutation against a partition's data tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A `TopicSwitch` or `StartOfBufferReplay` applied to a partition,
/// retained so a restarted ingestor can reconstruct upstream-selection
/// history without replaying the version topic from the start.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicSwitchRecord {
    pub new_upstream_topic: String,
    pub rewind_start_timestamp: Timestamp,
    pub source_clusters: Vec<String>,
}

/// The durable checkpoint tuple for one partition, co-committed with its
/// data batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub upstream_topic: String,
    pub upstream_offset: Offset,
    pub local_vt_offset: Offset,
    pub div_state_blob: Vec<u8>,
    pub received_eop: bool,
    pub topic_switch_history: Vec<TopicSwitchRecord>,
    pub completed_incremental_labels: Vec<String>,
}

impl Default for PartitionCheckpoint {
    fn default() -> Self {
        Self {
            upstream_topic: String::new(),
            upstream_offset: -1,
            local_vt_offset: -1,
            div_state_blob: Vec::new(),
            received_eop: false,
            topic_switch_history: Vec::new(),
            completed_incremental_labels: Vec::new(),
        }
    }
}

fn checkpoint_key(store_version: &str, partition: PartitionId) -> Vec<u8> {
    format!("ckpt:{store_version}:{partition}").into_bytes()
}

fn data_tree_name(store_version: &str, partition: PartitionId) -> String {
    format!("data:{store_version}:{partition}")
}

/// The local store orchestrating sled-backed per-partition data trees, a
/// shared checkpoint tree, a read-through buffer pool, and an optional
/// write-ahead log that precedes every batch commit.
pub struct LocalStore {
    config: StorageConfig,
    db: Db,
    checkpoint_tree: sled::Tree,
    data_trees: DashMap<(String, PartitionId), sled::Tree>,
    buffer_pool: Arc<BufferPool>,
    wal: Option<Arc<WriteAheadLog>>,
    running: Arc<RwLock<bool>>,
}

impl LocalStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        info!("initializing local store at {}", config.path);
        tokio::fs::create_dir_all(&config.path).await?;

        let db_path = Path::new(&config.path).join("db");
        let db = sled::open(&db_path)
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;

        let checkpoint_tree = db
            .open_tree("checkpoints")
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;

        let buffer_pool = Arc::new(BufferPool::new(config.max_memory_bytes));

        let wal = if config.wal_enabled {
            let wal_path = Path::new(&config.path).join("wal");
            Some(Arc::new(WriteAheadLog::new(&wal_path).await?))
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            db,
            checkpoint_tree,
            data_trees: DashMap::new(),
            buffer_pool,
            wal,
            running: Arc::new(RwLock::new(true)),
        })
    }

    pub async fn is_healthy(&self) -> bool {
        *self.running.read()
    }

    fn data_tree(&self, store_version: &str, partition: PartitionId) -> Result<sled::Tree> {
        if let Some(tree) = self.data_trees.get(&(store_version.to_string(), partition)) {
            return Ok(tree.clone());
        }
        let tree = self
            .db
            .open_tree(data_tree_name(store_version, partition))
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;
        self.data_trees
            .insert((store_version.to_string(), partition), tree.clone());
        Ok(tree)
    }

    /// Apply a batch of data mutations and a new checkpoint atomically.
    /// Pre-writes the serialized batch to the WAL (if enabled) before the
    /// sled transaction, so a crash between WAL append and sled commit is
    /// recoverable by replaying from the last durable checkpoint.
    pub async fn commit_batch(
        &self,
        store_version: &str,
        partition: PartitionId,
        ops: &[BatchOp],
        checkpoint: &PartitionCheckpoint,
    ) -> Result<()> {
        let data_tree = self.data_tree(store_version, partition)?;
        let ckpt_bytes = bincode::serialize(checkpoint)?;

        if let Some(wal) = &self.wal {
            let wal_entry = bincode::serialize(&(store_version, partition, ops, &ckpt_bytes))?;
            wal.append(&wal_entry).await?;
            wal.sync().await?;
        }

        let ckpt_key = checkpoint_key(store_version, partition);
        let ops = ops.to_vec();

        let result: std::result::Result<(), TransactionError<Error>> =
            (&data_tree, &self.checkpoint_tree).transaction(|(tx_data, tx_ckpt)| {
                for op in &ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            tx_data.insert(key.as_slice(), value.as_slice())?;
                        }
                        BatchOp::Delete { key } => {
                            tx_data.remove(key.as_slice())?;
                        }
                    }
                }
                tx_ckpt.insert(ckpt_key.as_slice(), ckpt_bytes.as_slice())?;
                Ok(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(se) => {
                Error::Storage(StorageError::WriteFailed(se.to_string()))
            }
        })?;

        for op in &ops {
            if let BatchOp::Put { key, value } = op {
                self.buffer_pool.put(key, value);
            } else if let BatchOp::Delete { key } = op {
                self.buffer_pool.remove(key);
            }
        }

        Ok(())
    }

    pub fn get(
        &self,
        store_version: &str,
        partition: PartitionId,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.buffer_pool.get(key) {
            return Ok(Some(value));
        }
        let tree = self.data_tree(store_version, partition)?;
        match tree.get(key) {
            Ok(Some(value)) => Ok(Some(value.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(StorageError::ReadFailed(e.to_string()))),
        }
    }

    pub fn load_checkpoint(
        &self,
        store_version: &str,
        partition: PartitionId,
    ) -> Result<Option<PartitionCheckpoint>> {
        let key = checkpoint_key(store_version, partition);
        match self.checkpoint_tree.get(&key) {
            Ok(Some(bytes)) => {
                let checkpoint: PartitionCheckpoint = bincode::deserialize(&bytes)?;
                Ok(Some(checkpoint))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(StorageError::ReadFailed(e.to_string()))),
        }
    }

    /// Drop a partition's data tree and checkpoint entirely; used when a
    /// version is retired.
    pub fn drop_partition(&self, store_version: &str, partition: PartitionId) -> Result<()> {
        let name = data_tree_name(store_version, partition);
        self.db
            .drop_tree(name.as_bytes())
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;
        self.data_trees
            .remove(&(store_version.to_string(), partition));
        let key = checkpoint_key(store_version, partition);
        self.checkpoint_tree
            .remove(&key)
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down local store");
        *self.running.write() = false;
        if let Some(wal) = &self.wal {
            wal.sync().await?;
        }
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(StorageError::WriteFailed(e.to_string())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().to_string_lossy().into_owned(),
            max_memory_bytes: 16 * 1024 * 1024,
            wal_enabled: true,
            wal_sync_mode: "every_batch".to_string(),
        };
        let store = LocalStore::new(&config).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn commit_batch_is_visible_and_checkpointed_together() {
        let (_dir, store) = test_store().await;
        let ops = vec![
            BatchOp::Put {
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            },
            BatchOp::Put {
                key: b"k2".to_vec(),
                value: b"v2".to_vec(),
            },
        ];
        let checkpoint = PartitionCheckpoint {
            upstream_offset: 41,
            local_vt_offset: 7,
            ..Default::default()
        };
        store.commit_batch("store_v1", 0, &ops, &checkpoint).await.unwrap();

        assert_eq!(
            store.get("store_v1", 0, b"k1").unwrap(),
            Some(b"v1".to_vec())
        );
        let loaded = store.load_checkpoint("store_v1", 0).unwrap().unwrap();
        assert_eq!(loaded.upstream_offset, 41);
        assert_eq!(loaded.local_vt_offset, 7);
    }

    #[tokio::test]
    async fn delete_op_removes_prior_put_in_same_batch_sequence() {
        let (_dir, store) = test_store().await;
        let checkpoint = PartitionCheckpoint::default();
        store
            .commit_batch(
                "store_v1",
                0,
                &[BatchOp::Put {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                }],
                &checkpoint,
            )
            .await
            .unwrap();
        store
            .commit_batch(
                "store_v1",
                0,
                &[BatchOp::Delete { key: b"k".to_vec() }],
                &checkpoint,
            )
            .await
            .unwrap();
        assert_eq!(store.get("store_v1", 0, b"k").unwrap(), None);
    }

    #[tokio::test]
    async fn checkpoint_absent_until_first_commit() {
        let (_dir, store) = test_store().await;
        assert!(store.load_checkpoint("store_v1", 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_partition_clears_data_and_checkpoint() {
        let (_dir, store) = test_store().await;
        let checkpoint = PartitionCheckpoint {
            upstream_offset: 1,
            ..Default::default()
        };
        store
            .commit_batch(
                "store_v1",
                0,
                &[BatchOp::Put {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                }],
                &checkpoint,
            )
            .await
            .unwrap();
        store.drop_partition("store_v1", 0).unwrap();
        assert_eq!(store.get("store_v1", 0, b"k").unwrap(), None);
        assert!(store.load_checkpoint("store_v1", 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let (_dir, store) = test_store().await;
        let checkpoint = PartitionCheckpoint::default();
        store
            .commit_batch(
                "store_v1",
                0,
                &[BatchOp::Put {
                    key: b"k".to_vec(),
                    value: b"p0".to_vec(),
                }],
                &checkpoint,
            )
            .await
            .unwrap();
        store
            .commit_batch(
                "store_v1",
                1,
                &[BatchOp::Put {
                    key: b"k".to_vec(),
                    value: b"p1".to_vec(),
                }],
                &checkpoint,
            )
            .await
            .unwrap();
        assert_eq!(store.get("store_v1", 0, b"k").unwrap(), Some(b"p0".to_vec()));
        assert_eq!(store.get("store_v1", 1, b"k").unwrap(), Some(b"p1".to_vec()));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, u8),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
            any::<u8>().prop_map(Op::Delete),
        ]
    }

    proptest! {
        // Replaying a batch of puts/deletes against the local store, one
        // commit per op, always leaves the store holding exactly the last
        // write for every key, and the checkpoint committed alongside the
        // final batch is the one read back.
        #[test]
        fn commit_sequence_converges_to_last_write_per_key(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let config = StorageConfig {
                    path: dir.path().to_string_lossy().into_owned(),
                    max_memory_bytes: 16 * 1024 * 1024,
                    wal_enabled: true,
                    wal_sync_mode: "every_batch".to_string(),
                };
                let store = LocalStore::new(&config).await.unwrap();

                let mut model: std::collections::HashMap<u8, Option<u8>> = std::collections::HashMap::new();
                for (i, op) in ops.iter().enumerate() {
                    let batch_op = match op {
                        Op::Put(k, v) => {
                            model.insert(*k, Some(*v));
                            BatchOp::Put { key: vec![*k], value: vec![*v] }
                        }
                        Op::Delete(k) => {
                            model.insert(*k, None);
                            BatchOp::Delete { key: vec![*k] }
                        }
                    };
                    let checkpoint = PartitionCheckpoint {
                        local_vt_offset: i as Offset,
                        ..Default::default()
                    };
                    store.commit_batch("store_v1", 0, &[batch_op], &checkpoint).await.unwrap();
                }

                for (k, expected) in &model {
                    let actual = store.get("store_v1", 0, &[*k]).unwrap();
                    prop_assert_eq!(actual, expected.map(|v| vec![v]));
                }

                let loaded = store.load_checkpoint("store_v1", 0).unwrap().unwrap();
                prop_assert_eq!(loaded.local_vt_offset, ops.len() as Offset - 1);
                Ok(())
            })?;
        }
    }
}
