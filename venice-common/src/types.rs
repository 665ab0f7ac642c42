//! Common type definitions shared across the ingestion core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timestamp in milliseconds since Unix epoch.
pub type Timestamp = i64;

/// Offset type for log positions, monotonic within a topic-partition.
pub type Offset = i64;

/// Partition identifier.
pub type PartitionId = i32;

/// Cluster node identifier (used by the membership oracle).
pub type NodeId = u64;

/// A store-version's identity: `(store_name, version_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreVersionId {
    pub store_name: String,
    pub version_number: u32,
}

impl StoreVersionId {
    pub fn new(store_name: impl Into<String>, version_number: u32) -> Self {
        Self {
            store_name: store_name.into(),
            version_number,
        }
    }

    /// Name of this version's authoritative version topic: `<store>_v<n>`.
    pub fn version_topic(&self) -> String {
        format!("{}_v{}", self.store_name, self.version_number)
    }

    /// Name of the store's shared real-time topic: `<store>_rt`.
    pub fn real_time_topic(&self) -> String {
        format!("{}_rt", self.store_name)
    }

    /// Name of this version's stream-reprocessing topic: `<store>_v<n>_sr`.
    pub fn stream_reprocessing_topic(&self) -> String {
        format!("{}_v{}_sr", self.store_name, self.version_number)
    }
}

/// Returns true if a topic name is a real-time topic by the `_rt` suffix
/// convention.
pub fn is_real_time_topic(topic: &str) -> bool {
    topic.ends_with("_rt")
}

/// Compression strategy declared by a store-version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionStrategy {
    None,
    Gzip,
    Zstd,
    ZstdWithDict,
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        CompressionStrategy::None
    }
}

/// Static configuration of a store-version, set at creation and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreVersionConfig {
    pub id: StoreVersionId,
    pub partition_count: u32,
    pub chunking_enabled: bool,
    pub compression: CompressionStrategy,
    pub amplification_factor: u32,
    pub hybrid_rewind_seconds: i64,
    pub hybrid_offset_lag_threshold: i64,
    pub hybrid_time_lag_threshold: i64,
    pub database_checksum_verification_enabled: bool,
}

impl StoreVersionConfig {
    pub fn is_hybrid(&self) -> bool {
        self.hybrid_offset_lag_threshold >= 0 || self.hybrid_time_lag_threshold >= 0
    }
}

/// Role assigned to a replica for a given `(version, partition)` by the
/// membership oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
}

/// Producer identity carried by every data record: who produced it and
/// where it sits in that producer's segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMetadata {
    pub producer_guid: u128,
    pub segment_number: i32,
    pub message_sequence_number: i64,
    pub message_timestamp: Timestamp,
}

/// Footer a leader stamps on records it re-produces into the version
/// topic, recording where the record came from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetadataFooter {
    pub upstream_offset: Offset,
    pub upstream_topic_id: u32,
}

/// A user-facing data payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Put { value: Bytes, schema_id: u32 },
    Delete,
    Update { partial: Bytes, schema_id: u32 },
}

/// Control messages embedded in a topic that drive the ingestor's and
/// control-message-interpreter's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    StartOfPush {
        sorted: bool,
        chunking_enabled: bool,
        compression: CompressionStrategy,
        compression_dictionary: Option<Bytes>,
    },
    EndOfPush,
    StartOfBufferReplay {
        source_topic: String,
        source_offsets: HashMap<PartitionId, Offset>,
    },
    TopicSwitch {
        new_topic: String,
        source_clusters: Vec<String>,
        rewind_start_timestamp: Timestamp,
    },
    StartOfIncrementalPush {
        version_label: String,
    },
    EndOfIncrementalPush {
        version_label: String,
    },
    StartOfSegment,
    EndOfSegment {
        checksum: u32,
        final_segment: bool,
    },
}

/// The full envelope carried on the wire: identity, control-or-data
/// payload, and (leader-produced only) provenance footer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaMessageEnvelope {
    pub key: Bytes,
    pub producer_metadata: ProducerMetadata,
    pub message_type: MessageType,
    pub leader_metadata_footer: Option<LeaderMetadataFooter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageType {
    Data(Payload),
    Control(ControlMessage),
}

/// Metadata about a record once it has been assigned a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub timestamp: Timestamp,
}

/// Topic/partition watermark metadata, as reported by the log transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: PartitionId,
    pub leader: Option<NodeId>,
    pub low_watermark: Offset,
    pub high_watermark: Offset,
}

// ============================================================================
// Cluster / membership oracle types
// ============================================================================

/// Node information as reported by the membership oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub status: NodeStatus,
    pub last_heartbeat: Timestamp,
    pub metadata: HashMap<String, String>,
}

/// Node status as tracked by the membership oracle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
    Suspect,
    Draining,
    Joining,
    Leaving,
}

/// Cluster-wide status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub nodes: Vec<NodeInfo>,
    pub healthy_nodes: usize,
    pub total_partitions: u32,
}

// ============================================================================
// Replica / ingestion status surface
// ============================================================================

/// Per-partition ingestion liveness, exposed over a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Bootstrapping,
    Online,
    Error,
    Completed,
}

/// Push-status events surfaced as a version progresses through its batch
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    Started,
    EndOfPushReceived,
    Completed,
    Error,
}
