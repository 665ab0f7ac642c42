//! The log transport seam.
//!
//! The real transport (Kafka, in production) is external infrastructure
//! and out of scope here; this module defines the narrow client
//! interface the ingestion core depends on, plus a deterministic
//! in-memory implementation used by tests. The in-memory log keeps an
//! offset-indexed append buffer per `(topic, partition)`, the same
//! shape as a single segment of a real partition log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use venice_common::error::{Error, ProtocolError, Result};
use venice_common::types::{KafkaMessageEnvelope, Offset, PartitionId, Timestamp};

/// What the Shared Consumer Pool and the Version-Topic Producer need
/// from the upstream log transport.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn produce(
        &self,
        topic: &str,
        partition: PartitionId,
        envelope: KafkaMessageEnvelope,
    ) -> Result<Offset>;

    async fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        from_offset: Offset,
        max_records: usize,
    ) -> Result<Vec<(Offset, KafkaMessageEnvelope)>>;

    async fn high_watermark(&self, topic: &str, partition: PartitionId) -> Result<Offset>;

    /// The earliest offset whose record timestamp is `<= at`, or the
    /// earliest available offset when no such record exists. Used to
    /// resolve `TopicSwitch(rewind_start_ts)`.
    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        at: Timestamp,
    ) -> Result<Offset>;

    fn partition_count(&self, topic: &str) -> Result<u32>;
}

struct PartitionLog {
    entries: RwLock<BTreeMap<Offset, (Timestamp, KafkaMessageEnvelope)>>,
    next_offset: AtomicI64,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_offset: AtomicI64::new(0),
        }
    }
}

/// Deterministic in-memory transport: one append-only map per
/// `(topic, partition)`, guarded so concurrent producers still see a
/// monotonic offset assignment.
pub struct InMemoryLogTransport {
    partitions: DashMap<(String, PartitionId), Arc<PartitionLog>>,
    partition_counts: DashMap<String, u32>,
}

impl InMemoryLogTransport {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            partition_counts: DashMap::new(),
        }
    }

    /// Declare a topic's partition count; required before producing or
    /// fetching so `partition_count` is answerable without guessing
    /// from observed traffic.
    pub fn declare_topic(&self, topic: &str, partition_count: u32) {
        self.partition_counts
            .insert(topic.to_string(), partition_count);
    }

    fn log(&self, topic: &str, partition: PartitionId) -> Arc<PartitionLog> {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| Arc::new(PartitionLog::new()))
            .clone()
    }

    /// Test helper: produce with an explicit timestamp, bypassing the
    /// envelope's own `message_timestamp` so rewind-boundary scenarios
    /// can be constructed deterministically.
    pub async fn produce_at(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp: Timestamp,
        envelope: KafkaMessageEnvelope,
    ) -> Result<Offset> {
        let log = self.log(topic, partition);
        let offset = log.next_offset.fetch_add(1, Ordering::SeqCst);
        log.entries.write().insert(offset, (timestamp, envelope));
        Ok(offset)
    }
}

impl Default for InMemoryLogTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogTransport for InMemoryLogTransport {
    async fn produce(
        &self,
        topic: &str,
        partition: PartitionId,
        envelope: KafkaMessageEnvelope,
    ) -> Result<Offset> {
        let timestamp = envelope.producer_metadata.message_timestamp;
        self.produce_at(topic, partition, timestamp, envelope).await
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        from_offset: Offset,
        max_records: usize,
    ) -> Result<Vec<(Offset, KafkaMessageEnvelope)>> {
        let log = self.log(topic, partition);
        let entries = log.entries.read();
        let start = if from_offset < 0 { 0 } else { from_offset };
        Ok(entries
            .range(start..)
            .take(max_records)
            .map(|(offset, (_, envelope))| (*offset, envelope.clone()))
            .collect())
    }

    async fn high_watermark(&self, topic: &str, partition: PartitionId) -> Result<Offset> {
        let log = self.log(topic, partition);
        Ok(log.next_offset.load(Ordering::SeqCst) - 1)
    }

    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        at: Timestamp,
    ) -> Result<Offset> {
        let log = self.log(topic, partition);
        let entries = log.entries.read();
        let found = entries
            .iter()
            .filter(|(_, (ts, _))| *ts <= at)
            .next_back()
            .map(|(offset, _)| *offset);
        Ok(found.unwrap_or(0))
    }

    fn partition_count(&self, topic: &str) -> Result<u32> {
        self.partition_counts.get(topic).map(|v| *v).ok_or_else(|| {
            Error::Protocol(ProtocolError::InvalidEnvelope(format!(
                "topic {topic} was never declared"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venice_common::types::{MessageType, Payload, ProducerMetadata};

    fn envelope(ts: Timestamp) -> KafkaMessageEnvelope {
        KafkaMessageEnvelope {
            key: bytes::Bytes::from_static(b"k"),
            producer_metadata: ProducerMetadata {
                producer_guid: 1,
                segment_number: 0,
                message_sequence_number: 1,
                message_timestamp: ts,
            },
            message_type: MessageType::Data(Payload::Put {
                value: bytes::Bytes::from_static(b"v"),
                schema_id: 1,
            }),
            leader_metadata_footer: None,
        }
    }

    #[tokio::test]
    async fn offsets_are_monotonic_per_partition() {
        let t = InMemoryLogTransport::new();
        t.declare_topic("store_v1", 1);
        let o1 = t.produce("store_v1", 0, envelope(1)).await.unwrap();
        let o2 = t.produce("store_v1", 0, envelope(2)).await.unwrap();
        assert_eq!(o1, 0);
        assert_eq!(o2, 1);
    }

    #[tokio::test]
    async fn fetch_returns_records_from_offset() {
        let t = InMemoryLogTransport::new();
        t.declare_topic("store_v1", 1);
        for i in 0..5 {
            t.produce("store_v1", 0, envelope(i)).await.unwrap();
        }
        let records = t.fetch("store_v1", 0, 2, 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, 2);
    }

    #[tokio::test]
    async fn offset_for_timestamp_finds_largest_offset_at_or_before() {
        let t = InMemoryLogTransport::new();
        t.declare_topic("store_v1", 1);
        for ts in [10, 20, 30, 40] {
            t.produce_at("store_v1", 0, ts, envelope(ts)).await.unwrap();
        }
        assert_eq!(t.offset_for_timestamp("store_v1", 0, 25).await.unwrap(), 1);
        assert_eq!(t.offset_for_timestamp("store_v1", 0, 5).await.unwrap(), 0);
    }
}
