//! Version-Topic Producer: leader-only re-production of upstream
//! records into the version topic, stamped with a leader metadata
//! footer so followers can reason about provenance.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use venice_common::config::IngestConfig;
use venice_common::error::{Error, IngestError, Result};
use venice_common::types::{
    KafkaMessageEnvelope, LeaderMetadataFooter, MessageType, Offset, Payload, PartitionId,
    ProducerMetadata, Timestamp,
};

use crate::log_transport::LogTransport;

/// Re-produces non-control upstream records into the version topic
/// under the leader's own single-producer identity. The version topic
/// is a single-producer log per partition: the leader never forwards
/// the original producer's guid/segment/seq, only its own.
pub struct VersionTopicProducer {
    transport: Arc<dyn LogTransport>,
    producer_guid: u128,
    retries: u32,
    segment: AtomicI32,
    next_seq: AtomicI64,
}

impl VersionTopicProducer {
    pub fn new(transport: Arc<dyn LogTransport>, producer_guid: u128, config: &IngestConfig) -> Self {
        Self {
            transport,
            producer_guid,
            retries: config.producer_retries,
            segment: AtomicI32::new(0),
            next_seq: AtomicI64::new(1),
        }
    }

    /// Re-produce one record. `upstream_offset`/`upstream_topic_id`
    /// become the leader metadata footer; the payload bytes are
    /// forwarded byte-for-byte (pass-through compression).
    pub async fn reproduce(
        &self,
        version_topic: &str,
        partition: PartitionId,
        upstream_offset: Offset,
        upstream_topic_id: u32,
        key: bytes::Bytes,
        payload: Payload,
        timestamp: Timestamp,
    ) -> Result<Offset> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let envelope = KafkaMessageEnvelope {
            key,
            producer_metadata: ProducerMetadata {
                producer_guid: self.producer_guid,
                segment_number: self.segment.load(Ordering::SeqCst),
                message_sequence_number: seq,
                message_timestamp: timestamp,
            },
            message_type: MessageType::Data(payload),
            leader_metadata_footer: Some(LeaderMetadataFooter {
                upstream_offset,
                upstream_topic_id,
            }),
        };

        let mut attempt = 0u32;
        loop {
            match self.transport.produce(version_topic, partition, envelope.clone()).await {
                Ok(offset) => return Ok(offset),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(50u64.saturating_mul(1 << attempt.min(10)));
                    warn!(
                        attempt,
                        partition,
                        error = %e,
                        "version-topic produce failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(Error::Ingest(IngestError::VersionTopicProduceFailed(
                        e.to_string(),
                    )));
                }
            }
        }
    }

    /// Begin a fresh segment, e.g. after a promotion resets the
    /// producer identity's continuity.
    pub fn roll_segment(&self) {
        let seg = self.segment.fetch_add(1, Ordering::SeqCst) + 1;
        self.next_seq.store(1, Ordering::SeqCst);
        debug!(segment = seg, "version-topic producer rolled to new segment");
    }

    pub fn producer_guid(&self) -> u128 {
        self.producer_guid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_transport::InMemoryLogTransport;

    #[tokio::test]
    async fn reproduce_stamps_leader_footer_and_own_identity() {
        let transport = Arc::new(InMemoryLogTransport::new());
        transport.declare_topic("store_v1", 1);
        let config = IngestConfig::default();
        let producer = VersionTopicProducer::new(transport.clone(), 999, &config);

        let offset = producer
            .reproduce(
                "store_v1",
                0,
                41,
                7,
                bytes::Bytes::from_static(b"k"),
                Payload::Put {
                    value: bytes::Bytes::from_static(b"v"),
                    schema_id: 1,
                },
                123,
            )
            .await
            .unwrap();

        let records = transport.fetch("store_v1", 0, 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let (fetched_offset, envelope) = &records[0];
        assert_eq!(*fetched_offset, offset);
        assert_eq!(envelope.producer_metadata.producer_guid, 999);
        let footer = envelope.leader_metadata_footer.as_ref().unwrap();
        assert_eq!(footer.upstream_offset, 41);
        assert_eq!(footer.upstream_topic_id, 7);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically() {
        let transport = Arc::new(InMemoryLogTransport::new());
        transport.declare_topic("store_v1", 1);
        let config = IngestConfig::default();
        let producer = VersionTopicProducer::new(transport.clone(), 1, &config);

        for i in 0..3 {
            producer
                .reproduce(
                    "store_v1",
                    0,
                    i,
                    0,
                    bytes::Bytes::from_static(b"k"),
                    Payload::Put {
                        value: bytes::Bytes::from_static(b"v"),
                        schema_id: 1,
                    },
                    i,
                )
                .await
                .unwrap();
        }

        let records = transport.fetch("store_v1", 0, 0, 10).await.unwrap();
        let seqs: Vec<i64> = records
            .iter()
            .map(|(_, e)| e.producer_metadata.message_sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
