//! Shared Consumer Pool: a process-wide pool of upstream-log consumers
//! multiplexed across partitions. Partitions subscribe and unsubscribe
//! dynamically; a slow partition's local-commit backlog only throttles
//! its own delivery, never another partition's.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use venice_common::config::IngestConfig;
use venice_common::error::Result;
use venice_common::metrics;
use venice_common::types::{KafkaMessageEnvelope, Offset, PartitionId};

use crate::log_transport::LogTransport;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const FETCH_BATCH_SIZE: usize = 256;

struct Subscription {
    paused: Arc<AtomicBool>,
    last_offset: Arc<AtomicI64>,
    task: JoinHandle<()>,
}

/// Multiplexes `consumer_pool_size_per_cluster`-worth of logical
/// consumer capacity across however many partitions subscribe. Each
/// subscription gets its own bounded queue and its own poll task; the
/// pool itself is just the registry plus the shared transport handle.
pub struct SharedConsumerPool {
    transport: Arc<dyn LogTransport>,
    queue_capacity: usize,
    subscriptions: DashMap<(String, PartitionId), Subscription>,
}

impl SharedConsumerPool {
    pub fn new(transport: Arc<dyn LogTransport>, config: &IngestConfig) -> Self {
        info!(
            pool_size = config.consumer_pool_size_per_cluster,
            "starting shared consumer pool"
        );
        Self {
            transport,
            queue_capacity: config.partition_queue_capacity,
            subscriptions: DashMap::new(),
        }
    }

    /// Subscribe a partition to `topic` starting at `from_offset`.
    /// Returns the bounded receiver the ingestor's drainer reads from.
    /// Replaces any existing subscription for this `(topic, partition)`
    /// key — used when a `TopicSwitch` changes the upstream mid-flight.
    pub fn subscribe(
        &self,
        topic: &str,
        partition: PartitionId,
        from_offset: Offset,
    ) -> mpsc::Receiver<(Offset, KafkaMessageEnvelope)> {
        self.unsubscribe(topic, partition);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let paused = Arc::new(AtomicBool::new(false));
        let last_offset = Arc::new(AtomicI64::new(from_offset));
        let transport = self.transport.clone();
        let topic_owned = topic.to_string();
        let paused_task = paused.clone();
        let last_offset_task = last_offset.clone();

        let task = tokio::spawn(async move {
            loop {
                let cursor = last_offset_task.load(Ordering::SeqCst);
                let batch = match transport
                    .fetch(&topic_owned, partition, cursor, FETCH_BATCH_SIZE)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        debug!(topic = %topic_owned, partition, error = %e, "fetch failed, retrying");
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    }
                };

                if batch.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }

                metrics::record_records_in(&topic_owned, partition, batch.len() as u64);

                for (offset, envelope) in batch {
                    if tx.capacity() == 0 {
                        paused_task.store(true, Ordering::SeqCst);
                    }
                    if tx.send((offset, envelope)).await.is_err() {
                        // Receiver dropped: the ingestor unsubscribed or shut down.
                        return;
                    }
                    paused_task.store(false, Ordering::SeqCst);
                    last_offset_task.store(offset + 1, Ordering::SeqCst);
                }
            }
        });

        self.subscriptions.insert(
            (topic.to_string(), partition),
            Subscription {
                paused,
                last_offset,
                task,
            },
        );

        rx
    }

    pub fn unsubscribe(&self, topic: &str, partition: PartitionId) {
        if let Some((_, sub)) = self.subscriptions.remove(&(topic.to_string(), partition)) {
            sub.task.abort();
        }
    }

    /// Current pool-wide occupancy, exported as gauges.
    pub fn report_gauges(&self) {
        let mut active = 0i64;
        let mut paused = 0i64;
        for entry in self.subscriptions.iter() {
            active += 1;
            if entry.value().paused.load(Ordering::SeqCst) {
                paused += 1;
            }
        }
        metrics::set_consumer_pool_gauges(active, paused);
    }

    pub fn is_paused(&self, topic: &str, partition: PartitionId) -> bool {
        self.subscriptions
            .get(&(topic.to_string(), partition))
            .map(|s| s.paused.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn shutdown(&self) -> Result<()> {
        for entry in self.subscriptions.iter() {
            entry.value().task.abort();
        }
        self.subscriptions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_transport::InMemoryLogTransport;
    use venice_common::types::{MessageType, Payload, ProducerMetadata};

    fn envelope(seq: i64) -> KafkaMessageEnvelope {
        KafkaMessageEnvelope {
            key: bytes::Bytes::from_static(b"k"),
            producer_metadata: ProducerMetadata {
                producer_guid: 1,
                segment_number: 0,
                message_sequence_number: seq,
                message_timestamp: seq,
            },
            message_type: MessageType::Data(Payload::Put {
                value: bytes::Bytes::from_static(b"v"),
                schema_id: 1,
            }),
            leader_metadata_footer: None,
        }
    }

    #[tokio::test]
    async fn delivers_records_in_offset_order() {
        let transport = Arc::new(InMemoryLogTransport::new());
        transport.declare_topic("store_v1", 1);
        for i in 0..5 {
            transport.produce("store_v1", 0, envelope(i)).await.unwrap();
        }

        let config = IngestConfig::default();
        let pool = SharedConsumerPool::new(transport, &config);
        let mut rx = pool.subscribe("store_v1", 0, 0);

        let mut seen = Vec::new();
        for _ in 0..5 {
            let (offset, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(offset);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        pool.unsubscribe("store_v1", 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let transport = Arc::new(InMemoryLogTransport::new());
        transport.declare_topic("store_v1", 1);
        let config = IngestConfig::default();
        let pool = SharedConsumerPool::new(transport.clone(), &config);
        let rx = pool.subscribe("store_v1", 0, 0);
        pool.unsubscribe("store_v1", 0);
        drop(rx);
        assert!(!pool.is_paused("store_v1", 0));
    }
}
