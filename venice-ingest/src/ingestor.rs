//! Partition Ingestor: the Leader/Follower replication state machine.
//!
//! One instance owns one `(store_version, partition)` on one replica.
//! Its drainer task is the sole writer of that partition's local-store
//! column and DIV state, so no locking is needed across record
//! applications — only the role-change and shutdown signals arrive
//! from outside, both delivered as `watch` channels.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use venice_common::config::IngestConfig;
use venice_common::error::{DivError, Error, IngestError, Result};
use venice_common::metrics;
use venice_common::types::{
    ControlMessage, KafkaMessageEnvelope, MessageType, Offset, Payload, PartitionId, ReplicaRole,
    ReplicaStatus, StoreVersionConfig, Timestamp,
};
use venice_storage::{BatchOp, LocalStore, PartitionCheckpoint};

use crate::consumer_pool::SharedConsumerPool;
use crate::control::{self, ControlEffect, PartitionState};
use crate::div::{DivOutcome, DivValidator};
use crate::log_transport::LogTransport;
use crate::producer::VersionTopicProducer;
use venice_membership::MembershipOracle;

/// The ingestor's own progress through the L/F lifecycle. Distinct
/// from `ReplicaRole`, which is the oracle's assignment: a replica can
/// be assigned `LEADER` while still catching up on the version topic
/// (`LeaderCatchupVt`) before it is allowed to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestorState {
    Bootstrap,
    FollowerConsumingVt,
    LeaderCatchupVt,
    LeaderConsumingUpstream,
    CompletedBatch,
    Errored,
}

fn topic_id(topic: &str) -> u32 {
    crc32fast::hash(topic.as_bytes())
}

/// One partition's ingestion state machine.
pub struct PartitionIngestor {
    store_version: StoreVersionConfig,
    partition: PartitionId,
    local_store: Arc<LocalStore>,
    transport: Arc<dyn LogTransport>,
    pool: Arc<SharedConsumerPool>,
    oracle: Arc<dyn MembershipOracle>,
    config: IngestConfig,
    producer_guid: u128,
    status_tx: watch::Sender<ReplicaStatus>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store_version: StoreVersionConfig,
        partition: PartitionId,
        local_store: Arc<LocalStore>,
        transport: Arc<dyn LogTransport>,
        pool: Arc<SharedConsumerPool>,
        oracle: Arc<dyn MembershipOracle>,
        config: IngestConfig,
        producer_guid: u128,
    ) -> Self {
        let (status_tx, _) = watch::channel(ReplicaStatus::Bootstrapping);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store_version,
            partition,
            local_store,
            transport,
            pool,
            oracle,
            config,
            producer_guid,
            status_tx,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    fn sv_key(&self) -> String {
        self.store_version.id.version_topic()
    }

    pub fn status(&self) -> watch::Receiver<ReplicaStatus> {
        self.status_tx.subscribe()
    }

    /// Start the drainer task. Idempotent: calling `start` on an
    /// already-running ingestor resumes from whatever checkpoint is
    /// durable, it does not spawn a second task.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Signal the ingestor to stop. `drain = true` blocks until the
    /// in-flight batch commits and the drainer exits cleanly; `drain =
    /// false` aborts after `stop_drain_timeout_seconds` and leaves the
    /// next `start` to replay from the last durable checkpoint.
    pub async fn stop(&self, drain: bool) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if drain {
                let _ = handle.await;
            } else {
                let budget = Duration::from_secs(self.config.stop_drain_timeout_seconds);
                if tokio::time::timeout(budget, handle).await.is_err() {
                    warn!(
                        partition = self.partition,
                        "stop(drain=false) exceeded budget; abandoning in-flight drainer"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn on_role_change(&self) -> watch::Receiver<ReplicaRole> {
        self.oracle.watch_role(&self.sv_key(), self.partition)
    }

    async fn run(self: Arc<Self>) {
        let checkpoint = self
            .local_store
            .load_checkpoint(&self.sv_key(), self.partition)
            .unwrap_or(None)
            .unwrap_or_default();

        let mut div = match DivValidator::from_blob(&checkpoint.div_state_blob) {
            Ok(d) => d,
            Err(e) => {
                error!(partition = self.partition, error = %e, "corrupt DIV checkpoint");
                self.enter_errored().await;
                return;
            }
        };

        let version_topic = self.store_version.id.version_topic();
        let mut pstate = PartitionState {
            upstream_topic: if checkpoint.upstream_topic.is_empty() {
                version_topic.clone()
            } else {
                checkpoint.upstream_topic.clone()
            },
            upstream_offset: checkpoint.upstream_offset,
            received_sop: false,
            received_eop: checkpoint.received_eop,
            received_sobr: !checkpoint.topic_switch_history.is_empty(),
            topic_switch_history: checkpoint.topic_switch_history.clone(),
            completed_incremental_labels: checkpoint.completed_incremental_labels.clone(),
            active_incremental_label: None,
        };
        let mut local_vt_offset = checkpoint.local_vt_offset;
        let mut producer: Option<VersionTopicProducer> = None;

        let mut role_rx = self.oracle.watch_role(&self.sv_key(), self.partition);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut state = match *role_rx.borrow() {
            ReplicaRole::Follower => IngestorState::FollowerConsumingVt,
            ReplicaRole::Leader => IngestorState::LeaderCatchupVt,
        };
        let mut catchup_target = if state == IngestorState::LeaderCatchupVt {
            self.transport
                .high_watermark(&version_topic, self.partition)
                .await
                .unwrap_or(local_vt_offset)
        } else {
            -1
        };

        let mut rx = self
            .pool
            .subscribe(&version_topic, self.partition, local_vt_offset + 1);

        self.status_tx.send_replace(ReplicaStatus::Bootstrapping);
        metrics::set_partition_is_leader(
            &self.sv_key(),
            self.partition,
            matches!(state, IngestorState::LeaderCatchupVt | IngestorState::LeaderConsumingUpstream),
        );

        // A leader that boots (or is promoted) with nothing left to
        // consume on the version topic, or whose prior checkpoint
        // already recorded the lifecycle signal catch-up waits for,
        // completes catch-up immediately rather than waiting on a
        // record that may never arrive.
        if state == IngestorState::LeaderCatchupVt {
            self.maybe_complete_catchup(&mut state, &mut pstate, &mut producer, &mut rx, local_vt_offset, catchup_target, &version_topic)
                .await;
        }

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = role_rx.changed() => {
                    if changed.is_ok() {
                        let new_role = *role_rx.borrow();
                        self.apply_role_change(
                            new_role,
                            &mut state,
                            &mut pstate,
                            &mut producer,
                            &mut rx,
                            &mut catchup_target,
                            &version_topic,
                            local_vt_offset,
                        )
                        .await;
                    }
                }
                item = rx.recv() => {
                    match item {
                        Some((offset, envelope)) => {
                            if let Err(e) = self
                                .apply_record(
                                    offset,
                                    envelope,
                                    &mut state,
                                    &mut pstate,
                                    &mut div,
                                    &mut local_vt_offset,
                                    &mut producer,
                                    &mut rx,
                                    &mut catchup_target,
                                    &version_topic,
                                )
                                .await
                            {
                                if e.is_fatal() {
                                    error!(partition = self.partition, error = %e, "fatal ingestion error");
                                    self.enter_errored().await;
                                    state = IngestorState::Errored;
                                    break;
                                }
                                warn!(partition = self.partition, error = %e, "transient ingestion error, continuing");
                            }
                        }
                        None => {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    }
                }
            }
        }

        self.pool.unsubscribe(&pstate.upstream_topic, self.partition);
        if state != IngestorState::Errored {
            let final_status = match state {
                IngestorState::CompletedBatch => ReplicaStatus::Completed,
                _ => ReplicaStatus::Online,
            };
            self.status_tx.send_replace(final_status);
        }
        debug!(partition = self.partition, "drainer exited");
    }

    async fn enter_errored(&self) {
        self.status_tx.send_replace(ReplicaStatus::Error);
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_role_change(
        &self,
        new_role: ReplicaRole,
        state: &mut IngestorState,
        pstate: &mut PartitionState,
        producer: &mut Option<VersionTopicProducer>,
        rx: &mut mpsc::Receiver<(Offset, KafkaMessageEnvelope)>,
        catchup_target: &mut Offset,
        version_topic: &str,
        local_vt_offset: Offset,
    ) {
        match (new_role, &*state) {
            (ReplicaRole::Leader, IngestorState::FollowerConsumingVt) => {
                info!(
                    partition = self.partition,
                    delay_s = self.config.promotion_to_leader_replica_delay_seconds,
                    "promotion signal received, draining prior leader before catch-up"
                );
                tokio::time::sleep(Duration::from_secs(
                    self.config.promotion_to_leader_replica_delay_seconds,
                ))
                .await;
                *catchup_target = self
                    .transport
                    .high_watermark(version_topic, self.partition)
                    .await
                    .unwrap_or(local_vt_offset);
                *state = IngestorState::LeaderCatchupVt;
                metrics::set_partition_is_leader(&self.sv_key(), self.partition, true);
                self.maybe_complete_catchup(state, pstate, producer, rx, local_vt_offset, *catchup_target, version_topic)
                    .await;
            }
            (ReplicaRole::Follower, IngestorState::LeaderCatchupVt)
            | (ReplicaRole::Follower, IngestorState::LeaderConsumingUpstream) => {
                info!(partition = self.partition, "demotion signal received");
                *producer = None;
                *rx = self.pool.subscribe(version_topic, self.partition, local_vt_offset + 1);
                pstate.upstream_topic = version_topic.to_string();
                *state = IngestorState::FollowerConsumingVt;
                metrics::set_partition_is_leader(&self.sv_key(), self.partition, false);
            }
            _ => {
                // Role-transition storm: collapse to whatever the latest
                // signal implies for the current state; no-op otherwise.
            }
        }
    }

    /// `LEADER_CATCHUP_VT` → `LEADER_CONSUMING_UPSTREAM` requires both
    /// that the version topic is consumed to the offset observed at
    /// promotion AND that the applicable lifecycle control message
    /// (`EndOfPush`, `StartOfBufferReplay`, or a `TopicSwitch`) has been
    /// observed — checked here after every record, control or data, so
    /// catch-up completes the instant both conditions hold rather than
    /// only inside the data-record path. A leader with nothing left to
    /// consume (`catchup_target <= local_vt_offset` at promotion) and a
    /// checkpoint that already recorded the lifecycle signal completes
    /// on the very first call, before any new record arrives.
    #[allow(clippy::too_many_arguments)]
    async fn maybe_complete_catchup(
        &self,
        state: &mut IngestorState,
        pstate: &mut PartitionState,
        producer: &mut Option<VersionTopicProducer>,
        rx: &mut mpsc::Receiver<(Offset, KafkaMessageEnvelope)>,
        local_vt_offset: Offset,
        catchup_target: Offset,
        version_topic: &str,
    ) {
        if *state != IngestorState::LeaderCatchupVt {
            return;
        }
        let observed_lifecycle_signal =
            pstate.received_eop || pstate.received_sobr || !pstate.topic_switch_history.is_empty();
        if local_vt_offset < catchup_target || !observed_lifecycle_signal {
            return;
        }

        *producer = Some(VersionTopicProducer::new(
            self.transport.clone(),
            self.producer_guid,
            &self.config,
        ));
        if pstate.upstream_topic != version_topic {
            self.pool.unsubscribe(version_topic, self.partition);
            *rx = self.pool.subscribe(&pstate.upstream_topic, self.partition, pstate.upstream_offset.max(0));
        }
        // else: upstream is still the version topic itself (batch-push
        // pass-through) — the existing subscription already delivers it.

        // A non-hybrid store whose `EndOfPush` coincided with the
        // catch-up boundary has nothing left to produce: land directly
        // on COMPLETED_BATCH instead of a LEADER_CONSUMING_UPSTREAM that
        // would never see another record.
        *state = if !self.store_version.is_hybrid() && pstate.received_eop {
            IngestorState::CompletedBatch
        } else {
            IngestorState::LeaderConsumingUpstream
        };
        metrics::set_partition_is_leader(&self.sv_key(), self.partition, true);
        if *state == IngestorState::CompletedBatch {
            // Reflect completion on the status channel the moment it's
            // reached rather than waiting for the drainer loop to exit —
            // callers watch `status()` to know when a batch-only leader
            // is done, and that may be long before shutdown.
            self.status_tx.send_replace(ReplicaStatus::Completed);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_record(
        &self,
        offset: Offset,
        envelope: KafkaMessageEnvelope,
        state: &mut IngestorState,
        pstate: &mut PartitionState,
        div: &mut DivValidator,
        local_vt_offset: &mut Offset,
        producer: &mut Option<VersionTopicProducer>,
        rx: &mut mpsc::Receiver<(Offset, KafkaMessageEnvelope)>,
        catchup_target: &mut Offset,
        version_topic: &str,
    ) -> Result<()> {
        let guid = envelope.producer_metadata.producer_guid;
        let segment = envelope.producer_metadata.segment_number;
        let seq = envelope.producer_metadata.message_sequence_number;
        let is_sos = matches!(envelope.message_type, MessageType::Control(ControlMessage::StartOfSegment));

        let outcome = div.validate(guid, segment, seq, is_sos);
        match outcome {
            DivOutcome::DuplicateDropped => {
                metrics::record_duplicate_dropped(&self.sv_key(), self.partition);
                return Ok(());
            }
            DivOutcome::Gap(DivError::DataMissing { .. }) | DivOutcome::MissingHead(_) => {
                let before_eop = !pstate.received_eop;
                if before_eop {
                    return Err(Error::Ingest(IngestError::SegmentGap { before_eop: true }));
                }
                warn!(partition = self.partition, "DIV gap tolerated after EndOfPush");
            }
            DivOutcome::Apply => {}
            DivOutcome::Gap(_) => {}
        }

        match envelope.message_type {
            MessageType::Control(ref msg) => {
                if let ControlMessage::EndOfSegment { checksum, final_segment } = msg {
                    if !div.verify_segment_checksum(guid, segment, *checksum) {
                        let tolerated = self.store_version.is_hybrid()
                            && !self.store_version.database_checksum_verification_enabled;
                        if !tolerated {
                            return Err(Error::Ingest(IngestError::ChecksumMismatch { tolerated: false }));
                        }
                        warn!(partition = self.partition, "checksum mismatch tolerated for hybrid stream");
                    }
                    if *final_segment {
                        div.close_segment(guid, segment);
                    }
                } else {
                    div.update_checksum(guid, segment, &[]);
                }

                let previous_upstream_topic = pstate.upstream_topic.clone();
                let effect = control::apply(pstate, msg, self.partition, now_from_envelope(&envelope));

                if *state == IngestorState::LeaderConsumingUpstream {
                    // Leaders re-produce control messages so followers
                    // observe the same lifecycle transitions.
                    self.reproduce_control(version_topic, offset, msg, producer).await?;
                }

                match effect {
                    ControlEffect::SwitchUpstream { topic, from_offset, rewind_start_timestamp } if *state == IngestorState::LeaderConsumingUpstream => {
                        let resolved_offset = if from_offset >= 0 {
                            from_offset
                        } else {
                            let now = now_from_envelope(&envelope);
                            let boundary = match rewind_start_timestamp {
                                Some(-1) | None => Timestamp::MIN,
                                Some(rewind) => now.saturating_sub(rewind),
                            };
                            self.transport
                                .offset_for_timestamp(&topic, self.partition, boundary)
                                .await
                                .unwrap_or(0)
                        };
                        self.pool.unsubscribe(&previous_upstream_topic, self.partition);
                        *rx = self.pool.subscribe(&topic, self.partition, resolved_offset);
                        metrics::record_rewind_triggered(&self.sv_key(), self.partition);
                    }
                    ControlEffect::BatchClosed => {
                        if !self.store_version.is_hybrid() && *state == IngestorState::LeaderConsumingUpstream {
                            *state = IngestorState::CompletedBatch;
                            self.status_tx.send_replace(ReplicaStatus::Completed);
                        }
                    }
                    _ => {}
                }

                if matches!(*state, IngestorState::FollowerConsumingVt | IngestorState::LeaderCatchupVt) {
                    // Control records advance version-topic progress the
                    // same as data records; otherwise catch-up and resume
                    // offsets lag behind what has actually been consumed.
                    *local_vt_offset = offset;
                }

                if *state == IngestorState::LeaderCatchupVt {
                    self.maybe_complete_catchup(state, pstate, producer, rx, *local_vt_offset, *catchup_target, version_topic)
                        .await;
                }

                self.persist_checkpoint(pstate, div, *local_vt_offset, envelope.producer_metadata.message_timestamp).await?;
                return Ok(());
            }
            MessageType::Data(ref payload) => {
                div.update_checksum(guid, segment, payload_bytes(payload));

                match *state {
                    IngestorState::FollowerConsumingVt | IngestorState::LeaderCatchupVt => {
                        self.commit_data(pstate, div, &envelope.key, payload, offset).await?;
                        *local_vt_offset = offset;
                        if *state == IngestorState::LeaderCatchupVt {
                            self.maybe_complete_catchup(state, pstate, producer, rx, *local_vt_offset, *catchup_target, version_topic)
                                .await;
                        }
                    }
                    IngestorState::LeaderConsumingUpstream => {
                        pstate.upstream_offset = offset;
                        if pstate.upstream_topic == version_topic {
                            // Batch-push pass-through (spec item 4.1-1): the
                            // leader's upstream is still its own version
                            // topic, so the record is already durable there.
                            // Re-producing it would feed its own
                            // subscription and reproduce forever.
                            self.commit_data(pstate, div, &envelope.key, payload, offset).await?;
                            *local_vt_offset = offset;
                        } else if let Some(p) = producer.as_ref() {
                            let reproduced_offset = p
                                .reproduce(
                                    version_topic,
                                    self.partition,
                                    offset,
                                    topic_id(&pstate.upstream_topic),
                                    envelope.key.clone(),
                                    payload.clone(),
                                    envelope.producer_metadata.message_timestamp,
                                )
                                .await?;
                            self.commit_data(pstate, div, &envelope.key, payload, reproduced_offset).await?;
                            *local_vt_offset = reproduced_offset;
                        }
                    }
                    IngestorState::CompletedBatch | IngestorState::Bootstrap | IngestorState::Errored => {}
                }
            }
        }

        Ok(())
    }

    async fn reproduce_control(
        &self,
        version_topic: &str,
        upstream_offset: Offset,
        msg: &ControlMessage,
        producer: &mut Option<VersionTopicProducer>,
    ) -> Result<()> {
        if let Some(p) = producer.as_ref() {
            let envelope = KafkaMessageEnvelope {
                key: bytes::Bytes::new(),
                producer_metadata: venice_common::types::ProducerMetadata {
                    producer_guid: p.producer_guid(),
                    segment_number: 0,
                    message_sequence_number: upstream_offset.max(0),
                    message_timestamp: 0,
                },
                message_type: MessageType::Control(msg.clone()),
                leader_metadata_footer: Some(venice_common::types::LeaderMetadataFooter {
                    upstream_offset,
                    upstream_topic_id: topic_id(version_topic),
                }),
            };
            self.transport
                .produce(version_topic, self.partition, envelope)
                .await?;
        }
        Ok(())
    }

    async fn commit_data(
        &self,
        pstate: &PartitionState,
        div: &DivValidator,
        key: &bytes::Bytes,
        payload: &Payload,
        vt_offset: Offset,
    ) -> Result<()> {
        let ops = match payload {
            Payload::Put { value, .. } => vec![BatchOp::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            }],
            Payload::Delete => vec![BatchOp::Delete { key: key.to_vec() }],
            Payload::Update { partial, .. } => vec![BatchOp::Put {
                key: key.to_vec(),
                value: partial.to_vec(),
            }],
        };

        let checkpoint = PartitionCheckpoint {
            upstream_topic: pstate.upstream_topic.clone(),
            upstream_offset: pstate.upstream_offset,
            local_vt_offset: vt_offset,
            div_state_blob: div.to_blob()?,
            received_eop: pstate.received_eop,
            topic_switch_history: pstate.topic_switch_history.clone(),
            completed_incremental_labels: pstate.completed_incremental_labels.clone(),
        };

        let timer = metrics::LatencyTimer::new("local_store_commit");
        self.local_store
            .commit_batch(&self.sv_key(), self.partition, &ops, &checkpoint)
            .await
            .map_err(|e| Error::Ingest(IngestError::LocalStoreCommitFailed(e.to_string())))?;
        drop(timer);

        metrics::record_records_persisted(&self.sv_key(), self.partition, 1, ops_bytes(&ops));
        Ok(())
    }

    async fn persist_checkpoint(
        &self,
        pstate: &PartitionState,
        div: &DivValidator,
        local_vt_offset: Offset,
        _timestamp: Timestamp,
    ) -> Result<()> {
        let checkpoint = PartitionCheckpoint {
            upstream_topic: pstate.upstream_topic.clone(),
            upstream_offset: pstate.upstream_offset,
            local_vt_offset,
            div_state_blob: div.to_blob()?,
            received_eop: pstate.received_eop,
            topic_switch_history: pstate.topic_switch_history.clone(),
            completed_incremental_labels: pstate.completed_incremental_labels.clone(),
        };
        self.local_store
            .commit_batch(&self.sv_key(), self.partition, &[], &checkpoint)
            .await
            .map_err(|e| Error::Ingest(IngestError::LocalStoreCommitFailed(e.to_string())))?;
        Ok(())
    }
}

fn payload_bytes(payload: &Payload) -> &[u8] {
    match payload {
        Payload::Put { value, .. } => value.as_ref(),
        Payload::Delete => &[],
        Payload::Update { partial, .. } => partial.as_ref(),
    }
}

fn ops_bytes(ops: &[BatchOp]) -> u64 {
    ops.iter()
        .map(|op| match op {
            BatchOp::Put { value, .. } => value.len() as u64,
            BatchOp::Delete { .. } => 0,
        })
        .sum()
}

fn now_from_envelope(envelope: &KafkaMessageEnvelope) -> Timestamp {
    envelope.producer_metadata.message_timestamp
}
