//! Venice ingestion core: the Leader/Follower replication state machine
//! that drains a store-version's log into the local key/value store.
//!
//! A Partition Ingestor ([`ingestor::PartitionIngestor`]) owns one
//! `(store_version, partition)` replica end to end: DIV continuity
//! checking ([`div`]), control-message interpretation ([`control`]),
//! leader re-production into the version topic ([`producer`]), and the
//! process-wide pool of upstream consumers every partition subscribes
//! through ([`consumer_pool`]). The log transport itself
//! ([`log_transport`]) and the membership oracle (`venice-membership`)
//! are external systems, represented here only by their client traits.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod consumer_pool;
pub mod control;
pub mod div;
pub mod ingestor;
pub mod log_transport;
pub mod producer;

pub use consumer_pool::SharedConsumerPool;
pub use control::{ControlEffect, PartitionState};
pub use div::{DivOutcome, DivValidator};
pub use ingestor::{IngestorState, PartitionIngestor};
pub use log_transport::{InMemoryLogTransport, LogTransport};
pub use producer::VersionTopicProducer;
