//! The durable local key/value store each replica commits persisted
//! records and ingestion checkpoints into.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;

mod engine;
mod wal;

pub use engine::{BatchOp, LocalStore, PartitionCheckpoint, TopicSwitchRecord};
pub use wal::WriteAheadLog;
