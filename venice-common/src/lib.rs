//! Venice Common - shared types, error handling, configuration, and
//! metrics used across the ingestion core.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use partition::{Partitioner, Xxh3Partitioner};
pub use types::*;
