//! Ingestion node orchestration.
//!
//! Wires the local store, log transport, membership oracle, and shared
//! consumer pool together and starts one [`PartitionIngestor`] per
//! `(store_version, partition)` this node is configured to serve.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use venice_common::config::Config;
use venice_common::types::ReplicaRole;
use venice_ingest::{InMemoryLogTransport, LogTransport, PartitionIngestor, SharedConsumerPool};
use venice_membership::{MembershipOracle, StaticMembershipOracle};
use venice_storage::LocalStore;

/// The running set of Partition Ingestors this node owns, plus the
/// shared components they were built from.
pub struct IngestionServer {
    config: Config,
    local_store: Arc<LocalStore>,
    transport: Arc<dyn LogTransport>,
    oracle: Arc<dyn MembershipOracle>,
    pool: Arc<SharedConsumerPool>,
    ingestors: Vec<Arc<PartitionIngestor>>,
}

impl IngestionServer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing Venice ingestion node...");

        let local_store = Arc::new(LocalStore::new(&config.storage).await?);

        // The production log transport is Kafka, external infrastructure
        // this binary does not embed. The in-memory transport here is a
        // single-node stand-in so `venice-bin server` is runnable without
        // one; swap in a real client by implementing `LogTransport`.
        let transport_impl = Arc::new(InMemoryLogTransport::new());
        let transport: Arc<dyn LogTransport> = transport_impl.clone();
        let oracle_impl = Arc::new(StaticMembershipOracle::new(&config.cluster));
        let oracle: Arc<dyn MembershipOracle> = oracle_impl.clone();
        let pool = Arc::new(SharedConsumerPool::new(transport.clone(), &config.ingest));

        let mut ingestors = Vec::new();
        for store_version in &config.store_versions {
            let version_topic = store_version.id.version_topic();
            transport_impl.declare_topic(&version_topic, store_version.partition_count);

            for partition in 0..store_version.partition_count as i32 {
                // Single-node deployments own every partition as leader;
                // a real cluster has Helix push per-partition assignments
                // through the oracle instead.
                oracle_impl.assign_role(&version_topic, partition, ReplicaRole::Leader);

                let ingestor = Arc::new(PartitionIngestor::new(
                    store_version.clone(),
                    partition,
                    local_store.clone(),
                    transport.clone(),
                    pool.clone(),
                    oracle.clone(),
                    config.ingest.clone(),
                    config.server.node_id as u128,
                ));
                ingestors.push(ingestor);
            }
        }

        info!(
            store_versions = config.store_versions.len(),
            partitions = ingestors.len(),
            "ingestion node initialized"
        );

        Ok(Self {
            config,
            local_store,
            transport,
            oracle,
            pool,
            ingestors,
        })
    }

    /// Start every configured Partition Ingestor and block reporting
    /// shared-consumer-pool gauges until cancelled.
    pub async fn run(&self) -> Result<()> {
        for ingestor in &self.ingestors {
            ingestor.start();
        }

        info!(
            "Venice ingestion node serving {} partition(s) on node {}",
            self.ingestors.len(),
            self.config.server.node_id
        );

        loop {
            self.pool.report_gauges();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down ingestion node...");
        for ingestor in &self.ingestors {
            ingestor.stop(true).await?;
        }
        self.pool.shutdown().await?;
        self.oracle.shutdown().await?;
        self.local_store.shutdown().await?;
        info!("shutdown complete");
        Ok(())
    }
}
