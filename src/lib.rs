//! Hierarchical partitioned storage engine for neuron and cluster objects.
//!
//! The engine classifies clusters into a four-segment partition path
//! (functional/plasticity/topology/temporal), keeps one compressed
//! membership pack and one compressed neuron bank per partition, and
//! batches saves with change detection so unchanged clusters cost zero
//! filesystem writes. See `SPEC_FULL.md` for the full design.

pub mod compaction;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod partition;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use compaction::{CompactionPlanner, RelocationPlan};
use config::EngineConfig;
use coordinator::{BatchedSaveCoordinator, ClusterSaveRequest, SaveMetrics};
use error::Result;
use model::{ClusterReference, NeuronSnapshot};
use partition::PartitionContext;
use storage::{ConceptCapacityStore, FileLockRegistry, MembershipPackStore, NeuronBank, PartitionMetadataStore, StatsCache, StorageStats};

/// The engine's public facade: owns every storage component and exposes
/// the operations listed in §6 of the spec.
pub struct Engine {
    coordinator: BatchedSaveCoordinator,
    capacity: ConceptCapacityStore,
    stats: Arc<StatsCache>,
}

impl Engine {
    /// Opens (creating if absent) the hierarchical tree under
    /// `config.base_dir`, loading metadata and stats caches.
    pub async fn open(config: EngineConfig) -> std::io::Result<Self> {
        let hierarchical_dir = config.hierarchical_dir();
        tokio::fs::create_dir_all(&hierarchical_dir).await?;

        let locks = Arc::new(FileLockRegistry::new());
        let metadata = Arc::new(PartitionMetadataStore::load(&hierarchical_dir).await);
        let membership = Arc::new(MembershipPackStore::new(locks.clone()));
        let bank = Arc::new(NeuronBank::new(locks));
        let stats = Arc::new(StatsCache::load(&hierarchical_dir).await);
        let capacity = ConceptCapacityStore::new(&hierarchical_dir);

        let coordinator = BatchedSaveCoordinator::new(config, metadata, membership, bank, stats.clone());

        Ok(Self {
            coordinator,
            capacity,
            stats,
        })
    }

    pub async fn save_clusters_efficient(&self, clusters: Vec<ClusterSaveRequest>) -> Result<SaveMetrics> {
        self.coordinator.save_clusters_efficient(clusters, PartitionContext::at(Utc::now())).await
    }

    pub async fn save_cluster_membership_only(&self, cluster: ClusterSaveRequest) -> Result<SaveMetrics> {
        self.coordinator
            .save_cluster_membership_only(cluster, PartitionContext::at(Utc::now()))
            .await
    }

    pub async fn save_neuron_banks_in_batches(&self, changes: Vec<(Uuid, Vec<NeuronSnapshot>)>) -> Result<SaveMetrics> {
        self.coordinator.save_neuron_banks_in_batches(changes).await
    }

    pub async fn save_cluster_bank_only(&self, cluster_id: Uuid, changed_neurons: Vec<NeuronSnapshot>) -> Result<SaveMetrics> {
        self.coordinator.save_cluster_bank_only(cluster_id, changed_neurons).await
    }

    pub async fn save_cluster_with_partitioning(&self, cluster: ClusterSaveRequest, neurons: Vec<NeuronSnapshot>) -> Result<SaveMetrics> {
        self.coordinator
            .save_cluster_with_partitioning(cluster, neurons, PartitionContext::at(Utc::now()))
            .await
    }

    pub async fn load_cluster_with_partitioning(&self, cluster_id: Uuid) -> Result<Vec<NeuronSnapshot>> {
        self.coordinator.load_cluster_with_partitioning(cluster_id).await
    }

    /// `loadClusterWithPartitioning` over an arbitrary identifier (§4.7):
    /// resolves by UUID + metadata when possible, otherwise falls back to a
    /// per-cluster-file scan across every candidate partition.
    pub async fn load_cluster_by_identifier(&self, identifier: &str) -> Result<Vec<NeuronSnapshot>> {
        self.coordinator.load_cluster_by_identifier(identifier).await
    }

    pub async fn get_cluster_neuron_ids(&self, cluster_id: Uuid, max_to_return: Option<usize>) -> Result<Vec<Uuid>> {
        self.coordinator.get_cluster_neuron_ids(cluster_id, max_to_return).await
    }

    pub async fn inspect_cluster_membership(&self, cluster_id: Uuid) -> Result<(usize, usize)> {
        self.coordinator.inspect_cluster_membership(cluster_id).await
    }

    pub async fn find_similar_clusters(&self, concepts: &[String], threshold: f64) -> Vec<ClusterReference> {
        self.coordinator.find_similar_clusters(concepts, threshold).await
    }

    /// Plans (but does not execute) temporal relocations per §4.8.
    pub async fn consolidate_memory_partitions(&self) -> Vec<RelocationPlan> {
        let clusters = self.coordinator.metadata_store().all().await;
        CompactionPlanner::at(Utc::now()).plan(&clusters)
    }

    /// `getEnhancedStorageStats` (§4.10): the stats cache plus the derived
    /// hierarchical efficiency metric.
    pub async fn get_enhanced_storage_stats(&self) -> (StorageStats, f64) {
        let cluster_count = self.coordinator.metadata_store().all().await.len();
        self.stats.refresh_if_idle().await;
        let stats = self.stats.get_stats(cluster_count).await;

        let distinct_partitions: std::collections::HashSet<_> = self
            .coordinator
            .metadata_store()
            .all()
            .await
            .into_iter()
            .map(|m| m.partition)
            .collect();
        let efficiency = StatsCache::hierarchical_efficiency(distinct_partitions.len(), (5, 5, 5, 5));
        (stats, efficiency)
    }

    pub async fn load_concept_capacities(&self) -> HashMap<String, i64> {
        self.capacity.load().await
    }

    pub async fn save_concept_capacities(&self, capacities: &HashMap<String, i64>) -> Result<()> {
        self.capacity.save(capacities).await
    }

    pub async fn get_and_reset_last_save_metrics(&self) -> SaveMetrics {
        self.coordinator.get_and_reset_last_save_metrics().await
    }
}

/// Commonly used exports, following the crate's module-per-concern layout.
pub mod prelude {
    pub use crate::compaction::{CompactionPlanner, RelocationPlan, RelocationReason};
    pub use crate::config::EngineConfig;
    pub use crate::coordinator::{BatchedSaveCoordinator, ClusterSaveRequest, SaveMetrics};
    pub use crate::error::{EngineError, Result};
    pub use crate::model::{ClusterMetadata, ClusterReference, NeuronSnapshot};
    pub use crate::partition::{Functional, PartitionContext, PartitionPath, Plasticity, Temporal, Topology};
    pub use crate::storage::{ConceptCapacityStore, MembershipPack, NeuronBank, PartitionMetadataStore, StatsCache, StorageStats};
    pub use crate::Engine;
}
