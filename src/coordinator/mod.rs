//! Batched save coordinator: the top-level orchestrator tying together
//! partition assignment, membership packs, and neuron banks (§4.6/§4.7).

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{ClusterMetadata, NeuronSnapshot};
use crate::partition::{classify, PartitionContext, PartitionPath};
use crate::storage::{
    find_cluster_file_by_identifier, write_cluster_file, MembershipPackStore, MembershipUpdate, NeuronBank,
    PartitionMetadataStore, StatsCache,
};

/// Metrics published by a single batch-save call (§4.6).
#[non_exhaustive]
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetrics {
    pub clusters_examined: usize,
    pub clusters_changed_membership: usize,
    pub membership_packs_written: usize,
    pub membership_packs_skipped: usize,
    pub neuron_bank_partitions: usize,
    pub neurons_upserted: usize,
}

/// One cluster's save input for `saveClustersEfficient`.
pub struct ClusterSaveRequest {
    pub cluster_id: Uuid,
    pub concept_domain: String,
    pub associated_concepts: Vec<String>,
    /// Used for classification only when the cluster has no existing
    /// metadata record; ignored otherwise (stable partition reuse, §4.1).
    pub representative_neuron: NeuronSnapshot,
    pub newly_added_since_persist: Option<Vec<Uuid>>,
    pub current_neuron_ids: Vec<Uuid>,
}

/// Orchestrates partition-grouped, bounded-concurrency saves of cluster
/// membership and neuron banks.
pub struct BatchedSaveCoordinator {
    config: EngineConfig,
    metadata: Arc<PartitionMetadataStore>,
    membership: Arc<MembershipPackStore>,
    bank: Arc<NeuronBank>,
    stats: Arc<StatsCache>,
    semaphore: Arc<Semaphore>,
    last_metrics: tokio::sync::Mutex<SaveMetrics>,
}

impl BatchedSaveCoordinator {
    pub fn new(
        config: EngineConfig,
        metadata: Arc<PartitionMetadataStore>,
        membership: Arc<MembershipPackStore>,
        bank: Arc<NeuronBank>,
        stats: Arc<StatsCache>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_saves.max(1)));
        Self {
            config,
            metadata,
            membership,
            bank,
            stats,
            semaphore,
            last_metrics: tokio::sync::Mutex::new(SaveMetrics::default()),
        }
    }

    /// The cluster's stable partition if known, else a fresh classification
    /// from its representative neuron (§4.1's stability rule).
    async fn resolve_partition(&self, cluster_id: Uuid, representative: &NeuronSnapshot, ctx: PartitionContext) -> PartitionPath {
        if let Some(existing) = self.metadata.lookup(cluster_id).await {
            return existing.partition;
        }
        if representative.concept.is_empty() && representative.input_weights.is_empty() {
            return PartitionPath::sentinel();
        }
        classify(representative, ctx)
    }

    fn partition_dir(&self, partition: &PartitionPath) -> std::path::PathBuf {
        self.config.hierarchical_dir().join(partition.relative_dir())
    }

    /// §4.6 membership-only batch save.
    #[instrument(skip(self, clusters))]
    pub async fn save_clusters_efficient(
        &self,
        clusters: Vec<ClusterSaveRequest>,
        ctx: PartitionContext,
    ) -> Result<SaveMetrics> {
        let mut metrics = SaveMetrics {
            clusters_examined: clusters.len(),
            ..Default::default()
        };

        let mut groups: HashMap<PartitionPath, Vec<ClusterSaveRequest>> = HashMap::new();
        for request in clusters {
            let partition = self.resolve_partition(request.cluster_id, &request.representative_neuron, ctx).await;
            groups.entry(partition).or_default().push(request);
        }

        let mut handles = Vec::new();
        for (partition, requests) in groups {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let membership = self.membership.clone();
            let metadata = self.metadata.clone();
            let partition_dir = self.partition_dir(&partition);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let mut updates = Vec::with_capacity(requests.len());

                for request in &requests {
                    let update = match &request.newly_added_since_persist {
                        Some(added) => MembershipUpdate::Diff(added.clone()),
                        None => MembershipUpdate::Full(request.current_neuron_ids.clone()),
                    };
                    updates.push((request.cluster_id, update));
                }

                for request in &requests {
                    let mut meta = metadata
                        .lookup(request.cluster_id)
                        .await
                        .unwrap_or_else(|| ClusterMetadata::new(request.cluster_id, request.concept_domain.clone(), partition));
                    meta.partition = partition;
                    meta.neuron_count = request.current_neuron_ids.len();
                    meta.associated_concepts = request.associated_concepts.clone();
                    meta.touch(ctx.now);
                    metadata.upsert(meta).await;
                }

                let changed_clusters = membership.apply_batch(&partition_dir, updates).await?;

                Ok::<_, crate::error::EngineError>(changed_clusters)
            }));
        }

        for handle in handles {
            let changed_clusters = handle.await.expect("save task panicked")?;
            if !changed_clusters.is_empty() {
                metrics.membership_packs_written += 1;
                metrics.clusters_changed_membership += changed_clusters.len();
            } else {
                metrics.membership_packs_skipped += 1;
            }
        }

        self.metadata.persist().await?;
        self.stats.invalidate_cluster_count(self.metadata.all().await.len()).await?;

        debug!(?metrics, "save_clusters_efficient complete");
        *self.last_metrics.lock().await = metrics.clone();
        Ok(metrics)
    }

    /// §4.6.1 single-cluster convenience over `save_clusters_efficient`.
    pub async fn save_cluster_membership_only(
        &self,
        cluster: ClusterSaveRequest,
        ctx: PartitionContext,
    ) -> Result<SaveMetrics> {
        self.save_clusters_efficient(vec![cluster], ctx).await
    }

    /// §4.6 bank-only batch save. `changes` pairs a cluster id (used only to
    /// resolve its stable partition) with the neurons that changed.
    #[instrument(skip(self, changes))]
    pub async fn save_neuron_banks_in_batches(
        &self,
        changes: Vec<(Uuid, Vec<NeuronSnapshot>)>,
    ) -> Result<SaveMetrics> {
        let mut by_partition: HashMap<PartitionPath, HashMap<Uuid, NeuronSnapshot>> = HashMap::new();

        for (cluster_id, neurons) in changes {
            let Some(meta) = self.metadata.lookup(cluster_id).await else {
                warn!(%cluster_id, "skipping neuron bank save for cluster with no metadata record");
                continue;
            };
            if !neurons.is_empty() {
                let mut updated = meta.clone();
                updated.average_importance = average_importance(&neurons);
                self.metadata.upsert(updated).await;
            }
            let entry = by_partition.entry(meta.partition).or_default();
            for neuron in neurons {
                // last occurrence wins within a partition's batch.
                entry.insert(neuron.id, neuron);
            }
        }

        let mut metrics = SaveMetrics {
            neuron_bank_partitions: by_partition.len(),
            ..Default::default()
        };

        let mut handles = Vec::new();
        for (partition, neurons) in by_partition {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let bank = self.bank.clone();
            let partition_dir = self.partition_dir(&partition);
            let neurons: Vec<NeuronSnapshot> = neurons.into_values().collect();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                bank.upsert(&partition_dir, &neurons).await
            }));
        }

        for handle in handles {
            metrics.neurons_upserted += handle.await.expect("save task panicked")?;
        }

        debug!(?metrics, "save_neuron_banks_in_batches complete");
        *self.last_metrics.lock().await = metrics.clone();
        Ok(metrics)
    }

    /// §4.6.1 single-cluster convenience over `save_neuron_banks_in_batches`.
    pub async fn save_cluster_bank_only(
        &self,
        cluster_id: Uuid,
        changed_neurons: Vec<NeuronSnapshot>,
    ) -> Result<SaveMetrics> {
        self.save_neuron_banks_in_batches(vec![(cluster_id, changed_neurons)]).await
    }

    /// §4.6 full single-cluster save: membership, metadata, bank, and the
    /// standalone per-cluster `<domain>_<id>.cluster[.gz]` file (§6) — the
    /// neuron payload stays in the bank; the cluster file carries only
    /// `(partitionPath, metadata, neuronIds)`.
    pub async fn save_cluster_with_partitioning(
        &self,
        cluster: ClusterSaveRequest,
        neurons: Vec<NeuronSnapshot>,
        ctx: PartitionContext,
    ) -> Result<SaveMetrics> {
        let cluster_id = cluster.cluster_id;
        let domain = cluster.concept_domain.clone();
        let neuron_ids = cluster.current_neuron_ids.clone();

        let mut metrics = self.save_cluster_membership_only(cluster, ctx).await?;
        let bank_metrics = self.save_cluster_bank_only(cluster_id, neurons).await?;
        metrics.neuron_bank_partitions += bank_metrics.neuron_bank_partitions;
        metrics.neurons_upserted += bank_metrics.neurons_upserted;

        if let Some(meta) = self.metadata.lookup(cluster_id).await {
            // The bank save above may have just updated `averageImportance`
            // in-memory; flush it so the cluster file and the metadata file
            // on disk agree.
            self.metadata.persist().await?;
            let partition_dir = self.partition_dir(&meta.partition);
            write_cluster_file(
                &partition_dir,
                &domain,
                cluster_id,
                meta,
                &neuron_ids,
                self.config.compress_clusters,
            )
            .await?;
        }

        Ok(metrics)
    }

    /// §4.7 read path, fast case: resolve a cluster's snapshots from its
    /// stable partition by id. Returns an empty list if the cluster is
    /// unknown.
    pub async fn load_cluster_with_partitioning(&self, cluster_id: Uuid) -> Result<Vec<NeuronSnapshot>> {
        let Some(meta) = self.metadata.lookup(cluster_id).await else {
            return Ok(Vec::new());
        };
        let partition_dir = self.partition_dir(&meta.partition);
        let pack = self.membership.load(&partition_dir).await?;
        let ids = pack.ids_for(cluster_id);
        self.bank.load(&partition_dir, &ids).await
    }

    /// §4.7 full read path: accepts an arbitrary `clusterIdentifier`. If it
    /// parses as a UUID known to metadata, takes the fast path above;
    /// otherwise enumerates every candidate partition (the Cartesian product
    /// of the four vocabularies) searching for a `.cluster[.gz]` file whose
    /// name contains the identifier, and hydrates from the bank named there.
    pub async fn load_cluster_by_identifier(&self, identifier: &str) -> Result<Vec<NeuronSnapshot>> {
        if let Ok(uuid) = Uuid::parse_str(identifier) {
            if self.metadata.lookup(uuid).await.is_some() {
                return self.load_cluster_with_partitioning(uuid).await;
            }
        }

        let hierarchical_dir = self.config.hierarchical_dir();
        let Some(record) = find_cluster_file_by_identifier(&hierarchical_dir, identifier).await? else {
            return Ok(Vec::new());
        };
        let partition_dir = self.partition_dir(&record.partition);
        self.bank.load(&partition_dir, &record.neuron_uuids()).await
    }

    /// §4.7: cached membership-pack read, optionally sampled down to
    /// `max_to_return` with a deterministic PRNG seeded from the cluster id.
    pub async fn get_cluster_neuron_ids(&self, cluster_id: Uuid, max_to_return: Option<usize>) -> Result<Vec<Uuid>> {
        let Some(meta) = self.metadata.lookup(cluster_id).await else {
            return Ok(Vec::new());
        };
        let partition_dir = self.partition_dir(&meta.partition);
        let pack = self.membership.load(&partition_dir).await?;
        let mut ids = pack.ids_for(cluster_id);

        if let Some(max) = max_to_return {
            if ids.len() > max {
                let seed = cluster_id.as_u128() as u64;
                let mut rng = StdRng::seed_from_u64(seed);
                ids.shuffle(&mut rng);
                ids.truncate(max);
            }
        }
        Ok(ids)
    }

    /// §4.7: `(membershipCount, hydratedCount)` — the pack's id-list length
    /// and how many of those ids are actually present in the bank.
    pub async fn inspect_cluster_membership(&self, cluster_id: Uuid) -> Result<(usize, usize)> {
        let Some(meta) = self.metadata.lookup(cluster_id).await else {
            return Ok((0, 0));
        };
        let partition_dir = self.partition_dir(&meta.partition);
        let pack = self.membership.load(&partition_dir).await?;
        let ids = pack.ids_for(cluster_id);
        let hydrated = self.bank.load(&partition_dir, &ids).await?;
        Ok((ids.len(), hydrated.len()))
    }

    /// §6: `getAndResetLastSaveMetrics`.
    pub async fn get_and_reset_last_save_metrics(&self) -> SaveMetrics {
        std::mem::take(&mut *self.last_metrics.lock().await)
    }

    pub async fn find_similar_clusters(&self, concepts: &[String], threshold: f64) -> Vec<crate::model::ClusterReference> {
        self.metadata.find_similar(concepts, threshold).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata_store(&self) -> &PartitionMetadataStore {
        &self.metadata
    }

    pub fn stats_cache(&self) -> &StatsCache {
        &self.stats
    }
}

/// Mean `importance` across `neurons`, used to keep `ClusterMetadata`'s
/// `averageImportance` in sync whenever a save carries the full neuron list.
/// `0.0` for an empty slice.
fn average_importance(neurons: &[NeuronSnapshot]) -> f64 {
    if neurons.is_empty() {
        return 0.0;
    }
    neurons.iter().map(|n| n.importance).sum::<f64>() / neurons.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileLockRegistry;
    use chrono::Utc;

    async fn coordinator(base: &std::path::Path) -> BatchedSaveCoordinator {
        let config = EngineConfig::new(base);
        tokio::fs::create_dir_all(config.hierarchical_dir()).await.unwrap();
        let metadata = Arc::new(PartitionMetadataStore::load(&config.hierarchical_dir()).await);
        let locks = Arc::new(FileLockRegistry::new());
        let membership = Arc::new(MembershipPackStore::new(locks.clone()));
        let bank = Arc::new(NeuronBank::new(locks));
        let stats = Arc::new(StatsCache::load(&config.hierarchical_dir()).await);
        BatchedSaveCoordinator::new(config, metadata, membership, bank, stats)
    }

    fn request(neuron: NeuronSnapshot, ids: Vec<Uuid>) -> ClusterSaveRequest {
        ClusterSaveRequest {
            cluster_id: Uuid::new_v4(),
            concept_domain: "animals".to_string(),
            associated_concepts: vec!["cat".to_string()],
            representative_neuron: neuron,
            newly_added_since_persist: None,
            current_neuron_ids: ids,
        }
    }

    #[tokio::test]
    async fn empty_cluster_save_creates_metadata_but_no_pack() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());
        let req = request(NeuronSnapshot::new(""), vec![]);
        let cluster_id = req.cluster_id;

        coord.save_cluster_membership_only(req, ctx).await.unwrap();
        assert!(coord.metadata_store().lookup(cluster_id).await.is_some());
        let (count, _) = coord.inspect_cluster_membership(cluster_id).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn resave_with_no_changes_skips_pack_write() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());
        let n1 = Uuid::new_v4();
        let req = request(NeuronSnapshot::new("cat"), vec![n1]);
        let cluster_id = req.cluster_id;

        let first = coord.save_cluster_membership_only(req, ctx).await.unwrap();
        assert_eq!(first.membership_packs_written, 1);

        let req2 = ClusterSaveRequest {
            cluster_id,
            concept_domain: "animals".to_string(),
            associated_concepts: vec!["cat".to_string()],
            representative_neuron: NeuronSnapshot::new("cat"),
            newly_added_since_persist: None,
            current_neuron_ids: vec![n1],
        };
        let second = coord.save_cluster_membership_only(req2, ctx).await.unwrap();
        assert_eq!(second.membership_packs_written, 0);
        assert_eq!(second.membership_packs_skipped, 1);
    }

    #[tokio::test]
    async fn changed_membership_metric_counts_only_the_clusters_that_actually_changed() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());

        // Same representative neuron shape -> both clusters land in the
        // same partition group.
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let c1 = request(NeuronSnapshot::new("cat"), vec![n1]);
        let c2 = request(NeuronSnapshot::new("cat"), vec![n2]);
        let c1_id = c1.cluster_id;
        let c2_id = c2.cluster_id;

        coord.save_clusters_efficient(vec![c1, c2], ctx).await.unwrap();

        // Resave both; only c2 gains a new neuron id, c1 is identical.
        let n3 = Uuid::new_v4();
        let c1_resave = ClusterSaveRequest {
            cluster_id: c1_id,
            concept_domain: "animals".to_string(),
            associated_concepts: vec!["cat".to_string()],
            representative_neuron: NeuronSnapshot::new("cat"),
            newly_added_since_persist: None,
            current_neuron_ids: vec![n1],
        };
        let c2_resave = ClusterSaveRequest {
            cluster_id: c2_id,
            concept_domain: "animals".to_string(),
            associated_concepts: vec!["cat".to_string()],
            representative_neuron: NeuronSnapshot::new("cat"),
            newly_added_since_persist: None,
            current_neuron_ids: vec![n2, n3],
        };
        let metrics = coord.save_clusters_efficient(vec![c1_resave, c2_resave], ctx).await.unwrap();

        assert_eq!(metrics.membership_packs_written, 1);
        assert_eq!(metrics.clusters_changed_membership, 1, "only c2 actually changed, not the whole partition group");
    }

    #[tokio::test]
    async fn partition_is_stable_across_resaves() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());
        let req = request(NeuronSnapshot::new("visual input"), vec![]);
        let cluster_id = req.cluster_id;

        coord.save_cluster_membership_only(req, ctx).await.unwrap();
        let first_partition = coord.metadata_store().lookup(cluster_id).await.unwrap().partition;

        // Resave with a wildly different representative neuron; partition
        // must not change because metadata already exists for this cluster.
        let req2 = ClusterSaveRequest {
            cluster_id,
            concept_domain: "animals".to_string(),
            associated_concepts: vec![],
            representative_neuron: NeuronSnapshot::new("motor movement"),
            newly_added_since_persist: None,
            current_neuron_ids: vec![],
        };
        coord.save_cluster_membership_only(req2, ctx).await.unwrap();
        let second_partition = coord.metadata_store().lookup(cluster_id).await.unwrap().partition;
        assert_eq!(first_partition, second_partition);
    }

    #[tokio::test]
    async fn bank_save_requires_existing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let neuron = NeuronSnapshot::new("cat");
        let metrics = coord
            .save_cluster_bank_only(Uuid::new_v4(), vec![neuron])
            .await
            .unwrap();
        assert_eq!(metrics.neuron_bank_partitions, 0);
        assert_eq!(metrics.neurons_upserted, 0);
    }

    #[tokio::test]
    async fn full_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());
        let neuron = NeuronSnapshot::new("cat");
        let neuron_id = neuron.id;
        let req = request(neuron.clone(), vec![neuron_id]);
        let cluster_id = req.cluster_id;

        coord
            .save_cluster_with_partitioning(req, vec![neuron], ctx)
            .await
            .unwrap();

        let loaded = coord.load_cluster_with_partitioning(cluster_id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, neuron_id);
    }

    #[tokio::test]
    async fn full_save_computes_and_persists_average_importance() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());

        let mut n1 = NeuronSnapshot::new("cat");
        n1.importance = 0.2;
        let mut n2 = NeuronSnapshot::new("cat");
        n2.importance = 0.8;
        let req = request(n1.clone(), vec![n1.id, n2.id]);
        let cluster_id = req.cluster_id;

        coord
            .save_cluster_with_partitioning(req, vec![n1, n2], ctx)
            .await
            .unwrap();

        let meta = coord.metadata_store().lookup(cluster_id).await.unwrap();
        assert!((meta.average_importance - 0.5).abs() < 1e-9);

        // Persisted, not just held in memory.
        let reloaded = PartitionMetadataStore::load(&coord.config().hierarchical_dir()).await;
        let reloaded_meta = reloaded.lookup(cluster_id).await.unwrap();
        assert!((reloaded_meta.average_importance - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn load_by_identifier_falls_back_to_cluster_file_scan() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path()).await;
        let ctx = PartitionContext::at(Utc::now());
        let neuron = NeuronSnapshot::new("cat");
        let neuron_id = neuron.id;
        let req = request(neuron.clone(), vec![neuron_id]);
        let cluster_id = req.cluster_id;

        coord
            .save_cluster_with_partitioning(req, vec![neuron], ctx)
            .await
            .unwrap();

        // A partial id string doesn't parse as a UUID, so this exercises the
        // fallback scan over per-cluster `.cluster.gz` files rather than the
        // fast metadata-lookup path.
        let partial = &crate::storage::canonical_id(cluster_id)[..12];
        let loaded = coord.load_cluster_by_identifier(partial).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, neuron_id);

        let none = coord.load_cluster_by_identifier("not-a-real-cluster").await.unwrap();
        assert!(none.is_empty());
    }
}
