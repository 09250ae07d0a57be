//! On-disk storage components: the neuron bank, membership pack, partition
//! metadata store, stats cache, and concept capacity store.

mod cluster_file;
mod concept_capacity;
mod file_lock;
mod membership_pack;
mod metadata_store;
mod neuron_bank;
mod stats_cache;

pub use cluster_file::{find_by_identifier as find_cluster_file_by_identifier, write as write_cluster_file, ClusterFileRecord};
pub use concept_capacity::ConceptCapacityStore;
pub use file_lock::FileLockRegistry;
pub use membership_pack::{MembershipPack, MembershipPackStore, MembershipUpdate};
pub use metadata_store::PartitionMetadataStore;
pub use neuron_bank::NeuronBank;
pub use stats_cache::{StatsCache, StorageStats};

use uuid::Uuid;

/// Render a UUID as 32 lowercase hex characters, no dashes — the on-disk
/// canonical id form mandated by §6.
pub fn canonical_id(id: Uuid) -> String {
    id.simple().to_string()
}

/// Parse a canonical (hex-32) or hyphenated UUID string, normalizing either
/// form. Encountered hyphenated keys are accepted on read per the §9 open
/// question, but never written back out in that form.
pub fn parse_canonical_id(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

/// Shared capability seam across the partition-scoped stores, favoring
/// composition over the source's store-subtyping (§9 open question).
/// `StatsCache`'s background refresh walks whichever stores are registered
/// against this trait rather than reaching into their concrete types.
#[async_trait::async_trait]
pub trait PartitionStore: Send + Sync {
    /// Bytes this store currently occupies under `partition_dir`, or `None`
    /// if the store has no file there.
    async fn disk_bytes(&self, partition_dir: &std::path::Path) -> std::io::Result<Option<u64>>;
}

#[async_trait::async_trait]
impl PartitionStore for NeuronBank {
    async fn disk_bytes(&self, partition_dir: &std::path::Path) -> std::io::Result<Option<u64>> {
        file_size(&partition_dir.join("neurons.bank.json.gz")).await
    }
}

#[async_trait::async_trait]
impl PartitionStore for MembershipPackStore {
    async fn disk_bytes(&self, partition_dir: &std::path::Path) -> std::io::Result<Option<u64>> {
        file_size(&partition_dir.join("membership.pack.json.gz")).await
    }
}

async fn file_size(path: &std::path::Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
