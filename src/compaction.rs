//! Compaction planner: proposes relocations of clusters between temporal
//! sub-partitions based on access recency (§4.8). Planning only — execution
//! of the proposed moves is left to a future extension (§9 open question).

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::ClusterMetadata;
use crate::partition::{PartitionPath, Temporal};

const DORMANT_AFTER_DAYS: i64 = 30;
const PROMOTE_WITHIN_DAYS: i64 = 7;

/// One proposed relocation: a cluster moving from its current partition to
/// `to`, with `functional`/`plasticity`/`topology` preserved and only the
/// `temporal` segment changing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelocationPlan {
    pub cluster_id: Uuid,
    pub from: PartitionPath,
    pub to: PartitionPath,
    pub reason: RelocationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationReason {
    /// Last accessed more than 30 days ago; move to `temporal/dormant`.
    Dormant,
    /// In `temporal/dormant` but accessed within 7 days; promote to
    /// `temporal/recent_moderate`.
    Reactivated,
}

/// Evaluates cluster metadata and proposes temporal relocations without
/// executing them.
pub struct CompactionPlanner {
    now: DateTime<Utc>,
}

impl CompactionPlanner {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Run the planner over a metadata snapshot, returning every proposed
    /// relocation. Clusters needing no change are omitted.
    pub fn plan(&self, clusters: &[ClusterMetadata]) -> Vec<RelocationPlan> {
        clusters
            .iter()
            .filter_map(|cluster| self.plan_one(cluster))
            .collect()
    }

    fn plan_one(&self, cluster: &ClusterMetadata) -> Option<RelocationPlan> {
        let days_since_access = (self.now - cluster.last_accessed).num_days();

        if cluster.partition.temporal != Temporal::Dormant && days_since_access > DORMANT_AFTER_DAYS {
            let mut to = cluster.partition;
            to.temporal = Temporal::Dormant;
            return Some(RelocationPlan {
                cluster_id: cluster.cluster_id,
                from: cluster.partition,
                to,
                reason: RelocationReason::Dormant,
            });
        }

        if cluster.partition.temporal == Temporal::Dormant && days_since_access <= PROMOTE_WITHIN_DAYS {
            let mut to = cluster.partition;
            to.temporal = Temporal::RecentModerate;
            return Some(RelocationPlan {
                cluster_id: cluster.cluster_id,
                from: cluster.partition,
                to,
                reason: RelocationReason::Reactivated,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionPath;
    use chrono::Duration;

    fn meta_at(temporal: Temporal, days_since_access: i64, now: DateTime<Utc>) -> ClusterMetadata {
        let mut meta = ClusterMetadata::new(Uuid::new_v4(), "animals", PartitionPath::sentinel());
        meta.partition.temporal = temporal;
        meta.last_accessed = now - Duration::days(days_since_access);
        meta
    }

    #[test]
    fn proposes_dormant_relocation_after_thirty_days() {
        let now = Utc::now();
        let cluster = meta_at(Temporal::ActiveFrequent, 45, now);
        let planner = CompactionPlanner::at(now);
        let plan = planner.plan(&[cluster]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].reason, RelocationReason::Dormant);
        assert_eq!(plan[0].to.temporal, Temporal::Dormant);
    }

    #[test]
    fn promotes_dormant_cluster_accessed_recently() {
        let now = Utc::now();
        let cluster = meta_at(Temporal::Dormant, 2, now);
        let planner = CompactionPlanner::at(now);
        let plan = planner.plan(&[cluster]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].reason, RelocationReason::Reactivated);
        assert_eq!(plan[0].to.temporal, Temporal::RecentModerate);
    }

    #[test]
    fn no_plan_for_stable_cluster() {
        let now = Utc::now();
        let cluster = meta_at(Temporal::ActiveFrequent, 1, now);
        let planner = CompactionPlanner::at(now);
        assert!(planner.plan(&[cluster]).is_empty());
    }
}
