//! Partition assignment: classifying a cluster into the four-segment
//! hierarchical path described in §4.1 / §6 of the spec.
//!
//! Classification is a pure function over a representative neuron and a
//! small context; it never touches disk. Stability (reusing a cluster's
//! existing partition) is the coordinator's responsibility, not this
//! module's — see `coordinator::BatchedSaveCoordinator`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::NeuronSnapshot;

/// Functional role, scored from a neuron's concept tags against four
/// disjoint keyword vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Functional {
    Sensory,
    Motor,
    Memory,
    Association,
    General,
}

/// Plasticity bucket, derived from learning rate, fatigue, and an adaptation
/// level computed from activation count, input count, and importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plasticity {
    HighAdaptive,
    ModeratePlastic,
    LowFatigued,
    StableMature,
    Baseline,
}

/// Topological role, derived from connection count, weight variance, and
/// importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Hub,
    Bridge,
    Specialized,
    Modular,
    Peripheral,
}

/// Temporal bucket, derived from age, recency, and activation rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temporal {
    ActiveFrequent,
    RecentModerate,
    ArchivedRecent,
    ConsolidatedImportant,
    Dormant,
}

macro_rules! segment_str {
    ($ty:ty, $( $variant:ident => $name:literal ),+ $(,)?) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(<$ty>::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

segment_str!(Functional,
    Sensory => "sensory",
    Motor => "motor",
    Memory => "memory",
    Association => "association",
    General => "general",
);

segment_str!(Plasticity,
    HighAdaptive => "high_adaptive",
    ModeratePlastic => "moderate_plastic",
    LowFatigued => "low_fatigued",
    StableMature => "stable_mature",
    Baseline => "baseline",
);

segment_str!(Topology,
    Hub => "hub",
    Bridge => "bridge",
    Specialized => "specialized",
    Modular => "modular",
    Peripheral => "peripheral",
);

segment_str!(Temporal,
    ActiveFrequent => "active_frequent",
    RecentModerate => "recent_moderate",
    ArchivedRecent => "archived_recent",
    ConsolidatedImportant => "consolidated_important",
    Dormant => "dormant",
);

/// A four-segment hierarchical path: `functional/plasticity/topology/temporal`.
///
/// Once a cluster has a metadata record, its `PartitionPath` is reused
/// verbatim on subsequent saves (the coordinator enforces this; this type is
/// just the value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionPath {
    pub functional: Functional,
    pub plasticity: Plasticity,
    pub topology: Topology,
    pub temporal: Temporal,
}

impl PartitionPath {
    /// The sentinel path assigned to an empty cluster.
    pub fn sentinel() -> Self {
        Self {
            functional: Functional::General,
            plasticity: Plasticity::Baseline,
            topology: Topology::Peripheral,
            temporal: Temporal::Dormant,
        }
    }

    /// Relative directory path, e.g. `functional/sensory/plasticity/baseline/topology/hub/temporal/dormant`.
    pub fn relative_dir(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!(
            "functional/{}/plasticity/{}/topology/{}/temporal/{}",
            self.functional, self.plasticity, self.topology, self.temporal
        ))
    }
}

impl fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_dir().display())
    }
}

/// Context used for temporal classification (the "now" against which ages
/// are measured). Kept explicit rather than calling `Utc::now()` inline so
/// classification stays a pure, testable function.
#[derive(Debug, Clone, Copy)]
pub struct PartitionContext {
    pub now: DateTime<Utc>,
}

impl PartitionContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

const SENSORY_KEYWORDS: &[&str] = &["visual", "auditory", "tactile", "sensory", "perception", "input"];
const MOTOR_KEYWORDS: &[&str] = &["motor", "movement", "action", "muscle", "motion"];
const MEMORY_KEYWORDS: &[&str] = &["memory", "recall", "storage", "retention", "encode"];
const ASSOCIATION_KEYWORDS: &[&str] = &["association", "link", "relation", "connection", "pattern"];

fn score_keywords(concepts: &[String], vocab: &[&str]) -> usize {
    concepts
        .iter()
        .filter(|c| {
            let lower = c.to_lowercase();
            vocab.iter().any(|kw| lower.contains(kw))
        })
        .count()
}

/// Classify the functional segment from a representative neuron's concepts.
/// Ties are broken by vocabulary declaration order (sensory, motor, memory,
/// association); an all-zero score yields `General`.
pub fn classify_functional(concepts: &[String]) -> Functional {
    let scores = [
        (Functional::Sensory, score_keywords(concepts, SENSORY_KEYWORDS)),
        (Functional::Motor, score_keywords(concepts, MOTOR_KEYWORDS)),
        (Functional::Memory, score_keywords(concepts, MEMORY_KEYWORDS)),
        (Functional::Association, score_keywords(concepts, ASSOCIATION_KEYWORDS)),
    ];
    let mut best: Option<(Functional, usize)> = None;
    for (f, s) in scores {
        if s == 0 {
            continue;
        }
        if best.is_none_or(|(_, best_score)| s > best_score) {
            best = Some((f, s));
        }
    }
    best.map(|(f, _)| f).unwrap_or(Functional::General)
}

/// `mean(min(1, activationCount/100), min(1, |inputs|/50), min(1, importance))`.
fn adaptation_level(neuron: &NeuronSnapshot) -> f64 {
    let activation_term = (neuron.activation_count as f64 / 100.0).min(1.0);
    let input_term = (neuron.input_weights.len() as f64 / 50.0).min(1.0);
    let importance_term = neuron.importance.min(1.0);
    (activation_term + input_term + importance_term) / 3.0
}

/// Classify the plasticity segment from activation count, input breadth,
/// and importance (learning rate / fatigue proxies).
pub fn classify_plasticity(neuron: &NeuronSnapshot) -> Plasticity {
    let adaptation = adaptation_level(neuron);
    let fatigue = 1.0 - (neuron.activation_count as f64 / 200.0).min(1.0);

    if adaptation >= 0.7 {
        Plasticity::HighAdaptive
    } else if adaptation >= 0.4 {
        Plasticity::ModeratePlastic
    } else if fatigue < 0.3 {
        Plasticity::LowFatigued
    } else if neuron.activation_count > 500 {
        Plasticity::StableMature
    } else {
        Plasticity::Baseline
    }
}

/// Classify the topology segment from connection count, weight variance,
/// and importance.
pub fn classify_topology(neuron: &NeuronSnapshot) -> Topology {
    let connections = neuron.connection_count();
    let variance = neuron.weight_variance();

    if connections >= 20 && neuron.importance >= 0.6 {
        Topology::Hub
    } else if connections >= 10 && variance > 0.5 {
        Topology::Bridge
    } else if variance > 1.0 {
        Topology::Specialized
    } else if connections >= 4 {
        Topology::Modular
    } else {
        Topology::Peripheral
    }
}

/// Classify the temporal segment from age, recency, and activation rate.
pub fn classify_temporal(neuron: &NeuronSnapshot, ctx: PartitionContext) -> Temporal {
    let days_since_created = (ctx.now - neuron.created_at).num_days().max(0) as f64;
    let days_since_used = (ctx.now - neuron.last_used).num_days().max(0) as f64;
    let activation_rate = neuron.activation_count as f64 / days_since_created.max(1.0);

    if days_since_used > 60.0 {
        Temporal::Dormant
    } else if days_since_used <= 1.0 && activation_rate >= 5.0 {
        Temporal::ActiveFrequent
    } else if days_since_used <= 7.0 {
        Temporal::RecentModerate
    } else if neuron.importance >= 0.8 {
        Temporal::ConsolidatedImportant
    } else {
        Temporal::ArchivedRecent
    }
}

/// Classify a whole `PartitionPath` from one representative neuron. Callers
/// pick the representative (e.g. the cluster's highest-importance neuron);
/// an empty cluster should use [`PartitionPath::sentinel`] instead of calling
/// this.
pub fn classify(neuron: &NeuronSnapshot, ctx: PartitionContext) -> PartitionPath {
    PartitionPath {
        functional: classify_functional(&neuron.all_concepts()),
        plasticity: classify_plasticity(neuron),
        topology: classify_topology(neuron),
        temporal: classify_temporal(neuron, ctx),
    }
}
