//! # Distribution Properties
//!
//! Every physical plan node *delivers* a [`Distribution`] describing how its output
//! rows are spread over the backends, and operators *require* a
//! [`DistributionRequirement`] from their inputs. When a child's distribution does
//! not satisfy the requirement, an Exchange is inserted as an enforcer (see
//! [`crate::rule::OptContext::enforce`]).
//!
//! ## Satisfaction Rules
//!
//! - Aggregations accept any hash distribution on a non-empty **subset** of their
//!   grouping keys: equal groups are then already on the same backend.
//! - Shuffle joins and set operations require an **exact** hash distribution on
//!   their keys, because both inputs must use the same hash function on the same
//!   key order.
//! - Bucket-shuffle requires the bucket layout of the probe side.
//!
//! ## Exchange Partitioning
//!
//! An exchange carries one of four partitioning modes, [`DataPartition`]:
//! `Unpartitioned` (gather/broadcast), `Random`, `HashPartitioned(cols)` and
//! `BucketShuffleHashPartitioned(cols)`.

use crate::expr::{ColumnId, ColumnRef, Expr, JoinType, SetOpKind};
use crate::physical::{JoinDistribution, PhysicalOp, PlanNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Bucket layout of a storage-bucketed table.
///
/// Two sides with equal specs put equal bucket values on the same backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Colocate group, or the table name when the table is not in a group.
    pub group: String,
    pub buckets: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashSource {
    /// Produced by a hash-partitioned exchange.
    Shuffle,
    /// Produced by storage bucketing (or a bucket-shuffle exchange).
    Bucket(BucketSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashDistribution {
    pub columns: Vec<ColumnRef>,
    pub source: HashSource,
}

impl HashDistribution {
    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.id).collect()
    }
}

/// How the output of a plan node is spread across backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Distribution {
    /// Rows are spread without a known placement.
    #[default]
    Any,
    /// All rows are on a single backend.
    Single,
    /// Every backend holds all rows.
    Replicated,
    /// Rows are placed by a hash of `columns`.
    Hash(HashDistribution),
}

/// What a parent needs from one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionRequirement {
    Any,
    Single,
    Replicated,
    /// Hash distribution on exactly these columns, in this order.
    ShuffleHash(Vec<ColumnRef>),
    /// Hash distribution on any non-empty subset of these columns.
    HashSubset(Vec<ColumnRef>),
    /// Hash distribution on these columns with the given bucket layout.
    BucketShuffle {
        columns: Vec<ColumnRef>,
        spec: BucketSpec,
    },
}

impl Distribution {
    pub fn satisfies(&self, required: &DistributionRequirement) -> bool {
        match required {
            DistributionRequirement::Any => true,
            DistributionRequirement::Single => *self == Distribution::Single,
            DistributionRequirement::Replicated => *self == Distribution::Replicated,
            // Both sides must use the exchange hash function, not a bucket function.
            DistributionRequirement::ShuffleHash(cols) => match self {
                Distribution::Hash(h) => {
                    h.source == HashSource::Shuffle && same_columns(&h.columns, cols)
                }
                _ => false,
            },
            DistributionRequirement::HashSubset(cols) => match self {
                Distribution::Single => true,
                Distribution::Hash(h) => {
                    !h.columns.is_empty()
                        && h.columns.iter().all(|c| cols.iter().any(|g| g.id == c.id))
                }
                _ => false,
            },
            DistributionRequirement::BucketShuffle { columns, spec } => match self {
                Distribution::Hash(HashDistribution {
                    columns: have,
                    source: HashSource::Bucket(s),
                }) => s == spec && same_columns(have, columns),
                _ => false,
            },
        }
    }

    /// The bucket layout when rows are placed by storage bucketing.
    pub fn bucket(&self) -> Option<(&[ColumnRef], &BucketSpec)> {
        match self {
            Distribution::Hash(HashDistribution {
                columns,
                source: HashSource::Bucket(spec),
            }) => Some((columns.as_slice(), spec)),
            _ => None,
        }
    }
}

fn same_columns(a: &[ColumnRef], b: &[ColumnRef]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}

/// Exchange kinds inserted by the planners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Collect everything on one backend.
    Gather,
    /// Send every row to every backend.
    Broadcast,
    /// Hash-partition on the columns.
    Shuffle(Vec<ColumnRef>),
    /// Hash-partition on the columns with the target table's bucket function.
    BucketShuffle(Vec<ColumnRef>, BucketSpec),
    RoundRobin,
}

impl ExchangeKind {
    /// The exchange that turns any distribution into one satisfying `required`.
    pub fn for_requirement(required: &DistributionRequirement) -> Option<Self> {
        match required {
            DistributionRequirement::Any => None,
            DistributionRequirement::Single => Some(ExchangeKind::Gather),
            DistributionRequirement::Replicated => Some(ExchangeKind::Broadcast),
            DistributionRequirement::ShuffleHash(cols) | DistributionRequirement::HashSubset(cols) => {
                if cols.is_empty() {
                    Some(ExchangeKind::Gather)
                } else {
                    Some(ExchangeKind::Shuffle(cols.clone()))
                }
            }
            DistributionRequirement::BucketShuffle { columns, spec } => {
                Some(ExchangeKind::BucketShuffle(columns.clone(), spec.clone()))
            }
        }
    }

    pub fn partition(&self) -> DataPartition {
        match self {
            ExchangeKind::Gather | ExchangeKind::Broadcast => DataPartition::Unpartitioned,
            ExchangeKind::RoundRobin => DataPartition::Random,
            ExchangeKind::Shuffle(cols) => DataPartition::HashPartitioned(cols.clone()),
            ExchangeKind::BucketShuffle(cols, _) => {
                DataPartition::BucketShuffleHashPartitioned(cols.clone())
            }
        }
    }

    /// Distribution of the exchange's output.
    pub fn delivered(&self) -> Distribution {
        match self {
            ExchangeKind::Gather => Distribution::Single,
            ExchangeKind::Broadcast => Distribution::Replicated,
            ExchangeKind::RoundRobin => Distribution::Any,
            ExchangeKind::Shuffle(cols) => Distribution::Hash(HashDistribution {
                columns: cols.clone(),
                source: HashSource::Shuffle,
            }),
            ExchangeKind::BucketShuffle(cols, spec) => Distribution::Hash(HashDistribution {
                columns: cols.clone(),
                source: HashSource::Bucket(spec.clone()),
            }),
        }
    }
}

/// Partitioning mode carried by an exchange (and by a fragment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataPartition {
    Unpartitioned,
    Random,
    HashPartitioned(Vec<ColumnRef>),
    BucketShuffleHashPartitioned(Vec<ColumnRef>),
}

impl fmt::Display for DataPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |cols: &[ColumnRef]| {
            cols.iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            DataPartition::Unpartitioned => write!(f, "UNPARTITIONED"),
            DataPartition::Random => write!(f, "RANDOM"),
            DataPartition::HashPartitioned(cols) => write!(f, "HASH_PARTITIONED: {}", join(cols)),
            DataPartition::BucketShuffleHashPartitioned(cols) => {
                write!(f, "BUCKET_SHUFFLE_HASH_PARTITIONED: {}", join(cols))
            }
        }
    }
}

/// Distribution delivered by a physical operator over the given children.
pub fn derive_distribution(op: &PhysicalOp, children: &[PlanNode]) -> Distribution {
    let child = |i: usize| {
        children
            .get(i)
            .map(|c| c.distribution.clone())
            .unwrap_or(Distribution::Any)
    };
    match op {
        PhysicalOp::OlapScan { bucket, .. } => bucket
            .clone()
            .map(Distribution::Hash)
            .unwrap_or(Distribution::Any),
        PhysicalOp::Filter { .. }
        | PhysicalOp::Sort { .. }
        | PhysicalOp::TopN { .. }
        | PhysicalOp::Limit { .. } => child(0),
        PhysicalOp::Project { exprs } => project_distribution(child(0), exprs),
        PhysicalOp::HashJoin {
            join_type,
            distribution,
            eq_keys,
            ..
        } => match distribution {
            JoinDistribution::Shuffle => {
                // Null-extended probe rows are no longer placed by the probe keys.
                if matches!(join_type, JoinType::Right | JoinType::Full) {
                    Distribution::Any
                } else {
                    Distribution::Hash(HashDistribution {
                        columns: eq_keys.iter().map(|(l, _)| l.clone()).collect(),
                        source: HashSource::Shuffle,
                    })
                }
            }
            _ => match (child(0), join_type) {
                (Distribution::Hash(_), JoinType::Right | JoinType::Full) => Distribution::Any,
                (d, _) => d,
            },
        },
        PhysicalOp::NestLoopJoin { .. } => child(0),
        PhysicalOp::HashAggregate { group_by, .. } => match child(0) {
            Distribution::Hash(h)
                if h.columns.iter().all(|c| group_by.iter().any(|g| g.id == c.id)) =>
            {
                Distribution::Hash(h)
            }
            Distribution::Single => Distribution::Single,
            _ => Distribution::Any,
        },
        PhysicalOp::Repeat { .. } => match child(0) {
            Distribution::Single => Distribution::Single,
            _ => Distribution::Any,
        },
        PhysicalOp::SetOperation { kind, output, .. } => match kind {
            SetOpKind::UnionAll => {
                if children.iter().all(|c| c.distribution == Distribution::Single) && !children.is_empty() {
                    Distribution::Single
                } else {
                    Distribution::Any
                }
            }
            _ => Distribution::Hash(HashDistribution {
                columns: output.clone(),
                source: HashSource::Shuffle,
            }),
        },
        PhysicalOp::Exchange { kind, .. } => kind.delivered(),
        PhysicalOp::CteConsumer { .. } => Distribution::Any,
    }
}

/// A projection keeps a hash distribution when every hash column passes through
/// unchanged; the columns are renamed to the projection's outputs.
fn project_distribution(input: Distribution, exprs: &[(ColumnRef, Expr)]) -> Distribution {
    let Distribution::Hash(h) = input else {
        return input;
    };
    let passthrough: HashMap<ColumnId, &ColumnRef> = exprs
        .iter()
        .filter_map(|(out, e)| match e {
            Expr::Column(c) => Some((c.id, out)),
            _ => None,
        })
        .collect();
    let mapped: Option<Vec<ColumnRef>> = h
        .columns
        .iter()
        .map(|c| passthrough.get(&c.id).map(|o| (*o).clone()))
        .collect();
    match mapped {
        Some(columns) => Distribution::Hash(HashDistribution {
            columns,
            source: h.source,
        }),
        None => Distribution::Any,
    }
}
