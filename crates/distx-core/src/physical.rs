//! # Physical Plan
//!
//! Physical operators describe *how* to compute a result: which join algorithm and
//! distribution strategy, which aggregation stage, where data moves between
//! backends. A [`PlanNode`] is one operator of the chosen physical tree together with
//! its derived statistics, accumulated cost, delivered distribution and output
//! columns.

use crate::cost::Cost;
use crate::expr::*;
use crate::properties::{Distribution, ExchangeKind, HashDistribution};
use crate::runtime_filter::{ProbeRuntimeFilter, RuntimeFilterDescriptor};
use crate::stats::Statistics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a plan node; also used as the exchange id of exchange nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub u32);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distribution strategy of a hash join. Fixed once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinDistribution {
    /// The build side is sent to every backend.
    Broadcast,
    /// Both sides are hash-partitioned on the join keys.
    Shuffle,
    /// Both sides are already bucketed compatibly; no data moves.
    Colocate,
    /// Only the build side moves, partitioned by the probe side's bucket function.
    BucketShuffle,
    /// Semi/anti join with a replicated build side.
    Replicated,
}

impl JoinDistribution {
    /// Preference order: colocate, bucket shuffle, broadcast/replicated, shuffle.
    pub fn precedence(self) -> u8 {
        match self {
            JoinDistribution::Colocate => 4,
            JoinDistribution::BucketShuffle => 3,
            JoinDistribution::Broadcast | JoinDistribution::Replicated => 2,
            JoinDistribution::Shuffle => 1,
        }
    }

    /// Whether the build side is partitioned across backends.
    pub fn is_partitioned(self) -> bool {
        matches!(self, JoinDistribution::Shuffle | JoinDistribution::BucketShuffle)
    }
}

impl fmt::Display for JoinDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinDistribution::Broadcast => "BROADCAST",
            JoinDistribution::Shuffle => "PARTITIONED",
            JoinDistribution::Colocate => "COLOCATE",
            JoinDistribution::BucketShuffle => "BUCKET_SHUFFLE",
            JoinDistribution::Replicated => "REPLICATED",
        };
        write!(f, "{}", s)
    }
}

/// Stage of a hash aggregation.
///
/// `Update` consumes raw rows, `Merge` consumes intermediate states. `Serialize`
/// emits intermediate states for a later stage, `Finalize` emits final values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggMode {
    UpdateFinalize,
    UpdateSerialize,
    MergeSerialize,
    MergeFinalize,
}

impl fmt::Display for AggMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggMode::UpdateFinalize => "update finalize",
            AggMode::UpdateSerialize => "update serialize",
            AggMode::MergeSerialize => "merge serialize",
            AggMode::MergeFinalize => "merge finalize",
        };
        write!(f, "{}", s)
    }
}

/// Physical operators: represent *how* to compute a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalOp {
    /// Scan of a table or one of its rollups.
    OlapScan {
        table: TableRef,
        columns: Vec<ColumnRef>,
        predicates: ScanOperatorPredicates,
        /// Name of the scanned index (the table name for the base index).
        rollup: String,
        pre_aggregation: PreAggregation,
        /// Storage bucketing of the scanned rows, when the bucket columns are output.
        bucket: Option<HashDistribution>,
        runtime_filters: Vec<ProbeRuntimeFilter>,
    },
    Filter {
        predicate: Expr,
    },
    Project {
        exprs: Vec<(ColumnRef, Expr)>,
    },
    /// Hash join; the right child is the build side.
    HashJoin {
        join_type: JoinType,
        distribution: JoinDistribution,
        /// `(probe column, build column)` pairs.
        eq_keys: Vec<(ColumnRef, ColumnRef)>,
        other_condition: Option<Expr>,
        /// Why a colocate join was not chosen; empty when it was.
        colocate_reason: String,
        runtime_filters: Vec<RuntimeFilterDescriptor>,
    },
    /// Nested-loop join for conditions without an equi key.
    NestLoopJoin {
        join_type: JoinType,
        condition: Option<Expr>,
    },
    HashAggregate {
        mode: AggMode,
        /// Local pre-aggregation that passes rows through when grouping does not pay off.
        streaming: bool,
        group_by: Vec<ColumnRef>,
        aggregates: Vec<AggExpr>,
    },
    Repeat {
        repeat_columns: Vec<ColumnRef>,
        grouping_sets: Vec<Vec<ColumnId>>,
        grouping_id: ColumnRef,
    },
    SetOperation {
        kind: SetOpKind,
        output: Vec<ColumnRef>,
        inputs: Vec<Vec<ColumnRef>>,
    },
    /// Sort; `partial` sorts run per backend below a merging exchange.
    Sort {
        order: Vec<SortKey>,
        partial: bool,
    },
    TopN {
        order: Vec<SortKey>,
        offset: u64,
        count: u64,
        partial: bool,
    },
    Limit {
        offset: u64,
        count: u64,
    },
    /// Data movement between backends; becomes a fragment boundary.
    Exchange {
        kind: ExchangeKind,
        /// Set on a merging exchange that preserves the children's sort order.
        merge_order: Option<Vec<SortKey>>,
        offset: u64,
        limit: Option<u64>,
        runtime_filters: Vec<ProbeRuntimeFilter>,
    },
    /// Reads a reused CTE from its multicast producer fragment.
    CteConsumer {
        cte_id: CteId,
        columns: Vec<(ColumnRef, ColumnId)>,
        runtime_filters: Vec<ProbeRuntimeFilter>,
    },
}

impl PhysicalOp {
    /// Operator name as printed in EXPLAIN.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::OlapScan { .. } => "OlapScanNode",
            PhysicalOp::Filter { .. } => "SELECT",
            PhysicalOp::Project { .. } => "Project",
            PhysicalOp::HashJoin { .. } => "HASH JOIN",
            PhysicalOp::NestLoopJoin { .. } => "NESTLOOP JOIN",
            PhysicalOp::HashAggregate { .. } => "AGGREGATE",
            PhysicalOp::Repeat { .. } => "REPEAT_NODE",
            PhysicalOp::SetOperation { kind, .. } => match kind {
                SetOpKind::UnionAll | SetOpKind::Union => "UNION",
                SetOpKind::Intersect => "INTERSECT",
                SetOpKind::Except => "EXCEPT",
            },
            PhysicalOp::Sort { .. } => "SORT",
            PhysicalOp::TopN { .. } => "TOP-N",
            PhysicalOp::Limit { .. } => "LIMIT",
            PhysicalOp::Exchange { merge_order, .. } => {
                if merge_order.is_some() {
                    "MERGING-EXCHANGE"
                } else {
                    "EXCHANGE"
                }
            }
            PhysicalOp::CteConsumer { .. } => "CTE SCAN",
        }
    }

    /// Output columns of this operator over the given children.
    pub fn output_columns(&self, children: &[PlanNode]) -> Vec<ColumnRef> {
        let child = |i: usize| children.get(i).map(|c| c.output.clone()).unwrap_or_default();
        match self {
            PhysicalOp::OlapScan { columns, .. } => columns.clone(),
            PhysicalOp::Filter { .. }
            | PhysicalOp::Sort { .. }
            | PhysicalOp::TopN { .. }
            | PhysicalOp::Limit { .. }
            | PhysicalOp::Exchange { .. } => child(0),
            PhysicalOp::Project { exprs } => exprs.iter().map(|(c, _)| c.clone()).collect(),
            PhysicalOp::HashJoin { join_type, .. } | PhysicalOp::NestLoopJoin { join_type, .. } => {
                let mut out = child(0);
                if join_type.outputs_right() {
                    out.extend(child(1));
                }
                out
            }
            PhysicalOp::HashAggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .cloned()
                .chain(aggregates.iter().map(|a| a.output.clone()))
                .collect(),
            PhysicalOp::Repeat { grouping_id, .. } => {
                let mut out = child(0);
                out.push(grouping_id.clone());
                out
            }
            PhysicalOp::SetOperation { output, .. } => output.clone(),
            PhysicalOp::CteConsumer { columns, .. } => columns.iter().map(|(c, _)| c.clone()).collect(),
        }
    }
}

/// One node of the chosen physical tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub op: PhysicalOp,
    pub children: Vec<PlanNode>,
    pub stats: Statistics,
    /// Cost of this node including all of its children.
    pub cost: Cost,
    pub distribution: Distribution,
    pub output: Vec<ColumnRef>,
}

impl PlanNode {
    /// Post-order visit of every node in this subtree.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        for child in &self.children {
            child.visit(f);
        }
        f(self);
    }

    /// Find the first node (pre-order) matching the predicate.
    pub fn find(&self, pred: &impl Fn(&PlanNode) -> bool) -> Option<&PlanNode> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(pred))
    }

    /// Compact one-line-per-node tree dump, used in logs and test failures.
    pub fn display(&self, indent: usize) -> String {
        let pad = "  ".repeat(indent);
        let detail = match &self.op {
            PhysicalOp::HashJoin {
                join_type,
                distribution,
                ..
            } => format!("{} ({})", join_type, distribution),
            PhysicalOp::HashAggregate { mode, .. } => format!("({})", mode),
            PhysicalOp::Exchange { kind, .. } => format!("{}", kind.partition()),
            PhysicalOp::OlapScan { table, rollup, .. } => format!("{} rollup={}", table, rollup),
            _ => String::new(),
        };
        let mut s = format!(
            "{}{}:{} {} rows={:.0} cost={:.2}\n",
            pad, self.id, self.op.name(), detail, self.stats.row_count, self.cost.total
        );
        for child in &self.children {
            s.push_str(&child.display(indent + 1));
        }
        s
    }
}

/// The chosen physical tree plus the implemented body of every reused CTE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub root: PlanNode,
    pub cte_producers: BTreeMap<CteId, PlanNode>,
}

impl PhysicalPlan {
    /// Post-order visit of the root tree and then every producer tree.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        self.root.visit(f);
        for producer in self.cte_producers.values() {
            producer.visit(f);
        }
    }
}
