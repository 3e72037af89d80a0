//! # EXPLAIN Rendering
//!
//! Renders a [`DistributedPlan`] as text, one `PLAN FRAGMENT` block per fragment
//! starting with the result fragment. Within a fragment the tree is printed with its
//! first child *below* the parent and the remaining children branched off with
//! `|----`, so the probe side of a join reads straight down and the build side hangs
//! to the side:
//!
//! ```text
//!   2:HASH JOIN
//!   |  join op: INNER JOIN (BROADCAST)
//!   |
//!   |----1:EXCHANGE
//!   |
//!   0:OlapScanNode
//!      TABLE: t0
//! ```

use crate::expr::{Expr, SortKey};
use crate::fragment::{DataSink, DistributedPlan, PlanFragment};
use crate::physical::{PhysicalOp, PlanNode};
use crate::runtime_filter::{ProbeRuntimeFilter, RuntimeFilterDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Append one line without trailing whitespace.
macro_rules! emit {
    ($out:expr, $($arg:tt)*) => {{
        let text = format!($($arg)*);
        $out.push_str(text.trim_end());
        $out.push('\n');
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainLevel {
    #[default]
    Normal,
    /// Adds cardinality and column statistics to every node.
    Costs,
}

pub fn explain(plan: &DistributedPlan, level: ExplainLevel) -> String {
    let mut out = String::new();
    for fragment in plan.fragments.iter().rev() {
        write_fragment(&mut out, fragment, level);
        out.push('\n');
    }
    out
}

fn write_fragment(out: &mut String, fragment: &PlanFragment, level: ExplainLevel) {
    emit!(out, "PLAN FRAGMENT {}", fragment.id);
    let exprs = match fragment.sink {
        DataSink::Result => fragment
            .output_columns
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" | "),
        _ => String::new(),
    };
    emit!(out, " OUTPUT EXPRS:{}", exprs);
    emit!(out, "  PARTITION: {}", fragment.partition);
    out.push('\n');

    match &fragment.sink {
        DataSink::Result => {
            emit!(out, "  RESULT SINK");
        }
        DataSink::Stream {
            exchange_id,
            partition,
            ..
        } => {
            emit!(out, "  STREAM DATA SINK");
            emit!(out, "    EXCHANGE ID: {:02}", exchange_id.0);
            emit!(out, "    {}", partition);
        }
        DataSink::MultiCast {
            cte_id,
            destinations,
        } => {
            let ids: Vec<String> = destinations.iter().map(|d| d.to_string()).collect();
            emit!(out, "  MULTI CAST DATA SINK");
            emit!(out, "    CTE ID: {}", cte_id);
            emit!(out, "    DESTINATION FRAGMENTS: {}", ids.join(", "));
        }
    }
    out.push('\n');
    write_node(out, &fragment.root, "  ", "  ", level);
}

fn write_node(out: &mut String, node: &PlanNode, first: &str, prefix: &str, level: ExplainLevel) {
    emit!(out, "{}{}:{}", first, node.id, title(node));
    let detail_prefix = if node.children.is_empty() {
        format!("{}   ", prefix)
    } else {
        format!("{}|  ", prefix)
    };
    let mut lines = details(node);
    if level == ExplainLevel::Costs {
        lines.extend(cost_details(node));
    }
    for line in lines {
        emit!(out, "{}{}", detail_prefix, line);
    }
    if node.children.is_empty() {
        return;
    }
    emit!(out, "{}|  ", prefix);
    for child in &node.children[1..] {
        write_node(
            out,
            child,
            &format!("{}|----", prefix),
            &format!("{}|    ", prefix),
            level,
        );
        emit!(out, "{}|    ", prefix);
    }
    write_node(out, &node.children[0], prefix, prefix, level);
}

fn title(node: &PlanNode) -> String {
    match &node.op {
        PhysicalOp::HashAggregate { mode, .. } => format!("{} ({})", node.op.name(), mode),
        _ => node.op.name().to_string(),
    }
}

fn details(node: &PlanNode) -> Vec<String> {
    let mut lines = Vec::new();
    match &node.op {
        PhysicalOp::OlapScan {
            table,
            predicates,
            rollup,
            pre_aggregation,
            runtime_filters,
            ..
        } => {
            lines.push(format!("TABLE: {}", table.name));
            lines.push(pre_aggregation.to_string());
            let conjuncts: Vec<&Expr> = predicates.all_conjuncts().collect();
            if !conjuncts.is_empty() {
                lines.push(format!("PREDICATES: {}", join_exprs(conjuncts, ", ")));
            }
            if let Some((selected, total)) = &predicates.selected_partitions {
                lines.push(format!("partitions={}/{}", selected.len(), total));
            }
            lines.push(format!("rollup: {}", rollup));
            probe_filter_lines(&mut lines, runtime_filters);
        }
        PhysicalOp::Filter { predicate } => lines.push(format!("predicates: {}", predicate)),
        PhysicalOp::Project { exprs } => {
            for (column, expr) in exprs {
                lines.push(format!("<slot {}> : {}", column.id, expr));
            }
        }
        PhysicalOp::HashJoin {
            join_type,
            distribution,
            eq_keys,
            other_condition,
            colocate_reason,
            runtime_filters,
        } => {
            lines.push(format!("join op: {} ({})", join_type, distribution));
            lines.push(format!(
                "colocate: {}, reason: {}",
                *distribution == crate::physical::JoinDistribution::Colocate,
                colocate_reason
            ));
            for (probe, build) in eq_keys {
                lines.push(format!("equal join conjunct: {} = {}", probe, build));
            }
            if let Some(other) = other_condition {
                lines.push(format!("other join predicates: {}", other));
            }
            build_filter_lines(&mut lines, runtime_filters);
        }
        PhysicalOp::NestLoopJoin { join_type, condition } => {
            lines.push(format!("join op: {}", join_type));
            if let Some(condition) = condition {
                lines.push(format!("other join predicates: {}", condition));
            }
        }
        PhysicalOp::HashAggregate {
            streaming,
            group_by,
            aggregates,
            ..
        } => {
            if *streaming {
                lines.push("STREAMING".to_string());
            }
            if !aggregates.is_empty() {
                let outputs: Vec<String> = aggregates.iter().map(|a| a.to_string()).collect();
                lines.push(format!("output: {}", outputs.join(", ")));
            }
            let keys: Vec<String> = group_by.iter().map(|c| c.to_string()).collect();
            lines.push(format!("group by: {}", keys.join(", ")));
        }
        PhysicalOp::Repeat {
            grouping_sets,
            grouping_id,
            ..
        } => {
            let sets: Vec<String> = grouping_sets
                .iter()
                .map(|set| {
                    let ids: Vec<String> = set.iter().map(|id| id.to_string()).collect();
                    format!("[{}]", ids.join(", "))
                })
                .collect();
            lines.push(format!(
                "repeat: repeat {} lines [{}]",
                grouping_sets.len().saturating_sub(1),
                sets.join(", ")
            ));
            lines.push(format!("grouping id: {}", grouping_id));
        }
        PhysicalOp::SetOperation { inputs, .. } => {
            lines.push("child exprs:".to_string());
            for columns in inputs {
                let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                lines.push(format!("    [{}]", cols.join(", ")));
            }
        }
        PhysicalOp::Sort { order, .. } => {
            lines.push(format!("order by: {}", order_by(order)));
            lines.push("offset: 0".to_string());
        }
        PhysicalOp::TopN {
            order,
            offset,
            count,
            ..
        } => {
            lines.push(format!("order by: {}", order_by(order)));
            lines.push(format!("offset: {}", offset));
            lines.push(format!("limit: {}", count));
        }
        PhysicalOp::Limit { offset, count } => {
            if *offset > 0 {
                lines.push(format!("offset: {}", offset));
            }
            lines.push(format!("limit: {}", count));
        }
        PhysicalOp::Exchange {
            offset,
            limit,
            runtime_filters,
            ..
        } => {
            if *offset > 0 {
                lines.push(format!("offset: {}", offset));
            }
            if let Some(limit) = limit {
                lines.push(format!("limit: {}", limit));
            }
            probe_filter_lines(&mut lines, runtime_filters);
        }
        PhysicalOp::CteConsumer {
            cte_id,
            runtime_filters,
            ..
        } => {
            lines.push(format!("cte_id = {}", cte_id));
            probe_filter_lines(&mut lines, runtime_filters);
        }
    }
    lines
}

fn cost_details(node: &PlanNode) -> Vec<String> {
    let mut lines = vec![format!("cardinality: {}", node.stats.row_count.round() as u64)];
    let known: Vec<String> = node
        .output
        .iter()
        .filter_map(|c| {
            let stat = node.stats.column_stats.get(&c.id)?;
            Some(format!("* {}-->{}", c.name, stat))
        })
        .collect();
    if !known.is_empty() {
        lines.push("column statistics: ".to_string());
        lines.extend(known);
    }
    lines
}

fn build_filter_lines(lines: &mut Vec<String>, filters: &[RuntimeFilterDescriptor]) {
    if filters.is_empty() {
        return;
    }
    lines.push("build runtime filters:".to_string());
    for f in filters {
        lines.push(format!(
            "- filter_id = {}, build_expr = ({}), remote = {}",
            f.id, f.build_expr, f.is_remote
        ));
    }
}

fn probe_filter_lines(lines: &mut Vec<String>, filters: &[ProbeRuntimeFilter]) {
    if filters.is_empty() {
        return;
    }
    lines.push("probe runtime filters:".to_string());
    for f in filters {
        let ids: Vec<String> = f.filter_ids.iter().map(|id| id.to_string()).collect();
        let mut line = format!("- filter_id = {}, probe_expr = ({})", ids.join(","), f.probe_expr);
        if !f.partition_exprs.is_empty() {
            let _ = write!(line, ", partition_exprs = ({})", join_exprs(&f.partition_exprs, ","));
        }
        lines.push(line);
    }
}

fn join_exprs<'a>(exprs: impl IntoIterator<Item = &'a Expr>, sep: &str) -> String {
    exprs
        .into_iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

fn order_by(order: &[SortKey]) -> String {
    order
        .iter()
        .map(|k| match &k.expr {
            Expr::Column(c) => format!("<slot {}> {}", c.id, k),
            _ => k.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::Cost;
    use crate::expr::*;
    use crate::fragment::{FragmentId, PlanFragment};
    use crate::physical::{JoinDistribution, PlanNodeId};
    use crate::properties::{DataPartition, Distribution};
    use crate::runtime_filter::RuntimeFilterId;
    use crate::stats::{ColumnStatistic, Statistics};

    fn c(id: u32) -> ColumnRef {
        ColumnRef::new(id, format!("v{}", id))
    }

    fn node(id: u32, op: PhysicalOp, children: Vec<PlanNode>) -> PlanNode {
        let output = op.output_columns(&children);
        PlanNode {
            id: PlanNodeId(id),
            op,
            children,
            stats: Statistics::new(10000.0)
                .with_column(ColumnId(1), ColumnStatistic::new(0.0, 3.0, 0.0, 8.0, 4.0)),
            cost: Cost::zero(),
            distribution: Distribution::Any,
            output,
        }
    }

    fn sample() -> DistributedPlan {
        let scan = node(
            0,
            PhysicalOp::OlapScan {
                table: TableRef::new("db", "t0"),
                columns: vec![c(1)],
                predicates: ScanOperatorPredicates::default(),
                rollup: "t0".to_string(),
                pre_aggregation: PreAggregation::On,
                bucket: None,
                runtime_filters: vec![ProbeRuntimeFilter {
                    filter_ids: vec![RuntimeFilterId(0)],
                    probe_expr: Expr::col(&c(1)),
                    partition_exprs: vec![],
                }],
            },
            vec![],
        );
        let build = node(
            1,
            PhysicalOp::Exchange {
                kind: crate::properties::ExchangeKind::Broadcast,
                merge_order: None,
                offset: 0,
                limit: None,
                runtime_filters: vec![],
            },
            vec![],
        );
        let join = node(
            2,
            PhysicalOp::HashJoin {
                join_type: JoinType::Inner,
                distribution: JoinDistribution::Broadcast,
                eq_keys: vec![(c(1), c(5))],
                other_condition: None,
                colocate_reason: String::new(),
                runtime_filters: vec![RuntimeFilterDescriptor {
                    id: RuntimeFilterId(0),
                    build_expr: Expr::col(&c(5)),
                    probe_expr: Expr::col(&c(1)),
                    is_remote: false,
                    partition_exprs: vec![],
                }],
            },
            vec![scan, build],
        );
        DistributedPlan {
            fragments: vec![PlanFragment {
                id: FragmentId(0),
                root: join,
                partition: DataPartition::Random,
                sink: DataSink::Result,
                output_columns: vec![c(1)],
            }],
            output_columns: vec![c(1)],
        }
    }

    #[test]
    fn test_join_layout() {
        let text = explain(&sample(), ExplainLevel::Normal);
        let expected = "\
PLAN FRAGMENT 0
 OUTPUT EXPRS:1: v1
  PARTITION: RANDOM

  RESULT SINK

  2:HASH JOIN
  |  join op: INNER JOIN (BROADCAST)
  |  colocate: false, reason:
  |  equal join conjunct: 1: v1 = 5: v5
  |  build runtime filters:
  |  - filter_id = 0, build_expr = (5: v5), remote = false
  |
  |----1:EXCHANGE
  |
  0:OlapScanNode
     TABLE: t0
     PREAGGREGATION: ON
     rollup: t0
     probe runtime filters:
     - filter_id = 0, probe_expr = (1: v1)
";
        assert_eq!(text.trim_end(), expected.trim_end());
    }

    #[test]
    fn test_costs_level_prints_statistics() {
        let text = explain(&sample(), ExplainLevel::Costs);
        assert!(text.contains("cardinality: 10000"));
        assert!(text.contains("* v1-->[0.0, 3.0, 0.0, 8.0, 4.0] ESTIMATE"));
    }
}
