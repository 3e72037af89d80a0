//! # Runtime Filter Planner
//!
//! A hash join builds a filter from its build-side keys (a bloom filter or a value
//! set at execution time) and ships it to the probe side, where scans drop rows
//! that cannot find a join partner before they ever reach the join.
//!
//! The planner runs on the finished physical tree:
//!
//! 1. **Generation**: every hash join of a type that tolerates probe-side filtering
//!    (inner, right outer, left semi) produces one [`RuntimeFilterDescriptor`] per
//!    equi-key pair. Ids are assigned in post-order.
//! 2. **Propagation**: the probe expression is pushed down the probe lineage,
//!    rewritten through projections and set-operation ordinals, until it reaches
//!    the scans that produce it. Limit and TopN stop propagation; the nearest
//!    Exchange above them receives the filter instead.
//! 3. **CTE reconciliation**: a filter reaching a reused CTE consumer is held back.
//!    When every consumer of that CTE received a filter on the same producer
//!    expression, the union of those filters is pushed into the producer plan.
//!    Otherwise each filter is attached to its consumer node.
//!
//! Attachments are collected by [`PlanNodeId`] and applied in one final rebuild, so
//! the tree is never mutated while it is being walked.

use crate::config::OptimizerConfig;
use crate::expr::{ColumnId, ColumnRef, CteId, Expr, JoinType};
use crate::physical::{PhysicalOp, PhysicalPlan, PlanNode, PlanNodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeFilterId(pub u32);

impl fmt::Display for RuntimeFilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build side of a runtime filter, attached to the hash join that produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFilterDescriptor {
    pub id: RuntimeFilterId,
    pub build_expr: Expr,
    pub probe_expr: Expr,
    /// The build side is partitioned across backends, so the filter must be merged
    /// globally before use.
    pub is_remote: bool,
    pub partition_exprs: Vec<Expr>,
}

/// Probe side of one or more runtime filters, attached to a scan, an exchange or a
/// CTE consumer. Several ids appear when filters from different consumers of one
/// CTE were merged into the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRuntimeFilter {
    pub filter_ids: Vec<RuntimeFilterId>,
    pub probe_expr: Expr,
    pub partition_exprs: Vec<Expr>,
}

impl ProbeRuntimeFilter {
    fn bound_by(&self, ids: &HashSet<ColumnId>) -> bool {
        self.probe_expr.bound_by(ids) && self.partition_exprs.iter().all(|e| e.bound_by(ids))
    }

    fn substitute(&self, mapping: &HashMap<ColumnId, Expr>) -> Self {
        Self {
            filter_ids: self.filter_ids.clone(),
            probe_expr: self.probe_expr.substitute(mapping),
            partition_exprs: self.partition_exprs.iter().map(|e| e.substitute(mapping)).collect(),
        }
    }
}

/// A filter held at a CTE consumer, expressed in producer columns.
#[derive(Debug, Clone)]
struct PendingCteFilter {
    consumer: PlanNodeId,
    at_consumer: ProbeRuntimeFilter,
    in_producer: ProbeRuntimeFilter,
}

/// Plan, propagate and attach runtime filters. A no-op when runtime filters are
/// disabled.
pub fn plan_runtime_filters(plan: PhysicalPlan, config: &OptimizerConfig) -> PhysicalPlan {
    if !config.enable_runtime_filter {
        return plan;
    }
    let attachments = {
        let mut planner = RuntimeFilterPlanner::new(&plan, config);
        planner.generate(&plan.root);
        for producer in plan.cte_producers.values() {
            planner.generate(producer);
        }
        planner.reconcile_ctes();
        debug!(
            filters = planner.next_id,
            probe_targets = planner.probe.values().map(Vec::len).sum::<usize>(),
            "runtime filters planned"
        );
        planner.into_attachments()
    };

    let PhysicalPlan {
        root,
        cte_producers,
    } = plan;
    PhysicalPlan {
        root: attachments.attach(root),
        cte_producers: cte_producers
            .into_iter()
            .map(|(id, node)| (id, attachments.attach(node)))
            .collect(),
    }
}

/// Planned filters keyed by the node they attach to, detached from the plan they
/// were planned over.
struct Attachments {
    build: HashMap<PlanNodeId, Vec<RuntimeFilterDescriptor>>,
    probe: HashMap<PlanNodeId, Vec<ProbeRuntimeFilter>>,
}

struct RuntimeFilterPlanner<'a> {
    config: &'a OptimizerConfig,
    producers: &'a BTreeMap<CteId, PlanNode>,
    consumer_counts: HashMap<CteId, usize>,
    next_id: u32,
    build: HashMap<PlanNodeId, Vec<RuntimeFilterDescriptor>>,
    probe: HashMap<PlanNodeId, Vec<ProbeRuntimeFilter>>,
    pending: BTreeMap<CteId, Vec<PendingCteFilter>>,
}

impl<'a> RuntimeFilterPlanner<'a> {
    fn new(plan: &'a PhysicalPlan, config: &'a OptimizerConfig) -> Self {
        let mut consumer_counts = HashMap::new();
        plan.visit(&mut |node| {
            if let PhysicalOp::CteConsumer { cte_id, .. } = &node.op {
                *consumer_counts.entry(*cte_id).or_insert(0) += 1;
            }
        });
        Self {
            config,
            producers: &plan.cte_producers,
            consumer_counts,
            next_id: 0,
            build: HashMap::new(),
            probe: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    fn generate(&mut self, node: &PlanNode) {
        for child in &node.children {
            self.generate(child);
        }
        let PhysicalOp::HashJoin {
            join_type,
            distribution,
            eq_keys,
            ..
        } = &node.op
        else {
            return;
        };
        if !matches!(join_type, JoinType::Inner | JoinType::Right | JoinType::Semi) || eq_keys.is_empty() {
            return;
        }
        let Some(probe_side) = node.children.first() else {
            return;
        };
        let is_remote = distribution.is_partitioned();
        let multi_column =
            is_remote && self.config.enable_multi_column_runtime_filter && eq_keys.len() > 1;
        let (probe_partition, build_partition): (Vec<Expr>, Vec<Expr>) = if multi_column {
            eq_keys
                .iter()
                .map(|(l, r)| (Expr::col(l), Expr::col(r)))
                .unzip()
        } else {
            (Vec::new(), Vec::new())
        };

        for (probe_col, build_col) in eq_keys {
            let id = RuntimeFilterId(self.next_id);
            self.next_id += 1;
            let descriptor = RuntimeFilterDescriptor {
                id,
                build_expr: Expr::col(build_col),
                probe_expr: Expr::col(probe_col),
                is_remote,
                partition_exprs: build_partition.clone(),
            };
            let filter = ProbeRuntimeFilter {
                filter_ids: vec![id],
                probe_expr: Expr::col(probe_col),
                partition_exprs: probe_partition.clone(),
            };
            let accepted = self.push(probe_side, filter);
            trace!(filter = id.0, join = node.id.0, accepted, "runtime filter generated");
            self.build.entry(node.id).or_default().push(descriptor);
        }
    }

    /// Push `filter` into `node`. Returns whether some node accepted it.
    fn push(&mut self, node: &PlanNode, filter: ProbeRuntimeFilter) -> bool {
        let output: HashSet<ColumnId> = node.output.iter().map(|c| c.id).collect();
        if !filter.bound_by(&output) {
            return false;
        }
        match &node.op {
            PhysicalOp::OlapScan { .. } => {
                self.attach_probe(node.id, filter);
                true
            }
            PhysicalOp::Filter { .. } | PhysicalOp::Sort { .. } => self.push_first(node, filter),
            PhysicalOp::Limit { .. } | PhysicalOp::TopN { .. } => false,
            PhysicalOp::Exchange { .. } => {
                if self.push_first(node, filter.clone()) {
                    return true;
                }
                self.attach_probe(node.id, filter);
                true
            }
            PhysicalOp::Project { exprs } => {
                let mapping: HashMap<ColumnId, Expr> =
                    exprs.iter().map(|(c, e)| (c.id, e.clone())).collect();
                self.push_first(node, filter.substitute(&mapping))
            }
            PhysicalOp::HashAggregate { group_by, .. } => {
                let keys: HashSet<ColumnId> = group_by.iter().map(|c| c.id).collect();
                filter.bound_by(&keys) && self.push_first(node, filter)
            }
            PhysicalOp::Repeat {
                repeat_columns,
                grouping_sets,
                ..
            } => {
                let stable = filter
                    .probe_expr
                    .column_ids()
                    .into_iter()
                    .chain(filter.partition_exprs.iter().flat_map(|e| e.column_ids()))
                    .all(|id| {
                        !repeat_columns.iter().any(|c| c.id == id)
                            || grouping_sets.iter().all(|set| set.contains(&id))
                    });
                stable && self.push_first(node, filter)
            }
            PhysicalOp::HashJoin { join_type, eq_keys, .. } => {
                let inner_keys: &[(ColumnRef, ColumnRef)] = if *join_type == JoinType::Inner {
                    eq_keys.as_slice()
                } else {
                    &[]
                };
                self.push_join(node, filter, inner_keys)
            }
            PhysicalOp::NestLoopJoin { .. } => self.push_join(node, filter, &[]),
            PhysicalOp::SetOperation { output, inputs, .. } => {
                let mut accepted = false;
                for (child, columns) in node.children.iter().zip(inputs) {
                    let mapping: HashMap<ColumnId, Expr> = output
                        .iter()
                        .zip(columns)
                        .map(|(out, input)| (out.id, Expr::col(input)))
                        .collect();
                    accepted |= self.push(child, filter.substitute(&mapping));
                }
                accepted
            }
            PhysicalOp::CteConsumer { cte_id, columns, .. } => {
                let producers = self.producers;
                let Some(producer) = producers.get(cte_id) else {
                    return false;
                };
                let mapping: HashMap<ColumnId, Expr> = columns
                    .iter()
                    .filter_map(|(out, source)| {
                        producer
                            .output
                            .iter()
                            .find(|c| c.id == *source)
                            .map(|c| (out.id, Expr::col(c)))
                    })
                    .collect();
                let in_producer = filter.substitute(&mapping);
                self.pending.entry(*cte_id).or_default().push(PendingCteFilter {
                    consumer: node.id,
                    at_consumer: filter,
                    in_producer,
                });
                true
            }
        }
    }

    fn push_first(&mut self, node: &PlanNode, filter: ProbeRuntimeFilter) -> bool {
        match node.children.first() {
            Some(child) => self.push(child, filter),
            None => false,
        }
    }

    /// Push into the join side that produces the filter's columns. Across inner
    /// equi keys the filter is also pushed to the other side under the matching key.
    fn push_join(
        &mut self,
        node: &PlanNode,
        filter: ProbeRuntimeFilter,
        inner_keys: &[(ColumnRef, ColumnRef)],
    ) -> bool {
        let mut accepted = false;
        for child in &node.children {
            let ids: HashSet<ColumnId> = child.output.iter().map(|c| c.id).collect();
            if filter.bound_by(&ids) {
                accepted |= self.push(child, filter.clone());
            }
        }
        if inner_keys.is_empty() || !filter.partition_exprs.is_empty() {
            return accepted;
        }
        let Expr::Column(probe) = &filter.probe_expr else {
            return accepted;
        };
        for (left, right) in inner_keys {
            let (other, side) = if left.id == probe.id {
                (right, 1)
            } else if right.id == probe.id {
                (left, 0)
            } else {
                continue;
            };
            if let Some(child) = node.children.get(side) {
                let equivalent = ProbeRuntimeFilter {
                    filter_ids: filter.filter_ids.clone(),
                    probe_expr: Expr::col(other),
                    partition_exprs: Vec::new(),
                };
                accepted |= self.push(child, equivalent);
            }
        }
        accepted
    }

    fn attach_probe(&mut self, id: PlanNodeId, filter: ProbeRuntimeFilter) {
        self.probe.entry(id).or_default().push(filter);
    }

    /// Resolve filters held at CTE consumers, outermost CTEs first so that filters
    /// pushed into a producer can reach the consumers nested inside it.
    fn reconcile_ctes(&mut self) {
        let producers = self.producers;
        for cte_id in consumers_first(producers) {
            let Some(pending) = self.pending.remove(&cte_id) else {
                continue;
            };
            let consumers = self.consumer_counts.get(&cte_id).copied().unwrap_or(0);

            // Group by producer expression; a group covering every consumer is pushed.
            let mut groups: Vec<(Expr, Vec<&PendingCteFilter>)> = Vec::new();
            for entry in &pending {
                match groups.iter_mut().find(|(e, _)| *e == entry.in_producer.probe_expr) {
                    Some((_, members)) => members.push(entry),
                    None => groups.push((entry.in_producer.probe_expr.clone(), vec![entry])),
                }
            }
            let mut merged = HashSet::new();
            for (expr, members) in &groups {
                let covered: HashSet<PlanNodeId> = members.iter().map(|m| m.consumer).collect();
                if covered.len() != consumers {
                    continue;
                }
                let Some(producer) = producers.get(&cte_id) else {
                    continue;
                };
                let mut filter_ids: Vec<RuntimeFilterId> =
                    members.iter().flat_map(|m| m.in_producer.filter_ids.clone()).collect();
                filter_ids.sort();
                filter_ids.dedup();
                let first_partition = &members[0].in_producer.partition_exprs;
                let partition_exprs = if members
                    .iter()
                    .all(|m| &m.in_producer.partition_exprs == first_partition)
                {
                    first_partition.clone()
                } else {
                    Vec::new()
                };
                let union = ProbeRuntimeFilter {
                    filter_ids,
                    probe_expr: expr.clone(),
                    partition_exprs,
                };
                debug!(cte = cte_id.0, filters = ?union.filter_ids, "runtime filter pushed into CTE producer");
                if self.push(producer, union) {
                    merged.extend(members.iter().flat_map(|m| m.at_consumer.filter_ids.clone()));
                }
            }

            for entry in pending {
                if entry.at_consumer.filter_ids.iter().all(|id| merged.contains(id)) {
                    continue;
                }
                self.attach_probe(entry.consumer, entry.at_consumer);
            }
        }
    }

    fn into_attachments(self) -> Attachments {
        Attachments {
            build: self.build,
            probe: self.probe,
        }
    }
}

impl Attachments {
    fn attach(&self, mut node: PlanNode) -> PlanNode {
        node.children = std::mem::take(&mut node.children)
            .into_iter()
            .map(|c| self.attach(c))
            .collect();
        match &mut node.op {
            PhysicalOp::HashJoin { runtime_filters, .. } => {
                if let Some(filters) = self.build.get(&node.id) {
                    runtime_filters.extend(filters.iter().cloned());
                }
            }
            PhysicalOp::OlapScan { runtime_filters, .. }
            | PhysicalOp::Exchange { runtime_filters, .. }
            | PhysicalOp::CteConsumer { runtime_filters, .. } => {
                if let Some(filters) = self.probe.get(&node.id) {
                    runtime_filters.extend(filters.iter().cloned());
                }
            }
            _ => {}
        }
        node
    }
}

/// CTE ids ordered so that a CTE comes after every producer that consumes it.
fn consumers_first(producers: &BTreeMap<CteId, PlanNode>) -> Vec<CteId> {
    fn visit(
        id: CteId,
        producers: &BTreeMap<CteId, PlanNode>,
        seen: &mut HashSet<CteId>,
        order: &mut Vec<CteId>,
    ) {
        if !seen.insert(id) {
            return;
        }
        if let Some(root) = producers.get(&id) {
            let mut deps = Vec::new();
            root.visit(&mut |n| {
                if let PhysicalOp::CteConsumer { cte_id, .. } = &n.op {
                    deps.push(*cte_id);
                }
            });
            for dep in deps {
                visit(dep, producers, seen, order);
            }
        }
        order.push(id);
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for id in producers.keys() {
        visit(*id, producers, &mut seen, &mut order);
    }
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::Cost;
    use crate::expr::*;
    use crate::physical::JoinDistribution;
    use crate::properties::{Distribution, ExchangeKind};
    use crate::stats::Statistics;

    fn c(id: u32) -> ColumnRef {
        ColumnRef::new(id, format!("v{}", id))
    }

    fn node(id: u32, op: PhysicalOp, children: Vec<PlanNode>) -> PlanNode {
        let output = op.output_columns(&children);
        PlanNode {
            id: PlanNodeId(id),
            op,
            children,
            stats: Statistics::new(1.0),
            cost: Cost::zero(),
            distribution: Distribution::Any,
            output,
        }
    }

    fn scan(id: u32, table: &str, cols: &[u32]) -> PlanNode {
        node(
            id,
            PhysicalOp::OlapScan {
                table: TableRef::new("db", table),
                columns: cols.iter().map(|i| c(*i)).collect(),
                predicates: ScanOperatorPredicates::default(),
                rollup: table.to_string(),
                pre_aggregation: PreAggregation::On,
                bucket: None,
                runtime_filters: vec![],
            },
            vec![],
        )
    }

    fn join(id: u32, distribution: JoinDistribution, keys: &[(u32, u32)], l: PlanNode, r: PlanNode) -> PlanNode {
        node(
            id,
            PhysicalOp::HashJoin {
                join_type: JoinType::Inner,
                distribution,
                eq_keys: keys.iter().map(|(a, b)| (c(*a), c(*b))).collect(),
                other_condition: None,
                colocate_reason: String::new(),
                runtime_filters: vec![],
            },
            vec![l, r],
        )
    }

    fn exchange(id: u32, kind: ExchangeKind, child: PlanNode) -> PlanNode {
        node(
            id,
            PhysicalOp::Exchange {
                kind,
                merge_order: None,
                offset: 0,
                limit: None,
                runtime_filters: vec![],
            },
            vec![child],
        )
    }

    fn probe_filters(plan: &PhysicalPlan, id: u32) -> Vec<ProbeRuntimeFilter> {
        let mut found = Vec::new();
        plan.visit(&mut |n| {
            if n.id == PlanNodeId(id) {
                if let PhysicalOp::OlapScan { runtime_filters, .. }
                | PhysicalOp::Exchange { runtime_filters, .. }
                | PhysicalOp::CteConsumer { runtime_filters, .. } = &n.op
                {
                    found = runtime_filters.clone();
                }
            }
        });
        found
    }

    fn plan(root: PlanNode) -> PhysicalPlan {
        PhysicalPlan {
            root,
            cte_producers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_filter_follows_projection_lineage() {
        // project 10 := v1 over scan(v1); join on 10 = 5
        let project = node(
            1,
            PhysicalOp::Project {
                exprs: vec![(c(10), Expr::col(&c(1)))],
            },
            vec![scan(0, "t0", &[1])],
        );
        let shuffled = exchange(2, ExchangeKind::Shuffle(vec![c(10)]), project);
        let build = exchange(4, ExchangeKind::Shuffle(vec![c(5)]), scan(3, "t1", &[5]));
        let root = join(5, JoinDistribution::Shuffle, &[(10, 5)], shuffled, build);

        let result = plan_runtime_filters(plan(root), &OptimizerConfig::default());
        let filters = probe_filters(&result, 0);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].probe_expr, Expr::col(&c(1)));
        assert_eq!(filters[0].filter_ids, vec![RuntimeFilterId(0)]);
        assert!(probe_filters(&result, 2).is_empty());

        match &result.root.op {
            PhysicalOp::HashJoin { runtime_filters, .. } => {
                assert_eq!(runtime_filters.len(), 1);
                assert!(runtime_filters[0].is_remote);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_limit_blocks_and_exchange_receives() {
        let limit = node(1, PhysicalOp::Limit { offset: 0, count: 10 }, vec![scan(0, "t0", &[1])]);
        let gathered = exchange(2, ExchangeKind::Gather, limit);
        let root = join(4, JoinDistribution::Broadcast, &[(1, 5)], gathered, scan(3, "t1", &[5]));

        let result = plan_runtime_filters(plan(root), &OptimizerConfig::default());
        assert!(probe_filters(&result, 0).is_empty());
        assert_eq!(probe_filters(&result, 2).len(), 1);
    }

    #[test]
    fn test_inner_equi_keys_carry_filter_to_both_sides() {
        // (t0.v1 = t1.v2) joined to t2 on v1
        let lower = join(2, JoinDistribution::Broadcast, &[(1, 2)], scan(0, "t0", &[1]), scan(1, "t1", &[2]));
        let root = join(4, JoinDistribution::Broadcast, &[(1, 5)], lower, scan(3, "t2", &[5]));

        let result = plan_runtime_filters(plan(root), &OptimizerConfig::default());
        assert!(probe_filters(&result, 0).iter().any(|f| f.filter_ids == vec![RuntimeFilterId(1)]));
        let on_t1 = probe_filters(&result, 1);
        assert_eq!(on_t1.len(), 1);
        assert_eq!(on_t1[0].probe_expr, Expr::col(&c(2)));
    }

    #[test]
    fn test_multi_column_partition_exprs() {
        let l = exchange(1, ExchangeKind::Shuffle(vec![c(1), c(2)]), scan(0, "t0", &[1, 2]));
        let r = exchange(3, ExchangeKind::Shuffle(vec![c(5), c(6)]), scan(2, "t1", &[5, 6]));
        let root = join(4, JoinDistribution::Shuffle, &[(1, 5), (2, 6)], l, r);
        let config = OptimizerConfig {
            enable_multi_column_runtime_filter: true,
            ..Default::default()
        };
        let result = plan_runtime_filters(plan(root), &config);
        let filters = probe_filters(&result, 0);
        assert_eq!(filters.len(), 2);
        assert!(filters
            .iter()
            .all(|f| f.partition_exprs == vec![Expr::col(&c(1)), Expr::col(&c(2))]));
    }

    #[test]
    fn test_union_branches_and_cte_producers_receive_filters() {
        let union = node(
            2,
            PhysicalOp::SetOperation {
                kind: SetOpKind::UnionAll,
                output: vec![c(10)],
                inputs: vec![vec![c(1)], vec![c(2)]],
            },
            vec![scan(0, "t0", &[1]), scan(1, "t1", &[2])],
        );
        let root = join(4, JoinDistribution::Broadcast, &[(10, 5)], union, scan(3, "t2", &[5]));
        let producer = join(22, JoinDistribution::Broadcast, &[(20, 21)], scan(20, "t3", &[20]), scan(21, "t4", &[21]));
        let mut physical = plan(root);
        physical.cte_producers.insert(CteId(0), producer);

        let result = plan_runtime_filters(physical, &OptimizerConfig::default());
        let on_t0 = probe_filters(&result, 0);
        let on_t1 = probe_filters(&result, 1);
        assert_eq!(on_t0.len(), 1);
        assert_eq!(on_t1.len(), 1);
        assert_eq!(on_t0[0].probe_expr, Expr::col(&c(1)));
        assert_eq!(on_t1[0].probe_expr, Expr::col(&c(2)));
        assert_eq!(on_t0[0].filter_ids, on_t1[0].filter_ids);
        // filters planned inside a producer stay with that producer
        assert_eq!(probe_filters(&result, 20).len(), 1);
    }

    #[test]
    fn test_disabled_planner_is_a_no_op() {
        let root = join(2, JoinDistribution::Broadcast, &[(1, 5)], scan(0, "t0", &[1]), scan(1, "t1", &[5]));
        let config = OptimizerConfig {
            enable_runtime_filter: false,
            ..Default::default()
        };
        let result = plan_runtime_filters(plan(root), &config);
        assert!(probe_filters(&result, 0).is_empty());
    }
}
