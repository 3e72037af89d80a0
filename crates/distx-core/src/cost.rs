//! # Cost Model
//!
//! Every physical plan node carries a [`Cost`]: one number the implementation pass
//! compares to pick among candidate plans.
//!
//! `DefaultCostModel` prices an operator by the rows it processes (cpu), the bytes
//! it keeps in hash tables and sort buffers (memory) and the bytes its exchange
//! moves between backends (network):
//!
//! ```text
//! local = cpu_weight * rows + memory_weight * held_bytes + network_weight * moved_bytes
//! ```
//!
//! Network weighs ten times the other two by default.
//!
//! ## Cost Accumulation
//!
//! A node's cost is its local cost plus the costs of its children, summed as
//! [`crate::rule::OptContext`] builds nodes bottom-up. Comparing two roots
//! therefore compares whole plans.
//!
//! ## Distribution Awareness
//!
//! Broadcasting multiplies the transferred bytes by the number of backends, and a
//! replicated hash table is built on every backend. This is what makes a broadcast
//! of a large build side lose against a shuffle.

use crate::config::OptimizerConfig;
use crate::physical::{JoinDistribution, PhysicalOp};
use crate::properties::ExchangeKind;
use crate::stats::Statistics;
use serde::{Deserialize, Serialize};

/// Cost is a single comparable value representing the estimated expense of a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    /// The total weighted cost. Lower is better.
    pub total: f64,
}

impl Cost {
    pub fn zero() -> Self {
        Self { total: 0.0 }
    }

    pub fn new(total: f64) -> Self {
        Self { total }
    }

    pub fn infinite() -> Self {
        Self { total: f64::MAX }
    }

    pub fn is_infinite(&self) -> bool {
        self.total == f64::MAX
    }
}

/// Epsilon-based equality to handle floating-point imprecision in cost comparisons.
impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        (self.total - other.total).abs() < f64::EPSILON
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total.partial_cmp(&other.total)
    }
}

/// Trait for pluggable cost models.
pub trait CostModel: Send + Sync {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        input_stats: &[&Statistics],
        output_stats: &Statistics,
        children_costs: &[Cost],
        config: &OptimizerConfig,
    ) -> Cost;
}

/// Weighted cpu/memory/network cost model.
pub struct DefaultCostModel {
    pub cpu_weight: f64,
    pub memory_weight: f64,
    pub network_weight: f64,
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self {
            cpu_weight: 1.0,
            memory_weight: 1.0,
            network_weight: 10.0,
        }
    }
}

impl CostModel for DefaultCostModel {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        input_stats: &[&Statistics],
        output_stats: &Statistics,
        children_costs: &[Cost],
        config: &OptimizerConfig,
    ) -> Cost {
        let children_total: f64 = children_costs.iter().map(|c| c.total).sum();
        let backends = config.backend_count.max(1) as f64;
        let input_rows = |i: usize| input_stats.get(i).map(|s| s.row_count).unwrap_or(0.0);
        let input_size = |i: usize| input_stats.get(i).map(|s| s.output_size()).unwrap_or(0.0);

        let local_cost = match op {
            // Reading every selected row from storage.
            PhysicalOp::OlapScan { .. } => self.cpu_weight * output_stats.output_size(),
            PhysicalOp::Filter { .. } | PhysicalOp::Project { .. } => self.cpu_weight * input_rows(0),
            // Build a hash table on the right input, probe with the left.
            // A broadcast build side is materialized on every backend.
            PhysicalOp::HashJoin { distribution, .. } => {
                let copies = match distribution {
                    JoinDistribution::Broadcast | JoinDistribution::Replicated => backends,
                    _ => 1.0,
                };
                self.cpu_weight * (input_rows(0) + input_rows(1) + output_stats.row_count)
                    + self.memory_weight * input_size(1) * copies
            }
            PhysicalOp::NestLoopJoin { .. } => {
                self.cpu_weight * input_rows(0) * input_rows(1).max(1.0)
                    + self.memory_weight * input_size(1) * backends
            }
            PhysicalOp::HashAggregate { streaming, .. } => {
                let memory = if *streaming {
                    0.0
                } else {
                    output_stats.output_size()
                };
                self.cpu_weight * input_rows(0) + self.memory_weight * memory
            }
            PhysicalOp::Repeat { .. } => self.cpu_weight * output_stats.row_count,
            PhysicalOp::SetOperation { kind, .. } => {
                let rows: f64 = input_stats.iter().map(|s| s.row_count).sum();
                let memory = match kind {
                    crate::expr::SetOpKind::UnionAll => 0.0,
                    _ => output_stats.output_size(),
                };
                self.cpu_weight * rows + self.memory_weight * memory
            }
            PhysicalOp::Sort { .. } => {
                let rows = input_rows(0);
                let n_log_n = if rows > 1.0 { rows * rows.log2() } else { 1.0 };
                self.cpu_weight * n_log_n + self.memory_weight * input_size(0)
            }
            PhysicalOp::TopN { count, offset, .. } => {
                let rows = input_rows(0);
                let heap = ((count + offset) as f64).max(2.0);
                self.cpu_weight * rows * heap.log2()
            }
            PhysicalOp::Limit { .. } => 0.0,
            // Network transfer dominates; a broadcast sends everything to every backend.
            PhysicalOp::Exchange { kind, .. } => {
                let size = input_size(0);
                let copies = match kind {
                    ExchangeKind::Broadcast => backends,
                    _ => 1.0,
                };
                self.network_weight * size * copies
            }
            PhysicalOp::CteConsumer { .. } => self.cpu_weight * output_stats.row_count,
        };

        Cost::new(children_total + local_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::*;
    use crate::stats::ColumnStatistic;

    fn stats(rows: f64) -> Statistics {
        Statistics::new(rows).with_column(ColumnId(1), ColumnStatistic::new(0.0, 1.0, 0.0, 8.0, rows))
    }

    #[test]
    fn test_broadcast_exchange_scales_with_backends() {
        let model = DefaultCostModel::default();
        let config = OptimizerConfig::default();
        let input = stats(1000.0);
        let exchange = |kind| PhysicalOp::Exchange {
            kind,
            merge_order: None,
            offset: 0,
            limit: None,
            runtime_filters: vec![],
        };
        let broadcast = model.compute_cost(
            &exchange(ExchangeKind::Broadcast),
            &[&input],
            &input,
            &[Cost::zero()],
            &config,
        );
        let shuffle = model.compute_cost(
            &exchange(ExchangeKind::Shuffle(vec![ColumnRef::new(1, "v1")])),
            &[&input],
            &input,
            &[Cost::zero()],
            &config,
        );
        assert!((broadcast.total - shuffle.total * config.backend_count as f64).abs() < 1e-6);
    }

    #[test]
    fn test_hash_join_prefers_small_build_side() {
        let model = DefaultCostModel::default();
        let config = OptimizerConfig::default();
        let small = stats(100.0);
        let large = stats(1_000_000.0);
        let out = stats(1_000_000.0);
        let join = PhysicalOp::HashJoin {
            join_type: JoinType::Inner,
            distribution: JoinDistribution::Shuffle,
            eq_keys: vec![],
            other_condition: None,
            colocate_reason: String::new(),
            runtime_filters: vec![],
        };
        let small_build = model.compute_cost(&join, &[&large, &small], &out, &[Cost::zero(); 2], &config);
        let large_build = model.compute_cost(&join, &[&small, &large], &out, &[Cost::zero(); 2], &config);
        assert!(small_build < large_build);
    }
}
