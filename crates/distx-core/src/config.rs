//! # Optimizer Configuration
//!
//! A single immutable snapshot of session variables, passed by reference through
//! every phase of one optimization pass. All fields have defaults, so a JSON
//! override only needs to name the values it changes.

use crate::error::{OptimizerError, Result};
use serde::{Deserialize, Serialize};

/// How many phases to use for aggregations with DISTINCT aggregates.
///
/// `One` and `Two` rewrite distinct aggregates into `multi_distinct_*` combinators;
/// `Three` and `Four` plan a dedicated distinct stage. `Auto` picks three phases
/// when the aggregation has grouping keys and four otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggStageOverride {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Below this group-by ndv / input rows ratio a one-phase aggregation is used.
    pub low_cardinality_threshold: f64,
    /// At or above this ratio the local aggregation stage is marked streaming.
    pub high_cardinality_threshold: f64,
    /// Largest build side (rows) that may be broadcast.
    pub broadcast_row_count_threshold: u64,
    /// Largest build side (bytes) that may be broadcast.
    pub broadcast_size_threshold_bytes: u64,
    pub distinct_agg_stage_count_override: AggStageOverride,
    pub enable_colocate_join: bool,
    pub enable_bucket_shuffle_join: bool,
    /// Semi/anti joins with a broadcastable build side use a replicated build.
    pub enable_replicate_join: bool,
    pub enable_runtime_filter: bool,
    /// Remote multi-key runtime filters share partition expressions with the probe.
    pub enable_multi_column_runtime_filter: bool,
    pub rewrite_grouping_sets_to_union_all: bool,
    /// Negative: always inline CTEs. Zero: always reuse. Otherwise a CTE with several
    /// consumers is reused when inlining costs more than this multiple of reuse.
    pub cte_reuse_ratio_threshold: f64,
    /// Whether table row counts from statistics are trusted for one-phase aggregation.
    pub trust_table_row_count: bool,
    /// Number of backends the plan is distributed over.
    pub backend_count: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            low_cardinality_threshold: 0.05,
            high_cardinality_threshold: 0.5,
            broadcast_row_count_threshold: 15_000_000,
            broadcast_size_threshold_bytes: 100 * 1024 * 1024,
            distinct_agg_stage_count_override: AggStageOverride::Auto,
            enable_colocate_join: true,
            enable_bucket_shuffle_join: true,
            enable_replicate_join: false,
            enable_runtime_filter: true,
            enable_multi_column_runtime_filter: false,
            rewrite_grouping_sets_to_union_all: false,
            cte_reuse_ratio_threshold: 1.15,
            trust_table_row_count: true,
            backend_count: 3,
        }
    }
}

impl OptimizerConfig {
    /// Reject configurations that would make the planners' decisions meaningless.
    pub fn validate(&self) -> Result<()> {
        let ratio_ok = |v: f64| v.is_finite() && v >= 0.0;
        if !ratio_ok(self.low_cardinality_threshold) {
            return Err(OptimizerError::Config(format!(
                "low_cardinality_threshold must be a non-negative number, got {}",
                self.low_cardinality_threshold
            )));
        }
        if !ratio_ok(self.high_cardinality_threshold) {
            return Err(OptimizerError::Config(format!(
                "high_cardinality_threshold must be a non-negative number, got {}",
                self.high_cardinality_threshold
            )));
        }
        if self.low_cardinality_threshold > self.high_cardinality_threshold {
            return Err(OptimizerError::Config(format!(
                "low_cardinality_threshold ({}) exceeds high_cardinality_threshold ({})",
                self.low_cardinality_threshold, self.high_cardinality_threshold
            )));
        }
        if !self.cte_reuse_ratio_threshold.is_finite() {
            return Err(OptimizerError::Config(
                "cte_reuse_ratio_threshold must be finite".to_string(),
            ));
        }
        if self.backend_count == 0 {
            return Err(OptimizerError::Config(
                "backend_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
