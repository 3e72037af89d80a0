//! # Statistics for Cost-Based Optimization
//!
//! This module defines the statistics structures and derivation formulas used by the
//! cost model and the planners. Every plan node carries a [`Statistics`]: an output
//! row count plus one [`ColumnStatistic`] per output column, keyed by column id.
//!
//! ## Column Statistics
//!
//! A column statistic is the tuple `[min, max, nulls, width, ndv]` plus a
//! known/unknown flag. Missing statistics never fail the optimization: they produce
//! the [`ColumnStatistic::unknown`] sentinel, which propagates conservatively.
//!
//! ## Derivation Formulas
//!
//! Statistics for intermediate plan nodes are derived bottom-up:
//!
//! - **Scan / Filter**: rows × Π selectivity(conjunct). Equality is `1 / ndv`,
//!   ranges use the overlap fraction of `[min, max]`, everything else `1 / 10`.
//! - **Join**: `|L| × |R| / max(ndv(a), ndv(b))` per key pair; `max(|L|, |R|)` if a
//!   key statistic is unknown; never above `|L| × |R|`.
//! - **Aggregate**: `min(Π ndv(g), rows)`; any unknown ndv keeps the input rows.
//! - **Repeat**: exactly `rows × k` for `k` grouping sets.
//! - **Set operations**: unions add up, intersect scales the smallest input by
//!   ndv containment, except is left-biased.

use crate::expr::{
    extract_equi_keys, grouping_ids, AggExpr, AggFunc, BinaryOp, ColumnId, ColumnRef, CteId, Expr,
    JoinType, LogicalOp, ScalarValue, ScanOp, SetOpKind, UnaryOp,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Default filter selectivity when we can't determine it.
pub const DEFAULT_FILTER_SELECTIVITY: f64 = 0.1;

/// Row count assumed for a table without a row count statistic.
pub const UNKNOWN_TABLE_ROW_COUNT: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatisticKind {
    Estimate,
    Unknown,
}

/// Per-column statistics used for selectivity estimation and cost modeling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistic {
    pub min: f64,
    pub max: f64,
    /// Fraction of rows that are NULL, in `[0, 1]`.
    pub null_fraction: f64,
    /// Average width of a value in bytes.
    pub avg_width: f64,
    /// Number of distinct values (NDV).
    pub distinct_count: f64,
    pub kind: StatisticKind,
}

impl ColumnStatistic {
    pub fn new(min: f64, max: f64, null_fraction: f64, avg_width: f64, distinct_count: f64) -> Self {
        Self {
            min,
            max,
            null_fraction: null_fraction.clamp(0.0, 1.0),
            avg_width: avg_width.max(0.0),
            distinct_count: distinct_count.max(0.0),
            kind: StatisticKind::Estimate,
        }
    }

    /// The sentinel returned when nothing is known about a column.
    pub fn unknown() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            null_fraction: 0.0,
            avg_width: 1.0,
            distinct_count: 1.0,
            kind: StatisticKind::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == StatisticKind::Unknown
    }

    fn has_range(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    fn with_ndv_capped(mut self, rows: f64) -> Self {
        if !self.is_unknown() {
            self.distinct_count = self.distinct_count.min(rows.max(0.0));
        }
        self
    }
}

impl fmt::Display for ColumnStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}, {:?}, {:?}, {:?}, {:?}] {}",
            self.min,
            self.max,
            self.null_fraction,
            self.avg_width,
            self.distinct_count,
            match self.kind {
                StatisticKind::Estimate => "ESTIMATE",
                StatisticKind::Unknown => "UNKNOWN",
            }
        )
    }
}

/// Statistics of a plan node's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub row_count: f64,
    /// False when the row count derives from a table without a row count statistic.
    pub row_count_known: bool,
    pub column_stats: HashMap<ColumnId, ColumnStatistic>,
}

impl Statistics {
    pub fn new(row_count: f64) -> Self {
        Self {
            row_count,
            row_count_known: true,
            column_stats: HashMap::new(),
        }
    }

    pub fn with_column(mut self, id: ColumnId, stat: ColumnStatistic) -> Self {
        self.column_stats.insert(id, stat);
        self
    }

    /// Statistic of a column; the unknown sentinel when absent.
    pub fn column(&self, id: ColumnId) -> ColumnStatistic {
        self.column_stats
            .get(&id)
            .cloned()
            .unwrap_or_else(ColumnStatistic::unknown)
    }

    pub fn column_ids(&self) -> HashSet<ColumnId> {
        self.column_stats.keys().copied().collect()
    }

    /// Sum of the average widths of the output columns.
    pub fn avg_row_width(&self) -> f64 {
        let width: f64 = self.column_stats.values().map(|c| c.avg_width).sum();
        width.max(1.0)
    }

    /// Estimated output size in bytes.
    pub fn output_size(&self) -> f64 {
        self.row_count * self.avg_row_width()
    }

    /// Keep only the statistics of `columns`, adding unknown entries for missing ones.
    fn restricted_to(mut self, columns: &[ColumnRef]) -> Self {
        let mut kept = HashMap::with_capacity(columns.len());
        for c in columns {
            let stat = self
                .column_stats
                .remove(&c.id)
                .unwrap_or_else(ColumnStatistic::unknown);
            kept.insert(c.id, stat);
        }
        self.column_stats = kept;
        self
    }
}

/// Clamp a row estimate into `[min(1, upper), upper]`.
fn bounded_rows(rows: f64, upper: f64) -> f64 {
    let upper = upper.max(0.0);
    rows.max(1.0_f64.min(upper)).min(upper)
}

/// Estimate the fraction of rows that satisfy `expr`.
pub fn selectivity(expr: &Expr, stats: &Statistics) -> f64 {
    let sel = match expr {
        Expr::And(exprs) => exprs.iter().map(|e| selectivity(e, stats)).product(),
        Expr::Or(exprs) => exprs
            .iter()
            .map(|e| selectivity(e, stats))
            .fold(0.0, |acc, s| acc + s - acc * s),
        Expr::Literal(ScalarValue::Bool(true)) => 1.0,
        Expr::Literal(ScalarValue::Bool(false)) | Expr::Literal(ScalarValue::Null) => 0.0,
        Expr::UnaryOp { op, operand } => match (op, operand.as_ref()) {
            (UnaryOp::Not, inner) => 1.0 - selectivity(inner, stats),
            (UnaryOp::IsNull, Expr::Column(c)) => {
                let cs = stats.column(c.id);
                if cs.is_unknown() {
                    DEFAULT_FILTER_SELECTIVITY
                } else {
                    cs.null_fraction
                }
            }
            (UnaryOp::IsNotNull, Expr::Column(c)) => {
                let cs = stats.column(c.id);
                if cs.is_unknown() {
                    1.0 - DEFAULT_FILTER_SELECTIVITY
                } else {
                    1.0 - cs.null_fraction
                }
            }
            _ => DEFAULT_FILTER_SELECTIVITY,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let base = match expr.as_ref() {
                Expr::Column(c) if !stats.column(c.id).is_unknown() => {
                    let ndv = stats.column(c.id).distinct_count.max(1.0);
                    (list.len() as f64 / ndv).min(1.0)
                }
                _ => DEFAULT_FILTER_SELECTIVITY,
            };
            if *negated {
                1.0 - base
            } else {
                base
            }
        }
        other => {
            if let Some((c, op, value)) = other.as_column_comparison() {
                comparison_selectivity(&stats.column(c.id), op, value)
            } else if let Some((a, b)) = other.as_column_equality() {
                let (sa, sb) = (stats.column(a.id), stats.column(b.id));
                if sa.is_unknown() || sb.is_unknown() {
                    DEFAULT_FILTER_SELECTIVITY
                } else {
                    1.0 / sa.distinct_count.max(sb.distinct_count).max(1.0)
                }
            } else {
                DEFAULT_FILTER_SELECTIVITY
            }
        }
    };
    sel.clamp(0.0, 1.0)
}

fn comparison_selectivity(cs: &ColumnStatistic, op: BinaryOp, value: &ScalarValue) -> f64 {
    if cs.is_unknown() {
        return match op {
            BinaryOp::NotEq => 1.0 - DEFAULT_FILTER_SELECTIVITY,
            _ => DEFAULT_FILTER_SELECTIVITY,
        };
    }
    let ndv = cs.distinct_count.max(1.0);
    let v = value.as_f64();
    match op {
        BinaryOp::Eq => match v {
            Some(v) if cs.has_range() && (v < cs.min || v > cs.max) => 0.0,
            _ => 1.0 / ndv,
        },
        BinaryOp::NotEq => 1.0 - 1.0 / ndv,
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let Some(v) = v else {
                return DEFAULT_FILTER_SELECTIVITY;
            };
            if !cs.has_range() {
                return DEFAULT_FILTER_SELECTIVITY;
            }
            if cs.max <= cs.min {
                let inside = match op {
                    BinaryOp::Lt => cs.min < v,
                    BinaryOp::LtEq => cs.min <= v,
                    BinaryOp::Gt => cs.min > v,
                    _ => cs.min >= v,
                };
                return if inside { 1.0 } else { 0.0 };
            }
            let span = cs.max - cs.min;
            let below = ((v - cs.min) / span).clamp(0.0, 1.0);
            match op {
                BinaryOp::Lt | BinaryOp::LtEq => below,
                _ => 1.0 - below,
            }
        }
        _ => DEFAULT_FILTER_SELECTIVITY,
    }
}

/// Narrow a column statistic after a `column <op> literal` conjunct held.
fn refine_column(cs: &ColumnStatistic, op: BinaryOp, value: &ScalarValue) -> ColumnStatistic {
    let mut out = cs.clone();
    if cs.is_unknown() {
        return out;
    }
    let Some(v) = value.as_f64() else {
        if op == BinaryOp::Eq {
            out.distinct_count = out.distinct_count.min(1.0);
        }
        return out;
    };
    match op {
        BinaryOp::Eq => {
            out.min = v;
            out.max = v;
            out.distinct_count = out.distinct_count.min(1.0);
            out.null_fraction = 0.0;
        }
        BinaryOp::Lt | BinaryOp::LtEq => {
            let fraction = comparison_selectivity(cs, op, value);
            out.max = out.max.min(v);
            out.distinct_count = (out.distinct_count * fraction).max(1.0);
            out.null_fraction = 0.0;
        }
        BinaryOp::Gt | BinaryOp::GtEq => {
            let fraction = comparison_selectivity(cs, op, value);
            out.min = out.min.max(v);
            out.distinct_count = (out.distinct_count * fraction).max(1.0);
            out.null_fraction = 0.0;
        }
        _ => {}
    }
    out
}

/// Derive statistics for filter output.
///
/// Output rows never exceed the input rows. Columns constrained by a
/// `column <op> literal` conjunct get narrowed ranges; every other column keeps its
/// statistic with the NDV capped by the new row count.
pub fn derive_filter_stats<'a>(
    input: &Statistics,
    conjuncts: impl IntoIterator<Item = &'a Expr>,
) -> Statistics {
    let conjuncts: Vec<&Expr> = conjuncts.into_iter().collect();
    let sel: f64 = conjuncts.iter().map(|c| selectivity(c, input)).product();
    let row_count = bounded_rows(input.row_count * sel, input.row_count);

    let mut out = input.clone();
    out.row_count = row_count;
    for conjunct in &conjuncts {
        if let Some((c, op, value)) = conjunct.as_column_comparison() {
            if let Some(cs) = out.column_stats.get(&c.id) {
                let refined = refine_column(cs, op, value);
                out.column_stats.insert(c.id, refined);
            }
        }
    }
    for cs in out.column_stats.values_mut() {
        *cs = cs.clone().with_ndv_capped(row_count);
    }
    out
}

/// Derive statistics for a scan: base table statistics filtered by the scan's conjuncts.
pub fn derive_scan_stats(
    table_rows: Option<u64>,
    columns: Vec<(ColumnId, ColumnStatistic)>,
    predicates: &[Expr],
) -> Statistics {
    let base = Statistics {
        row_count: table_rows.map(|r| r as f64).unwrap_or(UNKNOWN_TABLE_ROW_COUNT),
        row_count_known: table_rows.is_some(),
        column_stats: columns.into_iter().collect(),
    };
    if predicates.is_empty() {
        return base;
    }
    derive_filter_stats(&base, predicates)
}

/// Derive statistics for join output.
///
/// For each equi-join key pair the standard containment formula applies:
///
/// ```text
/// |A JOIN B| = |A| * |B| / max(NDV(A.key), NDV(B.key))
/// ```
///
/// Multi-column keys multiply their selectivities. When a key statistic is unknown
/// the estimate degrades to `max(|A|, |B|)`.
pub fn derive_join_stats(
    join_type: JoinType,
    left: &Statistics,
    right: &Statistics,
    keys: &[(ColumnId, ColumnId)],
    residual: &[Expr],
) -> Statistics {
    let (l, r) = (left.row_count, right.row_count);
    let product = l * r;

    let mut matched = if keys.is_empty() {
        product
    } else {
        let mut unknown = false;
        let mut sel = 1.0_f64;
        for (a, b) in keys {
            let (sa, sb) = (left.column(*a), right.column(*b));
            if sa.is_unknown() || sb.is_unknown() {
                unknown = true;
                break;
            }
            sel /= sa.distinct_count.max(sb.distinct_count).max(1.0);
        }
        if unknown {
            l.max(r)
        } else {
            product * sel
        }
    };
    matched = matched.min(product);

    let mut combined = left.clone();
    for (id, cs) in &right.column_stats {
        combined.column_stats.insert(*id, cs.clone());
    }
    let residual_sel: f64 = residual.iter().map(|e| selectivity(e, &combined)).product();
    matched *= residual_sel;

    let rows = match join_type {
        JoinType::Inner | JoinType::Cross => matched,
        JoinType::Left => matched.max(l),
        JoinType::Right => matched.max(r),
        JoinType::Full => matched.max(l).max(r),
        JoinType::Semi => matched.min(l),
        JoinType::Anti => (l - matched.min(l)).max(l * DEFAULT_FILTER_SELECTIVITY),
    };
    // Only the preserved side of an outer join can lift the estimate above the
    // matched rows; an empty input otherwise empties the join.
    let upper = match join_type {
        JoinType::Inner | JoinType::Cross => product,
        JoinType::Semi => product.min(l),
        JoinType::Anti => l,
        JoinType::Left => product.max(l),
        JoinType::Right => product.max(r),
        JoinType::Full => product.max(l).max(r),
    };
    let row_count = bounded_rows(rows, upper);

    let mut column_stats = HashMap::new();
    for (id, cs) in &left.column_stats {
        column_stats.insert(*id, cs.clone().with_ndv_capped(row_count));
    }
    if join_type.outputs_right() {
        for (id, cs) in &right.column_stats {
            column_stats.insert(*id, cs.clone().with_ndv_capped(row_count));
        }
    }
    Statistics {
        row_count,
        row_count_known: left.row_count_known && right.row_count_known,
        column_stats,
    }
}

/// Product of the group-by NDVs, or `None` when any of them is unknown. A global
/// aggregate has exactly one group.
pub fn group_by_ndv(input: &Statistics, group_by: &[ColumnRef]) -> Option<f64> {
    let mut ndv = 1.0_f64;
    for g in group_by {
        let cs = input.column(g.id);
        if cs.is_unknown() {
            return None;
        }
        ndv *= cs.distinct_count.max(1.0);
    }
    Some(ndv)
}

/// Derive statistics for aggregate output.
///
/// For a global aggregate (no group-by columns), the output is always 1 row.
pub fn derive_aggregate_stats(
    input: &Statistics,
    group_by: &[ColumnRef],
    aggregates: &[AggExpr],
) -> Statistics {
    let row_count = if group_by.is_empty() {
        1.0
    } else {
        match group_by_ndv(input, group_by) {
            Some(ndv) => bounded_rows(ndv, input.row_count),
            None => input.row_count,
        }
    };

    let mut column_stats = HashMap::new();
    for g in group_by {
        column_stats.insert(g.id, input.column(g.id).with_ndv_capped(row_count));
    }
    for agg in aggregates {
        let arg_stat = match &agg.arg {
            Some(Expr::Column(c)) => Some(input.column(c.id)),
            _ => None,
        };
        let stat = match (agg.func, arg_stat) {
            (AggFunc::Min | AggFunc::Max, Some(cs)) => cs.with_ndv_capped(row_count),
            (AggFunc::Count | AggFunc::MultiDistinctCount, _) => {
                ColumnStatistic::new(0.0, input.row_count, 0.0, 8.0, row_count)
            }
            _ => ColumnStatistic::unknown(),
        };
        column_stats.insert(agg.output.id, stat);
    }
    Statistics {
        row_count,
        row_count_known: input.row_count_known,
        column_stats,
    }
}

/// Derive statistics for a Repeat node: exactly `rows × k`.
///
/// Repeat columns missing from some grouping sets gain the corresponding NULL
/// fraction and one extra distinct value. The grouping id column is described as
/// `[min id, max id, 0, 8, k]`.
pub fn derive_repeat_stats(
    input: &Statistics,
    repeat_columns: &[ColumnRef],
    grouping_sets: &[Vec<ColumnId>],
    grouping_id: &ColumnRef,
) -> Statistics {
    let k = grouping_sets.len().max(1) as f64;
    let row_count = input.row_count * k;

    let mut column_stats = input.column_stats.clone();
    for c in repeat_columns {
        let absent = grouping_sets.iter().filter(|s| !s.contains(&c.id)).count() as f64;
        if absent == 0.0 {
            continue;
        }
        if let Some(cs) = column_stats.get_mut(&c.id) {
            if !cs.is_unknown() {
                cs.null_fraction = ((cs.null_fraction * (k - absent) + absent) / k).clamp(0.0, 1.0);
                cs.distinct_count += 1.0;
            }
        }
    }
    let ids = grouping_ids(repeat_columns, grouping_sets);
    let min = ids.iter().copied().min().unwrap_or(0) as f64;
    let max = ids.iter().copied().max().unwrap_or(0) as f64;
    column_stats.insert(grouping_id.id, ColumnStatistic::new(min, max, 0.0, 8.0, k));

    Statistics {
        row_count,
        row_count_known: input.row_count_known,
        column_stats,
    }
}

/// Derive statistics for a set operation. `inputs[i]` lists child `i`'s columns in
/// the order of `output`.
pub fn derive_set_op_stats(
    kind: SetOpKind,
    children: &[&Statistics],
    inputs: &[Vec<ColumnRef>],
    output: &[ColumnRef],
) -> Statistics {
    let Some(first) = children.first() else {
        return Statistics::new(0.0);
    };
    let ndv_at = |child: usize, ordinal: usize| -> Option<f64> {
        let col = inputs.get(child)?.get(ordinal)?;
        let cs = children[child].column(col.id);
        (!cs.is_unknown()).then_some(cs.distinct_count.max(1.0))
    };

    let row_count = match kind {
        SetOpKind::UnionAll | SetOpKind::Union => children.iter().map(|c| c.row_count).sum(),
        SetOpKind::Intersect => {
            let smallest = children
                .iter()
                .map(|c| c.row_count)
                .fold(f64::INFINITY, f64::min);
            let mut ratio = 1.0;
            for ordinal in 0..output.len() {
                let ndvs: Option<Vec<f64>> = (0..children.len()).map(|i| ndv_at(i, ordinal)).collect();
                if let Some(ndvs) = ndvs {
                    let lo = ndvs.iter().copied().fold(f64::INFINITY, f64::min);
                    let hi = ndvs.iter().copied().fold(0.0, f64::max);
                    if hi > 0.0 {
                        ratio *= lo / hi;
                    }
                }
            }
            smallest * ratio
        }
        SetOpKind::Except => {
            let left = first.row_count;
            let mut overlap = 1.0;
            let mut known = children.len() > 1;
            for ordinal in 0..output.len() {
                match (ndv_at(0, ordinal), ndv_at(1, ordinal)) {
                    (Some(l), Some(r)) => overlap *= (r / l).min(1.0),
                    _ => known = false,
                }
            }
            if known {
                (left * (1.0 - overlap)).max(left * DEFAULT_FILTER_SELECTIVITY)
            } else {
                left
            }
        }
    };

    let mut column_stats = HashMap::new();
    for (ordinal, out) in output.iter().enumerate() {
        let mut merged: Option<ColumnStatistic> = None;
        for (i, child) in children.iter().enumerate() {
            let Some(col) = inputs.get(i).and_then(|cols| cols.get(ordinal)) else {
                continue;
            };
            let cs = child.column(col.id);
            merged = Some(match merged {
                None => cs,
                Some(m) if m.is_unknown() || cs.is_unknown() => ColumnStatistic::unknown(),
                Some(m) => ColumnStatistic::new(
                    m.min.min(cs.min),
                    m.max.max(cs.max),
                    m.null_fraction.max(cs.null_fraction),
                    m.avg_width.max(cs.avg_width),
                    m.distinct_count.max(cs.distinct_count),
                ),
            });
        }
        let stat = merged.unwrap_or_else(ColumnStatistic::unknown);
        column_stats.insert(out.id, stat.with_ndv_capped(row_count));
    }
    Statistics {
        row_count,
        row_count_known: children.iter().all(|c| c.row_count_known),
        column_stats,
    }
}

/// Derive statistics for a projection. Rows pass through unchanged.
pub fn derive_project_stats(input: &Statistics, exprs: &[(ColumnRef, Expr)]) -> Statistics {
    let mut column_stats = HashMap::new();
    for (out, expr) in exprs {
        let stat = match expr {
            Expr::Column(c) => input.column(c.id),
            Expr::Literal(ScalarValue::Null) => ColumnStatistic::new(
                f64::NEG_INFINITY,
                f64::INFINITY,
                1.0,
                1.0,
                1.0,
            ),
            Expr::Literal(v) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                let (min, max) = if x.is_nan() {
                    (f64::NEG_INFINITY, f64::INFINITY)
                } else {
                    (x, x)
                };
                ColumnStatistic::new(min, max, 0.0, 8.0, 1.0)
            }
            other => {
                let referenced: Vec<ColumnStatistic> =
                    other.columns().iter().map(|c| input.column(c.id)).collect();
                if referenced.is_empty() || referenced.iter().any(|c| c.is_unknown()) {
                    ColumnStatistic::unknown()
                } else {
                    let ndv = referenced
                        .iter()
                        .map(|c| c.distinct_count)
                        .fold(1.0, f64::max);
                    let nulls = referenced.iter().map(|c| c.null_fraction).fold(0.0, f64::max);
                    ColumnStatistic::new(f64::NEG_INFINITY, f64::INFINITY, nulls, 8.0, ndv)
                }
            }
        };
        column_stats.insert(out.id, stat.with_ndv_capped(input.row_count));
    }
    Statistics {
        row_count: input.row_count,
        row_count_known: input.row_count_known,
        column_stats,
    }
}

/// Derive statistics for a Limit/TopN: the input capped at the limit.
pub fn derive_limit_stats(input: &Statistics, count: u64) -> Statistics {
    let mut out = input.clone();
    out.row_count = input.row_count.min(count as f64);
    for cs in out.column_stats.values_mut() {
        *cs = cs.clone().with_ndv_capped(out.row_count);
    }
    out
}

/// Where leaf statistics come from.
pub trait StatisticsSource {
    fn scan_statistics(&self, scan: &ScanOp) -> Statistics;
    /// Statistics of a CTE producer's output, keyed by producer column ids.
    fn cte_statistics(&self, cte_id: CteId) -> Option<Statistics>;
}

/// Derive the statistics of a logical operator from its children's statistics.
pub fn derive_statistics(
    op: &LogicalOp,
    children: &[&Statistics],
    source: &dyn StatisticsSource,
) -> Statistics {
    let empty = Statistics::new(0.0);
    let child = |i: usize| -> &Statistics { children.get(i).copied().unwrap_or(&empty) };
    match op {
        LogicalOp::Scan(scan) => source.scan_statistics(scan),
        LogicalOp::Filter { predicate } => derive_filter_stats(child(0), predicate.conjuncts()),
        LogicalOp::Project { exprs } => derive_project_stats(child(0), exprs),
        LogicalOp::Join {
            join_type,
            condition,
            ..
        } => {
            let (left, right) = (child(0), child(1));
            let (keys, residual) =
                extract_equi_keys(condition.as_ref(), &left.column_ids(), &right.column_ids());
            let key_ids: Vec<(ColumnId, ColumnId)> = keys.iter().map(|(a, b)| (a.id, b.id)).collect();
            derive_join_stats(*join_type, left, right, &key_ids, &residual)
        }
        LogicalOp::Aggregate {
            group_by,
            aggregates,
        } => derive_aggregate_stats(child(0), group_by, aggregates),
        LogicalOp::Repeat {
            repeat_columns,
            grouping_sets,
            grouping_id,
        } => derive_repeat_stats(child(0), repeat_columns, grouping_sets, grouping_id),
        LogicalOp::SetOperation {
            kind,
            output,
            inputs,
        } => derive_set_op_stats(*kind, children, inputs, output),
        LogicalOp::Sort { .. } => child(0).clone(),
        LogicalOp::TopN { offset, count, .. } | LogicalOp::Limit { offset, count } => {
            derive_limit_stats(child(0), count.saturating_add(*offset))
        }
        LogicalOp::CteConsumer { cte_id, columns } => {
            let Some(producer) = source.cte_statistics(*cte_id) else {
                return Statistics {
                    row_count: UNKNOWN_TABLE_ROW_COUNT,
                    row_count_known: false,
                    column_stats: columns
                        .iter()
                        .map(|(c, _)| (c.id, ColumnStatistic::unknown()))
                        .collect(),
                };
            };
            Statistics {
                row_count: producer.row_count,
                row_count_known: producer.row_count_known,
                column_stats: columns
                    .iter()
                    .map(|(c, source_id)| (c.id, producer.column(*source_id)))
                    .collect(),
            }
        }
    }
}

/// Restrict a statistics object to the given output columns.
pub fn project_statistics(stats: Statistics, columns: &[ColumnRef]) -> Statistics {
    stats.restricted_to(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(id: u32) -> ColumnRef {
        ColumnRef::new(id, format!("v{}", id))
    }

    fn table(rows: f64, cols: &[(u32, f64)]) -> Statistics {
        cols.iter().fold(Statistics::new(rows), |s, (id, ndv)| {
            s.with_column(ColumnId(*id), ColumnStatistic::new(0.0, 100.0, 0.0, 8.0, *ndv))
        })
    }

    #[test]
    fn test_equality_selectivity_is_one_over_ndv() {
        let stats = table(10000.0, &[(1, 100.0)]);
        let pred = Expr::eq(Expr::col(&col(1)), Expr::int(5));
        let out = derive_filter_stats(&stats, [&pred]);
        assert_eq!(out.row_count, 100.0);
        assert_eq!(out.column(ColumnId(1)).distinct_count, 1.0);
    }

    #[test]
    fn test_range_selectivity_uses_overlap() {
        let stats = table(10000.0, &[(1, 100.0)]);
        let pred = Expr::binary(BinaryOp::Lt, Expr::col(&col(1)), Expr::int(25));
        let out = derive_filter_stats(&stats, [&pred]);
        assert!((out.row_count - 2500.0).abs() < 1e-6);
        assert_eq!(out.column(ColumnId(1)).max, 25.0);
    }

    #[test]
    fn test_unknown_column_uses_default_selectivity() {
        let stats = Statistics::new(10000.0);
        let pred = Expr::eq(Expr::col(&col(9)), Expr::int(5));
        let out = derive_filter_stats(&stats, [&pred]);
        assert_eq!(out.row_count, 1000.0);
    }

    #[test]
    fn test_filter_never_increases_rows() {
        let stats = table(50.0, &[(1, 10.0)]);
        let pred = Expr::Or(vec![
            Expr::eq(Expr::col(&col(1)), Expr::int(1)),
            Expr::Literal(ScalarValue::Bool(true)),
        ]);
        let out = derive_filter_stats(&stats, [&pred]);
        assert!(out.row_count <= 50.0);
    }

    #[test]
    fn test_join_containment_formula() {
        let left = table(10000.0, &[(1, 100.0)]);
        let right = table(500.0, &[(2, 50.0)]);
        let out = derive_join_stats(JoinType::Inner, &left, &right, &[(ColumnId(1), ColumnId(2))], &[]);
        assert_eq!(out.row_count, 10000.0 * 500.0 / 100.0);
    }

    #[test]
    fn test_join_with_unknown_key_uses_larger_side() {
        let left = table(10000.0, &[(1, 100.0)]);
        let right = Statistics::new(500.0);
        let out = derive_join_stats(JoinType::Inner, &left, &right, &[(ColumnId(1), ColumnId(2))], &[]);
        assert_eq!(out.row_count, 10000.0);
    }

    #[test]
    fn test_join_never_exceeds_product() {
        let left = table(3.0, &[(1, 1.0)]);
        let right = Statistics::new(2.0);
        let out = derive_join_stats(JoinType::Inner, &left, &right, &[(ColumnId(1), ColumnId(2))], &[]);
        assert!(out.row_count <= 6.0);
    }

    #[test]
    fn test_join_with_empty_side_is_empty() {
        let empty = table(0.0, &[(1, 1.0)]);
        let other = table(500.0, &[(2, 50.0)]);
        let keys = [(ColumnId(1), ColumnId(2))];
        for join_type in [JoinType::Inner, JoinType::Semi, JoinType::Right, JoinType::Anti] {
            let out = derive_join_stats(join_type, &empty, &other, &keys, &[]);
            let expected = if join_type == JoinType::Right { 500.0 } else { 0.0 };
            assert_eq!(out.row_count, expected, "{:?}", join_type);
        }
        let out = derive_join_stats(JoinType::Cross, &other, &empty, &[], &[]);
        assert_eq!(out.row_count, 0.0);
        let out = derive_join_stats(JoinType::Left, &other, &empty, &keys, &[]);
        assert_eq!(out.row_count, 500.0);
    }

    #[test]
    fn test_group_by_ndv_is_plain_product() {
        let input = Statistics::new(10000.0)
            .with_column(ColumnId(1), ColumnStatistic::new(0.0, 100.0, 0.2, 8.0, 100.0))
            .with_column(ColumnId(2), ColumnStatistic::new(0.0, 10.0, 0.0, 8.0, 10.0));
        assert_eq!(group_by_ndv(&input, &[col(1), col(2)]), Some(1000.0));
        assert_eq!(group_by_ndv(&input, &[col(1), col(3)]), None);
        assert_eq!(group_by_ndv(&input, &[]), Some(1.0));
    }

    #[test]
    fn test_aggregate_caps_at_input_rows() {
        let input = table(10000.0, &[(1, 100.0), (2, 1000.0)]);
        let out = derive_aggregate_stats(&input, &[col(1), col(2)], &[]);
        assert_eq!(out.row_count, 10000.0);

        let out = derive_aggregate_stats(&input, &[col(1)], &[]);
        assert_eq!(out.row_count, 100.0);

        let out = derive_aggregate_stats(&input, &[col(7)], &[]);
        assert_eq!(out.row_count, 10000.0);
    }

    #[test]
    fn test_repeat_multiplies_by_grouping_set_count() {
        let input = table(10000.0, &[(1, 100.0), (2, 100.0)]);
        let gid = ColumnRef::new(10, "GROUPING_ID");
        let rollup = vec![vec![ColumnId(1), ColumnId(2)], vec![ColumnId(1)], vec![]];
        let out = derive_repeat_stats(&input, &[col(1), col(2)], &rollup, &gid);
        assert_eq!(out.row_count, 30000.0);
        let g = out.column(gid.id);
        assert_eq!((g.min, g.max, g.distinct_count), (0.0, 3.0, 3.0));
        assert!(out.column(ColumnId(2)).null_fraction > 0.0);
        assert_eq!(out.column(ColumnId(1)).distinct_count, 101.0);
    }

    #[test]
    fn test_union_sums_children() {
        let a = table(100.0, &[(1, 10.0)]);
        let b = table(50.0, &[(2, 10.0)]);
        let out = derive_set_op_stats(
            SetOpKind::UnionAll,
            &[&a, &b],
            &[vec![col(1)], vec![col(2)]],
            &[col(3)],
        );
        assert_eq!(out.row_count, 150.0);
    }

    #[test]
    fn test_intersect_scales_smallest_by_containment() {
        let a = table(100.0, &[(1, 10.0)]);
        let b = table(50.0, &[(2, 5.0)]);
        let out = derive_set_op_stats(
            SetOpKind::Intersect,
            &[&a, &b],
            &[vec![col(1)], vec![col(2)]],
            &[col(3)],
        );
        assert_eq!(out.row_count, 25.0);
    }

    #[test]
    fn test_except_is_left_biased() {
        let left = table(100.0, &[(1, 10.0)]);
        let inputs = [vec![col(1)], vec![col(2)]];

        let half = table(50.0, &[(2, 5.0)]);
        let out = derive_set_op_stats(SetOpKind::Except, &[&left, &half], &inputs, &[col(3)]);
        assert_eq!(out.row_count, 50.0);

        // full overlap keeps a tenth of the left input
        let covering = table(500.0, &[(2, 20.0)]);
        let out = derive_set_op_stats(SetOpKind::Except, &[&left, &covering], &inputs, &[col(3)]);
        assert_eq!(out.row_count, 10.0);

        let unknown = Statistics::new(500.0);
        let out = derive_set_op_stats(SetOpKind::Except, &[&left, &unknown], &inputs, &[col(3)]);
        assert_eq!(out.row_count, 100.0);
    }

    #[test]
    fn test_column_statistic_display() {
        let cs = ColumnStatistic::new(0.0, 3.0, 0.0, 8.0, 4.0);
        assert_eq!(cs.to_string(), "[0.0, 3.0, 0.0, 8.0, 4.0] ESTIMATE");
        assert!(ColumnStatistic::unknown().to_string().ends_with("UNKNOWN"));
    }
}
