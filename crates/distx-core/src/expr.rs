//! # Expression and Operator Types
//!
//! This module defines the scalar and logical type system of the optimizer's plan
//! representation. Physical operators live in [`crate::physical`].
//!
//! ## Scalar Expressions (`Expr`)
//! Scalar expressions represent computations on individual rows: column references,
//! literal values, arithmetic operations, comparisons, boolean logic, and function calls.
//! They appear inside predicates, projections, join conditions, and sort keys.
//!
//! ## Column Identity
//! Every column flowing through a plan carries a stable integer [`ColumnId`] assigned
//! by the analyzer. Operators that *define* columns (scans, projections, aggregates,
//! set operations, CTE consumers) introduce new ids; every other operator only refers
//! to ids produced below it. The name attached to a [`ColumnRef`] is for display only.
//!
//! ## Logical Operators (`LogicalOp`)
//! Logical operators describe *what* to compute without specifying *how*. A logical
//! `Join` says "combine these two relations on this condition" but does not specify
//! whether the build side is broadcast or shuffled. Children are not stored on the
//! operator; they are owned by the enclosing [`crate::plan::LogicalPlan`] node.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reference to a table in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Stable identifier of a column within one optimization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId(pub u32);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a column: its id plus a display name.
///
/// Equality and hashing only consider the id, so two references to the same column
/// compare equal even if one of them was renamed for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRef {
    pub id: ColumnId,
    pub name: String,
}

impl ColumnRef {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: ColumnId(id),
            name: name.into(),
        }
    }
}

impl PartialEq for ColumnRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ColumnRef {}

impl Hash for ColumnRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.name)
    }
}

/// Hands out fresh column ids for columns introduced by rewrites.
///
/// Seeded with one past the largest id found in the input plan, so generated ids
/// never collide with analyzer-assigned ones.
#[derive(Debug, Clone)]
pub struct ColumnFactory {
    next: u32,
}

impl ColumnFactory {
    pub fn starting_after(max: ColumnId) -> Self {
        Self { next: max.0 + 1 }
    }

    pub fn create(&mut self, name: impl Into<String>) -> ColumnRef {
        let id = ColumnId(self.next);
        self.next += 1;
        ColumnRef {
            id,
            name: name.into(),
        }
    }
}

/// Scalar value for expressions.
///
/// Represents constant values that appear in SQL queries (e.g., `WHERE x = 42`).
/// Uses `OrderedFloat` for `f64` so that floating-point values can be used as
/// hash map keys and in Eq/Hash comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    /// SQL NULL value.
    Null,
    /// Boolean true/false.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point, wrapped in OrderedFloat for Eq/Hash support.
    Float64(OrderedFloat<f64>),
    /// UTF-8 string.
    Utf8(String),
    /// Date as days since Unix epoch (1970-01-01).
    Date(i32),
}

impl ScalarValue {
    /// Numeric view of the value, used for range selectivity against column min/max.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) => Some(v.0),
            Self::Date(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Null | Self::Utf8(_) => None,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Date(v) => v.hash(state),
        }
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Utf8(a), Self::Utf8(b)) => Some(a.cmp(b)),
            (Self::Null, _) | (_, Self::Null) => None,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Self::Int64(v) => write!(f, "{}", v),
            Self::Float64(v) => write!(f, "{}", v.0),
            Self::Utf8(v) => write!(f, "'{}'", v),
            Self::Date(v) => write!(f, "DATE({})", v),
        }
    }
}

/// Scalar expressions used in predicates, projections, join conditions, etc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a column by id.
    Column(ColumnRef),
    /// Constant literal value.
    Literal(ScalarValue),
    /// Binary operation (e.g., `a + b`, `x = y`, `price > 100`).
    BinaryOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation (e.g., `NOT flag`, `-value`, `IS NULL`).
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `expr [NOT] IN (v1, v2, ...)` over literal values.
    InList {
        expr: Box<Expr>,
        list: Vec<ScalarValue>,
        negated: bool,
    },
    /// Named function call (e.g., `UPPER(name)`, `ABS(value)`).
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// Conjunction (AND) of multiple predicates, stored flat.
    And(Vec<Expr>),
    /// Disjunction (OR) of multiple predicates.
    Or(Vec<Expr>),
}

impl Expr {
    pub fn col(column: &ColumnRef) -> Self {
        Expr::Column(column.clone())
    }

    pub fn lit(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(ScalarValue::Int64(value))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// Combine conjuncts into a single predicate. Returns `None` for an empty list.
    pub fn and_all(mut conjuncts: Vec<Expr>) -> Option<Expr> {
        match conjuncts.len() {
            0 => None,
            1 => conjuncts.pop(),
            _ => Some(Expr::And(conjuncts)),
        }
    }

    /// Return all column references in this expression.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut cols = Vec::new();
        self.collect_columns(&mut cols);
        cols
    }

    /// Set of column ids referenced by this expression.
    pub fn column_ids(&self) -> HashSet<ColumnId> {
        self.columns().into_iter().map(|c| c.id).collect()
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Column(c) => out.push(c),
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::UnaryOp { operand, .. } => operand.collect_columns(out),
            Expr::InList { expr, .. } => expr.collect_columns(out),
            Expr::Function { args, .. } => {
                for a in args {
                    a.collect_columns(out);
                }
            }
            Expr::And(exprs) | Expr::Or(exprs) => {
                for e in exprs {
                    e.collect_columns(out);
                }
            }
        }
    }

    /// True when every referenced column is in `ids`. Constant expressions qualify.
    pub fn bound_by(&self, ids: &HashSet<ColumnId>) -> bool {
        self.columns().iter().all(|c| ids.contains(&c.id))
    }

    /// Flatten AND-chains: (A AND (B AND C)) → [A, B, C].
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(exprs) => exprs.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Owned variant of [`Expr::conjuncts`].
    pub fn into_conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::And(exprs) => exprs.into_iter().flat_map(Expr::into_conjuncts).collect(),
            other => vec![other],
        }
    }

    /// Replace column references according to `mapping`. Unmapped columns are kept.
    pub fn substitute(&self, mapping: &HashMap<ColumnId, Expr>) -> Expr {
        match self {
            Expr::Column(c) => mapping.get(&c.id).cloned().unwrap_or_else(|| self.clone()),
            Expr::Literal(_) => self.clone(),
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: *op,
                left: Box::new(left.substitute(mapping)),
                right: Box::new(right.substitute(mapping)),
            },
            Expr::UnaryOp { op, operand } => Expr::UnaryOp {
                op: *op,
                operand: Box::new(operand.substitute(mapping)),
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(expr.substitute(mapping)),
                list: list.clone(),
                negated: *negated,
            },
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.substitute(mapping)).collect(),
            },
            Expr::And(exprs) => Expr::And(exprs.iter().map(|e| e.substitute(mapping)).collect()),
            Expr::Or(exprs) => Expr::Or(exprs.iter().map(|e| e.substitute(mapping)).collect()),
        }
    }

    /// Rename column references according to a column-to-column mapping.
    pub fn rename(&self, mapping: &HashMap<ColumnId, ColumnRef>) -> Expr {
        let as_exprs: HashMap<ColumnId, Expr> = mapping
            .iter()
            .map(|(id, c)| (*id, Expr::Column(c.clone())))
            .collect();
        self.substitute(&as_exprs)
    }

    /// If this is `column <op> literal` (in either order), return the normalized
    /// triple with the column on the left.
    pub fn as_column_comparison(&self) -> Option<(&ColumnRef, BinaryOp, &ScalarValue)> {
        let Expr::BinaryOp { op, left, right } = self else {
            return None;
        };
        if !op.is_comparison() {
            return None;
        }
        match (left.as_ref(), right.as_ref()) {
            (Expr::Column(c), Expr::Literal(v)) => Some((c, *op, v)),
            (Expr::Literal(v), Expr::Column(c)) => Some((c, op.flip(), v)),
            _ => None,
        }
    }

    /// If this is `column = column`, return both sides.
    pub fn as_column_equality(&self) -> Option<(&ColumnRef, &ColumnRef)> {
        match self {
            Expr::BinaryOp {
                op: BinaryOp::Eq,
                left,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(a), Expr::Column(b)) => Some((a, b)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{}", c),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::BinaryOp { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expr::UnaryOp { op, operand } => match op {
                UnaryOp::Not => write!(f, "NOT {}", operand),
                UnaryOp::Neg => write!(f, "-{}", operand),
                UnaryOp::IsNull => write!(f, "{} IS NULL", operand),
                UnaryOp::IsNotNull => write!(f, "{} IS NOT NULL", operand),
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let values: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}IN ({})", expr, not, values.join(", "))
            }
            Expr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
            Expr::And(exprs) => {
                let parts: Vec<String> = exprs.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", parts.join(" AND "))
            }
            Expr::Or(exprs) => {
                let parts: Vec<String> = exprs.iter().map(|e| format!("({})", e)).collect();
                write!(f, "{}", parts.join(" OR "))
            }
        }
    }
}

/// Binary operators for comparison and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality comparison (`=`). Used heavily in join conditions and filters.
    Eq,
    /// Inequality comparison (`<>` or `!=`).
    NotEq,
    /// Less than (`<`).
    Lt,
    /// Less than or equal (`<=`).
    LtEq,
    /// Greater than (`>`).
    Gt,
    /// Greater than or equal (`>=`).
    GtEq,
    /// Addition (`+`).
    Add,
    /// Subtraction (`-`).
    Sub,
    /// Multiplication (`*`).
    Mul,
    /// Division (`/`).
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }

    /// Operator to use when the operands of a comparison are swapped.
    pub fn flip(self) -> Self {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => other,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators for boolean logic and null checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Boolean negation (`NOT`).
    Not,
    /// Arithmetic negation (unary minus).
    Neg,
    /// Null check (`IS NULL`).
    IsNull,
    /// Non-null check (`IS NOT NULL`).
    IsNotNull,
}

/// SQL join types.
///
/// Only Inner and Cross joins are commutative; the others have fixed left/right
/// semantics. The right child is always the build side of a hash join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    /// Inner join: only matching rows from both sides.
    Inner,
    /// Left outer join: all rows from left, matching from right (or NULLs).
    Left,
    /// Right outer join: all rows from right, matching from left (or NULLs).
    Right,
    /// Full outer join: all rows from both sides, NULLs where no match.
    Full,
    /// Left semi join: left rows that have at least one match on the right.
    Semi,
    /// Left anti join: left rows that have no match on the right.
    Anti,
    /// Cross join: Cartesian product of both sides.
    Cross,
}

impl JoinType {
    /// Whether the join output contains the right input's columns.
    pub fn outputs_right(self) -> bool {
        !matches!(self, JoinType::Semi | JoinType::Anti)
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, JoinType::Inner | JoinType::Cross)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT OUTER JOIN",
            JoinType::Right => "RIGHT OUTER JOIN",
            JoinType::Full => "FULL OUTER JOIN",
            JoinType::Semi => "LEFT SEMI JOIN",
            JoinType::Anti => "LEFT ANTI JOIN",
            JoinType::Cross => "CROSS JOIN",
        };
        write!(f, "{}", s)
    }
}

/// User hint forcing a join distribution (`JOIN [broadcast]`, `JOIN [shuffle]`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinHint {
    #[default]
    None,
    Broadcast,
    Shuffle,
    Bucket,
    Colocate,
    Replicated,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Distinct count computed in a single aggregate via a per-group value set.
    MultiDistinctCount,
    /// Distinct sum computed in a single aggregate via a per-group value set.
    MultiDistinctSum,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::MultiDistinctCount => "multi_distinct_count",
            AggFunc::MultiDistinctSum => "multi_distinct_sum",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate expression: `func([DISTINCT] arg) AS output`.
///
/// `arg` is `None` for `count(*)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    pub arg: Option<Expr>,
    #[serde(default)]
    pub distinct: bool,
    pub output: ColumnRef,
}

impl AggExpr {
    pub fn new(func: AggFunc, arg: Expr, output: ColumnRef) -> Self {
        Self {
            func,
            arg: Some(arg),
            distinct: false,
            output,
        }
    }

    pub fn count_star(output: ColumnRef) -> Self {
        Self {
            func: AggFunc::Count,
            arg: None,
            distinct: false,
            output,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Columns referenced by the argument.
    pub fn arg_columns(&self) -> Vec<&ColumnRef> {
        self.arg.as_ref().map(|a| a.columns()).unwrap_or_default()
    }
}

impl fmt::Display for AggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distinct = if self.distinct { "DISTINCT " } else { "" };
        match &self.arg {
            Some(arg) => write!(f, "{}({}{})", self.func, distinct, arg),
            None => write!(f, "{}(*)", self.func),
        }
    }
}

/// Sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, if self.ascending { "ASC" } else { "DESC" })
    }
}

/// Set operation kinds. `Union` removes duplicates, `UnionAll` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOpKind {
    UnionAll,
    Union,
    Intersect,
    Except,
}

impl fmt::Display for SetOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetOpKind::UnionAll | SetOpKind::Union => "UNION",
            SetOpKind::Intersect => "INTERSECT",
            SetOpKind::Except => "EXCEPT",
        };
        write!(f, "{}", s)
    }
}

/// Identifier of a common table expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CteId(pub u32);

impl fmt::Display for CteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-level pre-aggregation state of a scan.
///
/// `On` lets the storage engine return rows that still share a key, because an
/// aggregate above re-aggregates them. `Off` forces the storage engine to merge
/// rows on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreAggregation {
    On,
    Off { reason: String },
}

impl fmt::Display for PreAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreAggregation::On => write!(f, "PREAGGREGATION: ON"),
            PreAggregation::Off { reason } => write!(f, "PREAGGREGATION: OFF. Reason: {}", reason),
        }
    }
}

/// Logical table scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanOp {
    pub table: TableRef,
    /// Output columns. `name` is the storage column name in the scanned index.
    pub columns: Vec<ColumnRef>,
    /// Conjuncts evaluated by the scan.
    #[serde(default)]
    pub predicates: Vec<Expr>,
    /// Selected rollup/materialized index; `None` until the rollup matcher ran.
    #[serde(default)]
    pub rollup: Option<String>,
    /// Pre-aggregation decided by the rollup matcher; `None` means "not decided".
    #[serde(default)]
    pub pre_aggregation: Option<PreAggregation>,
}

impl ScanOp {
    pub fn new(table: TableRef, columns: Vec<ColumnRef>) -> Self {
        Self {
            table,
            columns,
            predicates: Vec::new(),
            rollup: None,
            pre_aggregation: None,
        }
    }

    /// Copy of this scan with additional conjuncts; duplicates are dropped.
    pub fn with_predicates(&self, extra: impl IntoIterator<Item = Expr>) -> Self {
        let mut scan = self.clone();
        for p in extra {
            if !scan.predicates.contains(&p) {
                scan.predicates.push(p);
            }
        }
        scan
    }

    /// Storage name of an output column.
    pub fn column_name(&self, id: ColumnId) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }
}

/// Predicates of a scan, split by what the storage layer can do with them.
///
/// Every conjunct that references only partition columns lands in
/// `partition_conjuncts`; everything else stays in `non_partition_conjuncts` and is
/// evaluated row by row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanOperatorPredicates {
    pub partition_columns: Vec<String>,
    pub partition_conjuncts: Vec<Expr>,
    pub non_partition_conjuncts: Vec<Expr>,
    /// Partitions left after pruning, as (selected ids, total partition count).
    pub selected_partitions: Option<(Vec<u64>, usize)>,
}

impl ScanOperatorPredicates {
    /// Classify scan conjuncts against the partition columns of `scan`'s table.
    pub fn classify(scan: &ScanOp, partition_columns: &[String]) -> Self {
        let partition_ids: HashSet<ColumnId> = scan
            .columns
            .iter()
            .filter(|c| partition_columns.iter().any(|p| p == &c.name))
            .map(|c| c.id)
            .collect();
        let (partition_conjuncts, non_partition_conjuncts) = scan
            .predicates
            .iter()
            .cloned()
            .partition(|p| !p.columns().is_empty() && p.bound_by(&partition_ids));
        Self {
            partition_columns: partition_columns.to_vec(),
            partition_conjuncts,
            non_partition_conjuncts,
            selected_partitions: None,
        }
    }

    pub fn all_conjuncts(&self) -> impl Iterator<Item = &Expr> {
        self.partition_conjuncts
            .iter()
            .chain(self.non_partition_conjuncts.iter())
    }
}

/// Logical operators: represent *what* to compute, not *how*.
///
/// These operators are the input to the optimizer. Transformation rules rewrite them
/// into equivalent logical alternatives, and implementation rules map them to
/// physical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    /// Table scan. Always a leaf.
    Scan(ScanOp),
    /// Filter: applies a predicate to its single child, discarding non-matching rows.
    Filter { predicate: Expr },
    /// Projection: each output column is computed from the child's columns.
    Project { exprs: Vec<(ColumnRef, Expr)> },
    /// Join of two children. `condition` is `None` for cross joins.
    Join {
        join_type: JoinType,
        condition: Option<Expr>,
        #[serde(default)]
        hint: JoinHint,
    },
    /// Aggregate: groups rows by `group_by` and computes `aggregates` per group.
    Aggregate {
        group_by: Vec<ColumnRef>,
        aggregates: Vec<AggExpr>,
    },
    /// Repeat: emits every input row once per grouping set, nulling the repeat
    /// columns absent from that set and tagging the row with its grouping id.
    Repeat {
        repeat_columns: Vec<ColumnRef>,
        grouping_sets: Vec<Vec<ColumnId>>,
        grouping_id: ColumnRef,
    },
    /// Set operation over N children. `inputs[i]` lists child i's columns in the
    /// order of `output`.
    SetOperation {
        kind: SetOpKind,
        output: Vec<ColumnRef>,
        inputs: Vec<Vec<ColumnRef>>,
    },
    /// Full sort of the input.
    Sort { order: Vec<SortKey> },
    /// Sort followed by a limit.
    TopN {
        order: Vec<SortKey>,
        offset: u64,
        count: u64,
    },
    /// Returns at most `count` rows starting from `offset`.
    Limit { offset: u64, count: u64 },
    /// Reads a common table expression. `columns` maps each output column to the
    /// producer column it reads.
    CteConsumer {
        cte_id: CteId,
        columns: Vec<(ColumnRef, ColumnId)>,
    },
}

/// Kind discriminant for pattern matching (without data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOpKind {
    Scan,
    Filter,
    Project,
    Join,
    Aggregate,
    Repeat,
    SetOperation,
    Sort,
    TopN,
    Limit,
    CteConsumer,
}

impl LogicalOp {
    pub fn kind(&self) -> LogicalOpKind {
        match self {
            LogicalOp::Scan(_) => LogicalOpKind::Scan,
            LogicalOp::Filter { .. } => LogicalOpKind::Filter,
            LogicalOp::Project { .. } => LogicalOpKind::Project,
            LogicalOp::Join { .. } => LogicalOpKind::Join,
            LogicalOp::Aggregate { .. } => LogicalOpKind::Aggregate,
            LogicalOp::Repeat { .. } => LogicalOpKind::Repeat,
            LogicalOp::SetOperation { .. } => LogicalOpKind::SetOperation,
            LogicalOp::Sort { .. } => LogicalOpKind::Sort,
            LogicalOp::TopN { .. } => LogicalOpKind::TopN,
            LogicalOp::Limit { .. } => LogicalOpKind::Limit,
            LogicalOp::CteConsumer { .. } => LogicalOpKind::CteConsumer,
        }
    }
}

/// Grouping id of each grouping set.
///
/// Bit `n - 1 - i` is set when `repeat_columns[i]` is absent from the set, so the
/// first repeat column is the most significant bit.
pub fn grouping_ids(repeat_columns: &[ColumnRef], grouping_sets: &[Vec<ColumnId>]) -> Vec<u64> {
    let n = repeat_columns.len();
    grouping_sets
        .iter()
        .map(|set| {
            repeat_columns
                .iter()
                .enumerate()
                .filter(|(_, c)| !set.contains(&c.id))
                .fold(0u64, |acc, (i, _)| acc | (1u64 << (n - 1 - i)))
        })
        .collect()
}

/// Split a join condition into `left_col = right_col` key pairs and residual
/// conjuncts. Key pairs are oriented so the first column comes from `left_ids`.
pub fn extract_equi_keys(
    condition: Option<&Expr>,
    left_ids: &HashSet<ColumnId>,
    right_ids: &HashSet<ColumnId>,
) -> (Vec<(ColumnRef, ColumnRef)>, Vec<Expr>) {
    let mut keys = Vec::new();
    let mut residual = Vec::new();
    let Some(condition) = condition else {
        return (keys, residual);
    };
    for conjunct in condition.conjuncts() {
        match conjunct.as_column_equality() {
            Some((a, b)) if left_ids.contains(&a.id) && right_ids.contains(&b.id) => {
                keys.push((a.clone(), b.clone()));
            }
            Some((a, b)) if left_ids.contains(&b.id) && right_ids.contains(&a.id) => {
                keys.push((b.clone(), a.clone()));
            }
            _ => residual.push(conjunct.clone()),
        }
    }
    (keys, residual)
}
