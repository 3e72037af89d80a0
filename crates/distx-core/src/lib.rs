//! # distx-core: Distributed Cost-Based Query Optimizer Core
//!
//! This crate turns a resolved logical relational plan into a distributed physical
//! plan: join distribution strategies, aggregation staging, rollup substitution,
//! grouping-set lowering, CTE reuse and runtime-filter placement, all driven by
//! table and column statistics. The built-in rules live in `distx-rules`.
//!
//! ## Module Overview
//!
//! - **`expr`**: Scalar expressions and logical operator definitions.
//! - **`plan`**: Logical plan trees, CTE producers and query validation.
//! - **`physical`**: Physical operators and the chosen physical tree.
//! - **`search`**: The optimization pass: rewrite, CTE decision, implementation.
//! - **`rule`**: The Rule trait, RuleRegistry and the per-pass `OptContext`.
//! - **`pattern`**: Declarative pattern matching for rule applicability checks.
//! - **`cost`**: Cost model trait and default implementation (CPU/memory/network weighted).
//! - **`stats`**: Statistics structures and cardinality estimation formulas.
//! - **`properties`**: Data distributions, requirements and exchange kinds.
//! - **`catalog`**: Catalog and statistics traits plus an in-memory implementation.
//! - **`cte`**: CTE inline/reuse decision.
//! - **`runtime_filter`**: Runtime filter generation and propagation.
//! - **`fragment`**: Cutting the physical tree into distributed fragments.
//! - **`explain`**: EXPLAIN text rendering.
//! - **`config`**: Optimizer configuration.
//! - **`error`**: Error type shared by every fallible operation.

pub mod catalog;
pub mod config;
pub mod cost;
pub mod cte;
pub mod error;
pub mod explain;
pub mod expr;
pub mod fragment;
pub mod pattern;
pub mod physical;
pub mod plan;
pub mod properties;
pub mod rule;
pub mod runtime_filter;
pub mod search;
pub mod stats;
