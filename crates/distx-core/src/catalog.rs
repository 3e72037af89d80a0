//! # Catalog Interface
//!
//! The catalog provides the optimizer with metadata about the database schema and
//! the statistics facade provides table/column statistics. Both are external
//! services; the optimizer only sees them through the [`Catalog`] and
//! [`StatisticsProvider`] traits.
//!
//! ## Table Metadata
//!
//! A table has a keys type (duplicate rows or pre-aggregated keys), partitions with
//! their partition-column values, an optional bucket distribution and a list of
//! rollups (materialized indexes over a subset of its columns).
//!
//! ## Caching
//!
//! [`StatisticsCache`] wraps a provider for the duration of one optimization pass so
//! every `(table, column)` pair is fetched at most once.
//!
//! `InMemoryCatalog` implements both traits and is what tests and the HTTP service
//! use. It is populated programmatically or deserialized from JSON.

use crate::expr::{ScalarValue, TableRef};
use crate::stats::ColumnStatistic;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;

/// Whether a table stores raw rows or rows pre-aggregated by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeysType {
    #[default]
    Duplicate,
    Aggregate,
}

/// Aggregation applied by the storage engine to a value column of an
/// aggregate-keyed table or rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageAggType {
    Sum,
    Min,
    Max,
    Replace,
    /// Stores a partial row count of `source`; re-aggregated with `sum`.
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// `None` for key columns.
    #[serde(default)]
    pub agg_type: Option<StorageAggType>,
}

impl ColumnMeta {
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agg_type: None,
        }
    }

    pub fn value(name: impl Into<String>, agg: StorageAggType) -> Self {
        Self {
            name: name.into(),
            agg_type: Some(agg),
        }
    }
}

/// Hash bucketing of a table's rows across tablets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDistributionMeta {
    pub columns: Vec<String>,
    pub buckets: u32,
    /// Tables in the same colocate group place equal bucket values on the same node.
    #[serde(default)]
    pub colocate_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: u64,
    pub name: String,
    /// One value per partition column.
    pub values: Vec<ScalarValue>,
}

/// A value column stored by a rollup: `agg(source)` under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupValueColumn {
    pub name: String,
    pub agg: StorageAggType,
    pub source: String,
}

/// A materialized index over a subset of a table's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupMeta {
    pub name: String,
    pub keys_type: KeysType,
    /// Key columns in sort-key order.
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub value_columns: Vec<RollupValueColumn>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl RollupMeta {
    pub fn has_key(&self, column: &str) -> bool {
        self.key_columns.iter().any(|k| k == column)
    }

    pub fn value_column(&self, source: &str, agg: StorageAggType) -> Option<&RollupValueColumn> {
        self.value_columns
            .iter()
            .find(|v| v.source == source && v.agg == agg)
    }

    /// Whether the rollup stores `column` at all, as key or value.
    pub fn has_column(&self, column: &str) -> bool {
        self.has_key(column) || self.value_columns.iter().any(|v| v.name == column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table: TableRef,
    #[serde(default)]
    pub keys_type: KeysType,
    pub columns: Vec<ColumnMeta>,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionMeta>,
    #[serde(default)]
    pub distribution: Option<BucketDistributionMeta>,
    #[serde(default)]
    pub rollups: Vec<RollupMeta>,
}

impl TableMeta {
    pub fn new(table: TableRef, columns: Vec<ColumnMeta>) -> Self {
        Self {
            table,
            keys_type: KeysType::Duplicate,
            columns,
            partition_columns: Vec::new(),
            partitions: Vec::new(),
            distribution: None,
            rollups: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key columns of the base table, in declaration order.
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.agg_type.is_none())
            .map(|c| c.name.clone())
            .collect()
    }

    /// The base table described as a rollup of itself.
    pub fn base_index(&self, row_count: Option<u64>) -> RollupMeta {
        RollupMeta {
            name: self.table.name.clone(),
            keys_type: self.keys_type,
            key_columns: self.key_columns(),
            value_columns: self
                .columns
                .iter()
                .filter_map(|c| {
                    c.agg_type.map(|agg| RollupValueColumn {
                        name: c.name.clone(),
                        agg,
                        source: c.name.clone(),
                    })
                })
                .collect(),
            row_count,
        }
    }

    pub fn rollup(&self, name: &str) -> Option<&RollupMeta> {
        self.rollups.iter().find(|r| r.name == name)
    }
}

/// Catalog provides schema information.
pub trait Catalog: Send + Sync {
    fn table(&self, table: &TableRef) -> Option<&TableMeta>;
}

/// Read-only statistics facade.
pub trait StatisticsProvider: Send + Sync {
    /// Statistic of one column; [`ColumnStatistic::unknown`] when absent.
    fn column_statistic(&self, table: &TableRef, column: &str) -> ColumnStatistic;
    fn table_row_count(&self, table: &TableRef) -> Option<u64>;
}

/// Per-pass cache in front of a [`StatisticsProvider`].
pub struct StatisticsCache<'a> {
    provider: &'a dyn StatisticsProvider,
    columns: RefCell<HashMap<(TableRef, String), ColumnStatistic>>,
    rows: RefCell<HashMap<TableRef, Option<u64>>>,
}

impl<'a> StatisticsCache<'a> {
    pub fn new(provider: &'a dyn StatisticsProvider) -> Self {
        Self {
            provider,
            columns: RefCell::new(HashMap::new()),
            rows: RefCell::new(HashMap::new()),
        }
    }

    pub fn column_statistic(&self, table: &TableRef, column: &str) -> ColumnStatistic {
        let key = (table.clone(), column.to_string());
        if let Some(hit) = self.columns.borrow().get(&key) {
            return hit.clone();
        }
        let stat = self.provider.column_statistic(table, column);
        self.columns.borrow_mut().insert(key, stat.clone());
        stat
    }

    pub fn table_row_count(&self, table: &TableRef) -> Option<u64> {
        if let Some(hit) = self.rows.borrow().get(table) {
            return *hit;
        }
        let rows = self.provider.table_row_count(table);
        self.rows.borrow_mut().insert(table.clone(), rows);
        rows
    }
}

/// In-memory catalog and statistics store for testing and development.
///
/// Tables are keyed by their fully-qualified name (`schema.table`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryCatalog {
    #[serde(default)]
    pub tables: HashMap<String, TableMeta>,
    #[serde(default)]
    pub row_counts: HashMap<String, u64>,
    /// Column statistics keyed by table name, then column name.
    #[serde(default)]
    pub column_stats: HashMap<String, HashMap<String, ColumnStatistic>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, meta: TableMeta) {
        self.tables.insert(meta.table.to_string(), meta);
    }

    pub fn set_row_count(&mut self, table: &TableRef, rows: u64) {
        self.row_counts.insert(table.to_string(), rows);
    }

    pub fn set_column_statistic(&mut self, table: &TableRef, column: &str, stat: ColumnStatistic) {
        self.column_stats
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), stat);
    }
}

impl Catalog for InMemoryCatalog {
    fn table(&self, table: &TableRef) -> Option<&TableMeta> {
        self.tables.get(&table.to_string())
    }
}

impl StatisticsProvider for InMemoryCatalog {
    fn column_statistic(&self, table: &TableRef, column: &str) -> ColumnStatistic {
        self.column_stats
            .get(&table.to_string())
            .and_then(|cols| cols.get(column))
            .cloned()
            .unwrap_or_else(ColumnStatistic::unknown)
    }

    fn table_row_count(&self, table: &TableRef) -> Option<u64> {
        self.row_counts.get(&table.to_string()).copied()
    }
}
