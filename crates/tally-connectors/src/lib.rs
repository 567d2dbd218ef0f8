//! Tally Connectors - data source adapters and the aggregation engine
//!
//! Every backend family (relational SQL, document store, flat files) sits
//! behind [`DataSourceAdapter`]. Callers get a `Box<dyn DataSourceAdapter>`
//! from [`build_adapter`] and drive it without knowing the backend, or hand
//! the whole job to [`AggregationEngine`].

pub mod binding;
pub mod config;
pub mod csv_file;
pub mod engine;
pub mod excel;
pub mod factory;
pub mod file;
pub mod json_file;
pub mod mongo;
pub mod mssql;
pub mod query;
pub mod sql;

use async_trait::async_trait;
use tally_core::{AggregationSpec, DateExtreme, RawAggregateRow, Result, TableData, YearMonth};

pub use config::EngineConfig;
pub use engine::{AggregationEngine, AggregationRequest, DatasourceSnapshot};
pub use factory::build_adapter;
pub use query::SqlDialect;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Uniform capability set over structurally different backends.
///
/// An adapter owns at most one connection handle. [`open`](Self::open) is
/// idempotent and every other call opens the handle on demand, so a caller
/// may skip it. [`close`](Self::close) releases the handle; the adapter can
/// be reopened afterwards.
#[async_trait]
pub trait DataSourceAdapter: Send {
    /// Backend label used in logs and connection errors.
    fn kind(&self) -> &'static str;

    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Base tables, collections, sheets or the synthetic file table.
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Column metadata plus up to `limit` rows (`0` = no cap). `raw_query`
    /// replaces the default row fetch where the backend supports it.
    async fn table_rows(
        &mut self,
        table: &str,
        limit: usize,
        raw_query: Option<&str>,
    ) -> Result<TableData>;

    /// One raw row per month present in `spec.range`.
    async fn monthly_aggregate(&mut self, spec: &AggregationSpec) -> Result<Vec<RawAggregateRow>>;

    /// Month of the earliest or latest non-null date, `None` for an empty
    /// table.
    async fn extreme_date(
        &mut self,
        table: &str,
        date_column: &str,
        extreme: DateExtreme,
    ) -> Result<Option<YearMonth>>;
}
