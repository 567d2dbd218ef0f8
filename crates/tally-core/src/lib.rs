//! Tally Core - indicator model and monthly aggregation primitives
//!
//! This crate holds everything that does not touch a backend: the
//! indicator/datasource model, the error taxonomy, month arithmetic,
//! the period resolver, the in-memory reducer used by file sources and
//! the normalizer that turns raw aggregate rows into an indicator series.

pub mod error;
pub mod model;
pub mod month;
pub mod normalize;
pub mod period;
pub mod reduce;
pub mod table;

pub use error::{Result, TallyError};
pub use model::{
    AggregationSpec, ColumnOperation, DatabaseConnection, DateExtreme, Datasource, DatasourceBinding,
    DatasourceKind, Engine, FileFormat, FileLocation, Indicator, IndicatorDataPoint, SyncMode,
};
pub use month::{DateRange, YearMonth};
pub use normalize::{normalize, RawAggregateRow};
pub use period::{PeriodResolver, SyncState};
pub use reduce::{ReductionPlan, Reducer};
pub use table::{ColumnMeta, TableData};
