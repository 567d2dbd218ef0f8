//! In-memory monthly reduction for sources that cannot group server-side.
//!
//! The reducers follow SQL aggregate semantics so a file and a database
//! holding the same rows produce the same series: null and empty cells are
//! ignored, `AVERAGE` is `sum / len` over numeric cells, `COUNT` counts
//! non-null cells and `COUNT_DISTINCT` counts unique non-null cells. A
//! month only gets a bucket when at least one row dated inside it exists,
//! mirroring `GROUP BY`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TallyError};
use crate::model::{AggregationSpec, ColumnOperation, DateExtreme};
use crate::month::{cell_date, DateRange, YearMonth};
use crate::normalize::{numeric, RawAggregateRow};
use crate::table::TableData;

/// Reducer usable without a query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Average,
    Sum,
    Count,
    CountDistinct,
}

impl TryFrom<ColumnOperation> for Reducer {
    type Error = TallyError;

    fn try_from(op: ColumnOperation) -> Result<Self> {
        match op {
            ColumnOperation::Average => Ok(Reducer::Average),
            ColumnOperation::Sum => Ok(Reducer::Sum),
            ColumnOperation::Count => Ok(Reducer::Count),
            ColumnOperation::CountDistinct => Ok(Reducer::CountDistinct),
            ColumnOperation::CustomQuery => Err(TallyError::configuration(
                "custom queries need a query engine and cannot run against this source",
            )),
        }
    }
}

/// Month boundaries plus the reducer to apply to fetched rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionPlan {
    pub date_column: String,
    pub value_column: String,
    pub reducer: Reducer,
    pub range: DateRange,
}

#[derive(Default)]
struct Bucket {
    sum: f64,
    numeric: usize,
    non_null: usize,
    distinct: BTreeSet<String>,
}

impl Bucket {
    fn add(&mut self, cell: &Value) {
        let key = match cell {
            Value::Null => return,
            Value::String(s) if s.trim().is_empty() => return,
            _ => distinct_key(cell),
        };
        self.non_null += 1;
        if let Some(n) = numeric(cell) {
            self.sum += n;
            self.numeric += 1;
        }
        self.distinct.insert(key);
    }

    fn value(&self, reducer: Reducer) -> Option<f64> {
        match reducer {
            Reducer::Average => (self.numeric > 0).then(|| self.sum / self.numeric as f64),
            Reducer::Sum => (self.numeric > 0).then_some(self.sum),
            Reducer::Count => Some(self.non_null as f64),
            Reducer::CountDistinct => {
                (!self.distinct.is_empty()).then_some(self.distinct.len() as f64)
            }
        }
    }
}

/// `10`, `"10"` and `"10.0"` are the same value for distinct counting.
fn distinct_key(cell: &Value) -> String {
    match numeric(cell) {
        Some(n) => format!("{}", n),
        None => match cell {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        },
    }
}

impl ReductionPlan {
    pub fn from_spec(spec: &AggregationSpec) -> Result<Self> {
        Ok(Self {
            date_column: spec.date_column.clone(),
            value_column: spec.value_column.clone(),
            reducer: Reducer::try_from(spec.operation)?,
            range: spec.range,
        })
    }

    /// Apply the plan. Rows whose date cell cannot be parsed are skipped.
    pub fn reduce(&self, table_name: &str, data: &TableData) -> Result<Vec<RawAggregateRow>> {
        if self.range.is_empty() {
            return Ok(Vec::new());
        }
        let date_idx = self.column(table_name, data, &self.date_column)?;
        let value_idx = self.column(table_name, data, &self.value_column)?;

        let mut buckets: BTreeMap<YearMonth, Bucket> = BTreeMap::new();
        let mut undated = 0usize;
        for row in 0..data.rows.len() {
            let Some(date) = cell_date(data.cell(row, date_idx)) else {
                undated += 1;
                continue;
            };
            if !self.range.contains(date) {
                continue;
            }
            buckets
                .entry(YearMonth::of(date))
                .or_default()
                .add(data.cell(row, value_idx));
        }
        if undated > 0 {
            debug!(
                "Skipped {} rows of '{}' without a parseable '{}'",
                undated, table_name, self.date_column
            );
        }

        Ok(buckets
            .into_iter()
            .map(|(period, bucket)| RawAggregateRow::new(period, bucket.value(self.reducer)))
            .collect())
    }

    fn column(&self, table_name: &str, data: &TableData, title: &str) -> Result<usize> {
        data.column_index(title).ok_or_else(|| {
            TallyError::configuration(format!(
                "column '{}' not found in '{}'",
                title, table_name
            ))
        })
    }
}

/// Earliest or latest parseable date in `column`, as a month.
pub fn extreme_month(
    table_name: &str,
    data: &TableData,
    column: &str,
    extreme: DateExtreme,
) -> Result<Option<YearMonth>> {
    let idx = data.column_index(column).ok_or_else(|| {
        TallyError::configuration(format!("column '{}' not found in '{}'", column, table_name))
    })?;
    let dates = (0..data.rows.len()).filter_map(|row| cell_date(data.cell(row, idx)));
    let found = match extreme {
        DateExtreme::Min => dates.min(),
        DateExtreme::Max => dates.max(),
    };
    Ok(found.map(YearMonth::of))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnMeta;
    use chrono::NaiveDate;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sales() -> TableData {
        TableData::new(
            vec![ColumnMeta::new("date"), ColumnMeta::new("amount")],
            vec![
                vec![json!("2024-01-15"), json!("10")],
                vec![json!("2024-01-20"), json!("5")],
                vec![json!("2024-02-01"), json!("3")],
            ],
        )
    }

    fn plan(reducer: Reducer, from: NaiveDate, to: NaiveDate) -> ReductionPlan {
        ReductionPlan {
            date_column: "date".to_string(),
            value_column: "amount".to_string(),
            reducer,
            range: DateRange::new(from, to),
        }
    }

    fn values(rows: &[RawAggregateRow]) -> Vec<(String, Option<f64>)> {
        rows.iter().map(|r| (r.period.to_string(), r.value)).collect()
    }

    #[test]
    fn test_sum_by_month() {
        let rows = plan(Reducer::Sum, d(2024, 1, 1), d(2024, 2, 29))
            .reduce("main", &sales())
            .unwrap();
        assert_eq!(
            values(&rows),
            vec![
                ("2024-01".to_string(), Some(15.0)),
                ("2024-02".to_string(), Some(3.0))
            ]
        );
    }

    #[test]
    fn test_average_is_sum_over_len() {
        let rows = plan(Reducer::Average, d(2024, 1, 1), d(2024, 1, 31))
            .reduce("main", &sales())
            .unwrap();
        assert_eq!(values(&rows), vec![("2024-01".to_string(), Some(7.5))]);
    }

    #[test]
    fn test_count_distinct_counts_unique_values() {
        let mut data = sales();
        data.rows.push(vec![json!("2024-01-25"), json!("10.0")]);
        data.rows.push(vec![json!("2024-01-26"), json!(5)]);
        let reduce = |r| {
            plan(r, d(2024, 1, 1), d(2024, 1, 31))
                .reduce("main", &data)
                .unwrap()[0]
                .value
        };
        assert_eq!(reduce(Reducer::CountDistinct), Some(2.0));
        assert_eq!(reduce(Reducer::Count), Some(4.0));
    }

    #[test]
    fn test_months_without_rows_get_no_bucket() {
        let rows = plan(Reducer::Count, d(2023, 12, 1), d(2024, 3, 31))
            .reduce("main", &sales())
            .unwrap();
        let months: Vec<String> = values(&rows).into_iter().map(|(m, _)| m).collect();
        assert_eq!(months, vec!["2024-01", "2024-02"]);
    }

    #[test]
    fn test_bucket_with_only_nulls() {
        let data = TableData::new(
            vec![ColumnMeta::new("date"), ColumnMeta::new("amount")],
            vec![
                vec![json!("2024-01-15"), Value::Null],
                vec![json!("2024-01-16"), json!("")],
            ],
        );
        for (reducer, expected) in [
            (Reducer::Sum, None),
            (Reducer::Average, None),
            (Reducer::CountDistinct, None),
            (Reducer::Count, Some(0.0)),
        ] {
            let rows = plan(reducer, d(2024, 1, 1), d(2024, 1, 31))
                .reduce("main", &data)
                .unwrap();
            assert_eq!(rows[0].value, expected, "{:?}", reducer);
        }
    }

    #[test]
    fn test_range_bounds_are_inclusive_days() {
        let data = TableData::new(
            vec![ColumnMeta::new("date"), ColumnMeta::new("amount")],
            vec![
                vec![json!("2024-01-31 23:59:00"), json!(1)],
                vec![json!("2024-02-01T00:00:00"), json!(100)],
            ],
        );
        let rows = plan(Reducer::Sum, d(2024, 1, 1), d(2024, 1, 31))
            .reduce("main", &data)
            .unwrap();
        assert_eq!(values(&rows), vec![("2024-01".to_string(), Some(1.0))]);
    }

    #[test]
    fn test_inverted_range_reduces_to_nothing() {
        let rows = plan(Reducer::Sum, d(2024, 3, 1), d(2024, 2, 1))
            .reduce("main", &sales())
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unknown_column_is_configuration_error() {
        let mut p = plan(Reducer::Sum, d(2024, 1, 1), d(2024, 2, 1));
        p.value_column = "total".to_string();
        let err = p.reduce("main", &sales()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_custom_query_has_no_reducer() {
        assert!(Reducer::try_from(ColumnOperation::CustomQuery).is_err());
    }

    #[test]
    fn test_extreme_month() {
        let data = sales();
        assert_eq!(
            extreme_month("main", &data, "date", DateExtreme::Min).unwrap(),
            YearMonth::new(2024, 1)
        );
        assert_eq!(
            extreme_month("main", &data, "date", DateExtreme::Max).unwrap(),
            YearMonth::new(2024, 2)
        );
        assert_eq!(
            extreme_month("main", &TableData::new(data.columns.clone(), vec![]), "date", DateExtreme::Max)
                .unwrap(),
            None
        );
    }
}
