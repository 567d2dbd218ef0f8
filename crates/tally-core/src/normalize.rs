//! Result normalization: raw per-month aggregates into an indicator series.

use serde_json::Value;

use crate::error::{Result, TallyError};
use crate::model::{Indicator, IndicatorDataPoint};
use crate::month::YearMonth;
use crate::table::TableData;

/// Column alias carrying the month number in pushed-down results.
pub const MONTH_ALIAS: &str = "period_month";
/// Column alias carrying the year in pushed-down results.
pub const YEAR_ALIAS: &str = "period_year";
/// Month and year aliases of templates using the older placeholders.
pub const LEGACY_MONTH_ALIAS: &str = "mes";
pub const LEGACY_YEAR_ALIAS: &str = "anio";
/// Column alias carrying the reduced value.
pub const RESULT_ALIAS: &str = "result";

/// One month bucket as produced by a backend or the in-memory reducer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawAggregateRow {
    pub period: YearMonth,
    pub value: Option<f64>,
}

impl RawAggregateRow {
    pub fn new(period: YearMonth, value: Option<f64>) -> Self {
        Self { period, value }
    }
}

/// Numeric reading of a cell. Drivers hand back DECIMAL and NUMERIC
/// columns as strings, so numeric text counts.
pub fn numeric(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn whole_number(cell: &Value) -> Option<i64> {
    let f = numeric(cell)?;
    (f.fract() == 0.0).then_some(f as i64)
}

/// Read a recordset aliased `period_month`, `period_year`, `result`
/// (or `mes`, `anio`, `result`).
pub fn rows_from_table(data: &TableData, table: &str) -> Result<Vec<RawAggregateRow>> {
    if data.rows.is_empty() {
        return Ok(Vec::new());
    }
    let find = |alias: &str, fallback: Option<&str>| {
        data.column_index(alias)
            .or_else(|| fallback.and_then(|f| data.column_index(f)))
            .ok_or_else(|| {
                TallyError::query(
                    table,
                    format!("aggregate result has no '{}' column", alias),
                )
            })
    };
    let month_idx = find(MONTH_ALIAS, Some(LEGACY_MONTH_ALIAS))?;
    let year_idx = find(YEAR_ALIAS, Some(LEGACY_YEAR_ALIAS))?;
    let result_idx = find(RESULT_ALIAS, None)?;

    (0..data.rows.len())
        .map(|i| {
            let month = whole_number(data.cell(i, month_idx));
            let year = whole_number(data.cell(i, year_idx));
            let period = match (year, month) {
                (Some(y), Some(m)) => i32::try_from(y)
                    .ok()
                    .zip(u32::try_from(m).ok())
                    .and_then(|(y, m)| YearMonth::new(y, m)),
                _ => None,
            }
            .ok_or_else(|| {
                TallyError::query(
                    table,
                    format!(
                        "invalid month bucket {}/{} in aggregate result",
                        data.cell(i, month_idx),
                        data.cell(i, year_idx)
                    ),
                )
            })?;
            Ok(RawAggregateRow::new(period, numeric(data.cell(i, result_idx))))
        })
        .collect()
}

/// Build the canonical series: ascending by month, dated at the end of
/// each month, identifiers copied from the indicator.
pub fn normalize(indicator: &Indicator, mut rows: Vec<RawAggregateRow>) -> Vec<IndicatorDataPoint> {
    rows.sort_by_key(|r| r.period);
    rows.into_iter()
        .map(|r| IndicatorDataPoint {
            indicator_id: indicator.id.clone(),
            customer_id: indicator.customer_id.clone(),
            value: r.value,
            date: r.period.end_of_month(),
        })
        .collect()
}
