//! Aggregation orchestrator: period resolution, backend aggregation and
//! normalization for one indicator at a time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tally_core::{
    normalize, AggregationSpec, DateExtreme, DateRange, Datasource, Indicator,
    IndicatorDataPoint, PeriodResolver, Result, SyncMode, SyncState, TableData, TallyError,
};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::factory::build_adapter;
use crate::DataSourceAdapter;

/// Aggregation over an explicit range. `from` defaults to the month of the
/// earliest record and `to` to today.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRequest {
    pub datasource: Datasource,
    pub indicator: Indicator,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

/// Result of discovering a datasource: its tables plus a sample of the
/// first one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceSnapshot {
    pub tables: Vec<String>,
    pub sample: Option<TableData>,
}

pub struct AggregationEngine {
    config: EngineConfig,
    resolver: PeriodResolver,
}

impl AggregationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            resolver: PeriodResolver::default(),
        }
    }

    /// Pin "today" for period resolution.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.resolver = PeriodResolver::new(today);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Indicator runs
    // -----------------------------------------------------------------------

    /// Compute the series for `indicator` in `mode`. The indicator is never
    /// modified; advancing `lastSyncedDate` after a full run is up to the
    /// caller.
    pub async fn run(
        &self,
        datasource: &Datasource,
        indicator: &Indicator,
        mode: SyncMode,
    ) -> Result<Vec<IndicatorDataPoint>> {
        check_binding(datasource, indicator)?;
        let mut adapter = build_adapter(datasource, &self.config)?;
        self.run_with_adapter(adapter.as_mut(), indicator, mode).await
    }

    /// Same as [`run`](Self::run) against an adapter the caller built.
    /// The adapter is closed before returning.
    pub async fn run_with_adapter(
        &self,
        adapter: &mut dyn DataSourceAdapter,
        indicator: &Indicator,
        mode: SyncMode,
    ) -> Result<Vec<IndicatorDataPoint>> {
        indicator.datasource.validate()?;
        info!(
            "Running {:?} aggregation for indicator '{}' on {} table '{}'",
            mode,
            indicator.id,
            adapter.kind(),
            indicator.datasource.table
        );
        let result = self.sync(adapter, indicator, mode).await;
        finish(adapter, result).await
    }

    async fn sync(
        &self,
        adapter: &mut dyn DataSourceAdapter,
        indicator: &Indicator,
        mode: SyncMode,
    ) -> Result<Vec<IndicatorDataPoint>> {
        adapter.open().await?;
        let binding = &indicator.datasource;

        let range = match mode {
            SyncMode::Preview => adapter
                .extreme_date(&binding.table, &binding.date_column, DateExtreme::Max)
                .await?
                .map(|latest| self.resolver.preview(latest)),
            SyncMode::Full => {
                let mut state = SyncState::of(indicator);
                if state.needs_probe() {
                    if let Some(earliest) = adapter
                        .extreme_date(&binding.table, &binding.date_column, DateExtreme::Min)
                        .await?
                    {
                        debug!("Earliest record of '{}' is in {}", binding.table, earliest);
                        state = state.with_earliest(earliest);
                    }
                }
                self.resolver.resolve(&state)
            }
        };

        self.aggregate_range(adapter, indicator, range).await
    }

    /// Aggregate over an explicit range, ignoring the indicator's sync date.
    pub async fn aggregate(&self, request: &AggregationRequest) -> Result<Vec<IndicatorDataPoint>> {
        check_binding(&request.datasource, &request.indicator)?;
        request.indicator.datasource.validate()?;
        let mut adapter = build_adapter(&request.datasource, &self.config)?;
        let result = self.aggregate_explicit(adapter.as_mut(), request).await;
        finish(adapter.as_mut(), result).await
    }

    async fn aggregate_explicit(
        &self,
        adapter: &mut dyn DataSourceAdapter,
        request: &AggregationRequest,
    ) -> Result<Vec<IndicatorDataPoint>> {
        adapter.open().await?;
        let binding = &request.indicator.datasource;
        let earliest = match request.from {
            Some(_) => None,
            None => {
                adapter
                    .extreme_date(&binding.table, &binding.date_column, DateExtreme::Min)
                    .await?
            }
        };
        let range = self.resolver.explicit(request.from, request.to, earliest);
        self.aggregate_range(adapter, &request.indicator, range).await
    }

    async fn aggregate_range(
        &self,
        adapter: &mut dyn DataSourceAdapter,
        indicator: &Indicator,
        range: Option<DateRange>,
    ) -> Result<Vec<IndicatorDataPoint>> {
        let binding = &indicator.datasource;
        let Some(range) = range else {
            info!("Table '{}' has no dated rows, nothing to aggregate", binding.table);
            return Ok(Vec::new());
        };
        if range.is_empty() {
            info!(
                "Indicator '{}' is up to date ({}), nothing to aggregate",
                indicator.id, range
            );
            return Ok(Vec::new());
        }

        let spec = AggregationSpec::from_binding(binding, range);
        let rows = adapter.monthly_aggregate(&spec).await?;
        info!(
            "Aggregated {} month(s) of {} over {} for indicator '{}'",
            rows.len(),
            spec.operation,
            range,
            indicator.id
        );
        Ok(normalize(indicator, rows))
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub async fn list_tables(&self, datasource: &Datasource) -> Result<Vec<String>> {
        let mut adapter = build_adapter(datasource, &self.config)?;
        let result = adapter.list_tables().await;
        finish(adapter.as_mut(), result).await
    }

    /// Tables plus a `row_limit` sample of the first table.
    pub async fn discover(&self, datasource: &Datasource) -> Result<DatasourceSnapshot> {
        let mut adapter = build_adapter(datasource, &self.config)?;
        let result = self.snapshot(adapter.as_mut()).await;
        finish(adapter.as_mut(), result).await
    }

    async fn snapshot(&self, adapter: &mut dyn DataSourceAdapter) -> Result<DatasourceSnapshot> {
        adapter.open().await?;
        let tables = adapter.list_tables().await?;
        let sample = match tables.first() {
            Some(first) => Some(adapter.table_rows(first, self.config.row_limit, None).await?),
            None => None,
        };
        info!("Discovered {} table(s) on {}", tables.len(), adapter.kind());
        Ok(DatasourceSnapshot { tables, sample })
    }

    /// Raw preview of one table. `limit` defaults to the configured row
    /// limit; `0` removes the cap.
    pub async fn table_rows(
        &self,
        datasource: &Datasource,
        table: &str,
        limit: Option<usize>,
        raw_query: Option<&str>,
    ) -> Result<TableData> {
        let limit = limit.unwrap_or(self.config.row_limit);
        let mut adapter = build_adapter(datasource, &self.config)?;
        let result = adapter.table_rows(table, limit, raw_query).await;
        finish(adapter.as_mut(), result).await
    }
}

fn check_binding(datasource: &Datasource, indicator: &Indicator) -> Result<()> {
    let table = &indicator.datasource.table;
    if datasource.allows_table(table) {
        Ok(())
    } else {
        Err(TallyError::configuration(format!(
            "table '{}' is not one of the tables of datasource {}",
            table,
            datasource.title.as_deref().or(datasource.id.as_deref()).unwrap_or("(untitled)")
        )))
    }
}

/// Close the adapter whatever happened. A close failure is logged; the
/// primary result is returned unchanged.
async fn finish<T>(adapter: &mut dyn DataSourceAdapter, result: Result<T>) -> Result<T> {
    if let Err(e) = adapter.close().await {
        warn!("Failed to close {} adapter: {}", adapter.kind(), e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io::Write;
    use std::path::PathBuf;
    use tally_core::normalize::rows_from_table;
    use tally_core::{
        ColumnMeta, ColumnOperation, DatasourceBinding, DatasourceKind, FileLocation,
        RawAggregateRow, YearMonth,
    };

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn indicator(op: ColumnOperation, last_synced: Option<NaiveDate>) -> Indicator {
        Indicator {
            id: "ind-1".to_string(),
            name: Some("Revenue".to_string()),
            customer_id: "cust-1".to_string(),
            last_synced_date: last_synced,
            datasource: DatasourceBinding {
                datasource_id: None,
                table: "main".to_string(),
                date_column: "date".to_string(),
                value_column: "amount".to_string(),
                column_operation: op,
                row_operation: None,
            },
        }
    }

    /// Stands in for a SQL backend: answers with a fixed recordset shaped
    /// like the builder's aliases and records what it was asked.
    #[derive(Default)]
    struct ScriptedAdapter {
        earliest: Option<YearMonth>,
        latest: Option<YearMonth>,
        recordset: TableData,
        fail_aggregate: bool,
        opened: usize,
        closed: usize,
        probes: Vec<DateExtreme>,
        specs: Vec<AggregationSpec>,
    }

    #[async_trait]
    impl DataSourceAdapter for ScriptedAdapter {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn open(&mut self) -> Result<()> {
            self.opened += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }

        async fn list_tables(&mut self) -> Result<Vec<String>> {
            Ok(vec!["main".to_string()])
        }

        async fn table_rows(
            &mut self,
            _table: &str,
            _limit: usize,
            _raw_query: Option<&str>,
        ) -> Result<TableData> {
            Ok(TableData::default())
        }

        async fn monthly_aggregate(
            &mut self,
            spec: &AggregationSpec,
        ) -> Result<Vec<RawAggregateRow>> {
            self.specs.push(spec.clone());
            if self.fail_aggregate {
                return Err(TallyError::query(&spec.table, "syntax error near 'FROM'"));
            }
            rows_from_table(&self.recordset, &spec.table)
        }

        async fn extreme_date(
            &mut self,
            _table: &str,
            _date_column: &str,
            extreme: DateExtreme,
        ) -> Result<Option<YearMonth>> {
            self.probes.push(extreme);
            Ok(match extreme {
                DateExtreme::Min => self.earliest,
                DateExtreme::Max => self.latest,
            })
        }
    }

    fn recordset(rows: &[(u32, i32, serde_json::Value)]) -> TableData {
        TableData::new(
            vec![
                ColumnMeta::new("period_month"),
                ColumnMeta::new("period_year"),
                ColumnMeta::new("result"),
            ],
            rows.iter()
                .map(|(m, y, v)| vec![json!(m), json!(y), v.clone()])
                .collect(),
        )
    }

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    #[tokio::test]
    async fn test_backfill_probes_earliest_month() {
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2024, 2, 10));
        let mut adapter = ScriptedAdapter {
            earliest: Some(ym(2024, 1)),
            recordset: recordset(&[(1, 2024, json!(15)), (2, 2024, json!(3))]),
            ..Default::default()
        };
        let points = engine
            .run_with_adapter(&mut adapter, &indicator(ColumnOperation::Sum, None), SyncMode::Full)
            .await
            .unwrap();

        assert_eq!(adapter.probes, vec![DateExtreme::Min]);
        assert_eq!(adapter.specs[0].range, DateRange::new(d(2024, 1, 1), d(2024, 2, 10)));
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, ym(2024, 1).end_of_month());
        assert_eq!(points[0].value, Some(15.0));
        assert_eq!(points[1].customer_id, "cust-1");
        assert_eq!(adapter.closed, 1);
    }

    #[tokio::test]
    async fn test_incremental_starts_after_last_synced_month() {
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2023, 6, 15));
        let mut adapter = ScriptedAdapter::default();
        let ind = indicator(ColumnOperation::Count, Some(d(2023, 3, 31)));
        engine
            .run_with_adapter(&mut adapter, &ind, SyncMode::Full)
            .await
            .unwrap();

        assert!(adapter.probes.is_empty());
        assert_eq!(adapter.specs[0].range.from, d(2023, 4, 1));
        assert!(!adapter.specs[0].range.contains(d(2023, 3, 31)));
    }

    #[tokio::test]
    async fn test_preview_ignores_last_synced_date() {
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2024, 6, 1));
        let mut adapter = ScriptedAdapter {
            latest: Some(ym(2024, 2)),
            recordset: recordset(&[(2, 2024, json!(3))]),
            ..Default::default()
        };
        let ind = indicator(ColumnOperation::Sum, Some(d(2024, 5, 31)));
        let points = engine
            .run_with_adapter(&mut adapter, &ind, SyncMode::Preview)
            .await
            .unwrap();

        assert_eq!(adapter.probes, vec![DateExtreme::Max]);
        assert_eq!(adapter.specs[0].range, ym(2024, 2).as_range());
        assert_eq!(points.len(), 1);
        assert_eq!(ind.last_synced_date, Some(d(2024, 5, 31)));
    }

    #[tokio::test]
    async fn test_up_to_date_indicator_yields_empty_series() {
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2024, 6, 15));
        let mut adapter = ScriptedAdapter::default();
        let ind = indicator(ColumnOperation::Sum, Some(d(2024, 6, 30)));
        let points = engine
            .run_with_adapter(&mut adapter, &ind, SyncMode::Full)
            .await
            .unwrap();

        assert!(points.is_empty());
        assert!(adapter.specs.is_empty());
        assert_eq!(adapter.closed, 1);
    }

    #[tokio::test]
    async fn test_empty_table_yields_empty_series() {
        let engine = AggregationEngine::new(EngineConfig::default());
        let mut adapter = ScriptedAdapter::default();
        let points = engine
            .run_with_adapter(&mut adapter, &indicator(ColumnOperation::Sum, None), SyncMode::Full)
            .await
            .unwrap();
        assert!(points.is_empty());
        assert!(adapter.specs.is_empty());
    }

    #[tokio::test]
    async fn test_bad_custom_query_never_opens() {
        let engine = AggregationEngine::new(EngineConfig::default());
        let mut adapter = ScriptedAdapter::default();
        let mut ind = indicator(ColumnOperation::CustomQuery, Some(d(2024, 1, 31)));
        ind.datasource.row_operation =
            Some("SELECT ${date_group_prefix}, SUM(amount) AS result FROM sales".to_string());

        let err = engine
            .run_with_adapter(&mut adapter, &ind, SyncMode::Full)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(adapter.opened, 0);
        assert!(adapter.specs.is_empty());
    }

    #[tokio::test]
    async fn test_adapter_closed_on_query_error() {
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2024, 3, 1));
        let mut adapter = ScriptedAdapter {
            fail_aggregate: true,
            ..Default::default()
        };
        let ind = indicator(ColumnOperation::Sum, Some(d(2024, 1, 31)));
        let err = engine
            .run_with_adapter(&mut adapter, &ind, SyncMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::Query { .. }));
        assert_eq!(adapter.closed, 1);
    }

    #[tokio::test]
    async fn test_table_outside_datasource_tables_rejected() {
        let engine = AggregationEngine::new(EngineConfig::default());
        let datasource = Datasource {
            id: Some("ds-1".to_string()),
            title: Some("Sales export".to_string()),
            kind: DatasourceKind::File(FileLocation {
                file_path: PathBuf::from("/nonexistent/sales.csv"),
                extension: None,
            }),
            tables: vec!["orders".to_string()],
        };
        let err = engine
            .run(&datasource, &indicator(ColumnOperation::Sum, None), SyncMode::Full)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    // A CSV file and a SQL recordset holding the same rows must produce the
    // same series for every built-in operation.
    #[tokio::test]
    async fn test_file_and_sql_backends_agree() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(b"date,amount\n2024-01-15,10\n2024-01-20,5\n2024-01-25,5\n2024-02-01,3\n")
            .unwrap();
        let datasource = Datasource {
            id: None,
            title: None,
            kind: DatasourceKind::File(FileLocation {
                file_path: file.path().to_path_buf(),
                extension: None,
            }),
            tables: Vec::new(),
        };
        let engine = AggregationEngine::new(EngineConfig::default()).with_today(d(2024, 2, 29));

        let cases = [
            (ColumnOperation::Sum, json!(20), json!(3)),
            (ColumnOperation::Average, json!("6.6666666666666667"), json!(3)),
            (ColumnOperation::Count, json!(3), json!(1)),
            (ColumnOperation::CountDistinct, json!(2), json!(1)),
        ];
        for (op, january, february) in cases {
            let ind = indicator(op, Some(d(2023, 12, 31)));
            let from_file = engine.run(&datasource, &ind, SyncMode::Full).await.unwrap();

            let mut adapter = ScriptedAdapter {
                recordset: recordset(&[(1, 2024, january), (2, 2024, february)]),
                ..Default::default()
            };
            let from_sql = engine
                .run_with_adapter(&mut adapter, &ind, SyncMode::Full)
                .await
                .unwrap();

            assert_eq!(from_file.len(), from_sql.len(), "{}", op);
            for (a, b) in from_file.iter().zip(&from_sql) {
                assert_eq!(a.date, b.date, "{}", op);
                let (a, b) = (a.value.unwrap(), b.value.unwrap());
                assert!((a - b).abs() < 1e-9, "{}: {} vs {}", op, a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_explicit_range_defaults_from_to_earliest() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(
            br#"[{"date": "2024-01-15", "amount": 10},
                 {"date": "2024-03-02", "amount": 4}]"#,
        )
        .unwrap();
        let request = AggregationRequest {
            datasource: Datasource {
                id: None,
                title: None,
                kind: DatasourceKind::File(FileLocation {
                    file_path: file.path().to_path_buf(),
                    extension: None,
                }),
                tables: vec!["main".to_string()],
            },
            indicator: indicator(ColumnOperation::Sum, Some(d(2024, 12, 31))),
            from: None,
            to: Some(d(2024, 2, 29)),
        };
        let engine = AggregationEngine::new(EngineConfig::default());
        let points = engine.aggregate(&request).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Some(10.0));
    }

    #[tokio::test]
    async fn test_discover_samples_first_table() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(b"date,amount\n2024-01-15,10\n2024-01-20,5\n2024-02-01,3\n")
            .unwrap();
        let datasource = Datasource {
            id: None,
            title: None,
            kind: DatasourceKind::File(FileLocation {
                file_path: file.path().to_path_buf(),
                extension: None,
            }),
            tables: Vec::new(),
        };
        let config = EngineConfig {
            row_limit: 2,
            ..EngineConfig::default()
        };
        let snapshot = AggregationEngine::new(config).discover(&datasource).await.unwrap();
        assert_eq!(snapshot.tables, vec!["main"]);
        assert_eq!(snapshot.sample.unwrap().rows.len(), 2);
    }
}
