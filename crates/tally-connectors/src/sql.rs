//! Relational adapter: MySQL and Postgres through sqlx, SQL Server through
//! tiberius. Aggregation is pushed down as a single GROUP BY statement.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use tally_core::month::cell_date;
use tally_core::normalize::rows_from_table;
use tally_core::{
    AggregationSpec, ColumnMeta, DatabaseConnection, DateExtreme, Engine, RawAggregateRow,
    Result, TableData, TallyError, YearMonth,
};
use tracing::{debug, info};

use crate::binding::{connection_url, redacted, ConnectionSlot};
use crate::config::EngineConfig;
use crate::mssql::{self, MssqlClient, MssqlTls};
use crate::query::SqlDialect;
use crate::DataSourceAdapter;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A live connection to one of the relational engines.
pub enum SqlConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    Mssql(Box<MssqlClient>),
}

impl SqlConnection {
    pub async fn connect(params: &DatabaseConnection, tls: MssqlTls) -> Result<Self> {
        let engine = params.engine;
        let fail = |e: &dyn std::fmt::Display| TallyError::connection(engine.as_str(), e);
        match engine {
            Engine::Mysql => {
                let url = connection_url("mysql", params).map_err(|e| fail(&e))?;
                info!("Connecting to {}", redacted(&url));
                let conn = MySqlConnection::connect(url.as_str())
                    .await
                    .map_err(|e| fail(&e))?;
                Ok(SqlConnection::MySql(conn))
            }
            Engine::Postgres => {
                let url = connection_url("postgres", params).map_err(|e| fail(&e))?;
                info!("Connecting to {}", redacted(&url));
                let conn = PgConnection::connect(url.as_str())
                    .await
                    .map_err(|e| fail(&e))?;
                Ok(SqlConnection::Postgres(conn))
            }
            Engine::Mssql => {
                info!(
                    "Connecting to mssql://{}:{}/{}",
                    params.host,
                    params.port_or_default(),
                    params.database
                );
                let client = mssql::connect(params, tls)
                    .await
                    .map_err(|e| fail(&format!("{:#}", e)))?;
                Ok(SqlConnection::Mssql(Box::new(client)))
            }
            Engine::Mongo => Err(TallyError::configuration(
                "mongo is a document store, not a SQL engine",
            )),
        }
    }

    pub async fn fetch(&mut self, sql: &str) -> anyhow::Result<TableData> {
        match self {
            SqlConnection::MySql(conn) => {
                let rows: Vec<MySqlRow> = sqlx::query(sql).fetch_all(&mut *conn).await?;
                Ok(table_from_rows(&rows, mysql_cell))
            }
            SqlConnection::Postgres(conn) => {
                let rows: Vec<PgRow> = sqlx::query(sql).fetch_all(&mut *conn).await?;
                Ok(table_from_rows(&rows, pg_cell))
            }
            SqlConnection::Mssql(client) => mssql::fetch(client, sql).await,
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        match self {
            SqlConnection::MySql(conn) => conn.close().await?,
            SqlConnection::Postgres(conn) => conn.close().await?,
            SqlConnection::Mssql(client) => client.close().await?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn table_from_rows<R: Row>(rows: &[R], cell: fn(&R, usize) -> Value) -> TableData {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| ColumnMeta::typed(c.name(), c.type_info().name()))
                .collect()
        })
        .unwrap_or_default();
    let data = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| cell(row, i)).collect())
        .collect();
    TableData::new(columns, data)
}

/// Try each Rust type in turn; sqlx rejects incompatible column types, so
/// the first type that decodes wins. NULL decodes on the first attempt.
macro_rules! decode_cell {
    ($row:expr, $idx:expr; $($ty:ty => $conv:expr),+ $(,)?) => {{
        $(
            if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
                return v.map_or(Value::Null, $conv);
            }
        )+
        Value::Null
    }};
}

fn decimal_value(d: Decimal) -> Value {
    d.to_f64().map_or(Value::String(d.to_string()), Value::from)
}

fn datetime_value(dt: NaiveDateTime) -> Value {
    Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn date_value(d: NaiveDate) -> Value {
    Value::String(d.to_string())
}

fn time_value(t: NaiveTime) -> Value {
    Value::String(t.to_string())
}

fn utc_value(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339())
}

fn bytes_value(b: Vec<u8>) -> Value {
    Value::String(String::from_utf8_lossy(&b).into_owned())
}

fn mysql_cell(row: &MySqlRow, idx: usize) -> Value {
    decode_cell!(row, idx;
        i64 => Value::from,
        u64 => Value::from,
        f64 => Value::from,
        f32 => |f: f32| Value::from(f as f64),
        Decimal => decimal_value,
        NaiveDateTime => datetime_value,
        NaiveDate => date_value,
        DateTime<Utc> => utc_value,
        NaiveTime => time_value,
        String => Value::String,
        Value => |v: Value| v,
        Vec<u8> => bytes_value,
    )
}

fn pg_cell(row: &PgRow, idx: usize) -> Value {
    decode_cell!(row, idx;
        i16 => Value::from,
        i32 => Value::from,
        i64 => Value::from,
        f32 => |f: f32| Value::from(f as f64),
        f64 => Value::from,
        Decimal => decimal_value,
        bool => Value::Bool,
        NaiveDateTime => datetime_value,
        DateTime<Utc> => utc_value,
        NaiveDate => date_value,
        NaiveTime => time_value,
        String => Value::String,
        Value => |v: Value| v,
        Vec<u8> => bytes_value,
    )
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for MySQL, Postgres and SQL Server databases.
pub struct SqlAdapter {
    params: DatabaseConnection,
    dialect: SqlDialect,
    tls: MssqlTls,
    conn: ConnectionSlot<SqlConnection>,
}

impl SqlAdapter {
    pub fn new(params: DatabaseConnection, config: &EngineConfig) -> Result<Self> {
        let dialect = SqlDialect::for_engine(params.engine).ok_or_else(|| {
            TallyError::configuration(format!("{} has no SQL dialect", params.engine))
        })?;
        Ok(Self {
            params,
            dialect,
            tls: MssqlTls {
                encrypt: config.mssql_encrypt,
                trust_cert: config.mssql_trust_cert,
            },
            conn: ConnectionSlot::new(),
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn connection(&mut self) -> Result<&mut SqlConnection> {
        let params = &self.params;
        let tls = self.tls;
        self.conn
            .get_or_open(|| SqlConnection::connect(params, tls))
            .await
    }

    /// Execute `sql`, labelling failures with `table`.
    async fn run(&mut self, table: &str, sql: &str) -> Result<TableData> {
        debug!("{} query: {}", self.params.engine, sql);
        let conn = self.connection().await?;
        conn.fetch(sql)
            .await
            .map_err(|e| TallyError::query(table, format!("{:#}", e)))
    }
}

fn first_column_strings(data: &TableData) -> Vec<String> {
    data.rows
        .iter()
        .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[async_trait]
impl DataSourceAdapter for SqlAdapter {
    fn kind(&self) -> &'static str {
        self.params.engine.as_str()
    }

    async fn open(&mut self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| TallyError::connection(self.params.engine.as_str(), e))?;
            debug!("Closed {} connection", self.params.engine);
        }
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let database = self.params.database.clone();
        let sql = self.dialect.list_tables(&database);
        let data = self.run(&database, &sql).await?;
        Ok(first_column_strings(&data))
    }

    async fn table_rows(
        &mut self,
        table: &str,
        limit: usize,
        raw_query: Option<&str>,
    ) -> Result<TableData> {
        if let Some(sql) = raw_query.filter(|q| !q.trim().is_empty()) {
            return self.run(table, sql).await;
        }

        let database = self.params.database.clone();
        let meta_sql = self.dialect.table_columns(&database, table);
        let meta = self.run(table, &meta_sql).await?;
        if meta.rows.is_empty() {
            return Err(TallyError::configuration(format!(
                "table '{}' not found in database '{}'",
                table, database
            )));
        }
        let columns = meta
            .rows
            .iter()
            .map(|r| ColumnMeta {
                title: r.first().and_then(Value::as_str).unwrap_or_default().to_string(),
                data_type: r.get(1).and_then(Value::as_str).map(str::to_string),
            })
            .collect();

        let rows_sql = self.dialect.table_rows(table, limit);
        let data = self.run(table, &rows_sql).await?;
        Ok(TableData::new(columns, data.rows))
    }

    async fn monthly_aggregate(&mut self, spec: &AggregationSpec) -> Result<Vec<RawAggregateRow>> {
        // Built before connecting so a bad template never reaches the server.
        let sql = self.dialect.monthly_aggregate(spec)?;
        if spec.range.is_empty() {
            return Ok(Vec::new());
        }
        let data = self.run(&spec.table, &sql).await?;
        rows_from_table(&data, &spec.table)
    }

    async fn extreme_date(
        &mut self,
        table: &str,
        date_column: &str,
        extreme: DateExtreme,
    ) -> Result<Option<YearMonth>> {
        let sql = self.dialect.extreme_date(table, date_column, extreme);
        let data = self.run(table, &sql).await?;
        let Some(cell) = data.rows.first().and_then(|r| r.first()) else {
            return Ok(None);
        };
        cell_date(cell).map(YearMonth::of).map(Some).ok_or_else(|| {
            TallyError::query(
                table,
                format!("column '{}' does not hold dates (got {})", date_column, cell),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(engine: Engine) -> DatabaseConnection {
        DatabaseConnection {
            engine,
            host: "localhost".to_string(),
            port: None,
            user: "u".to_string(),
            password: "p".to_string(),
            database: "shop".to_string(),
        }
    }

    #[test]
    fn test_dialect_follows_engine() {
        let config = EngineConfig::default();
        let adapter = SqlAdapter::new(params(Engine::Mssql), &config).unwrap();
        assert_eq!(adapter.dialect(), SqlDialect::Mssql);
        assert_eq!(adapter.kind(), "mssql");
        assert!(adapter.tls.encrypt);
    }

    #[test]
    fn test_mongo_is_rejected() {
        let config = EngineConfig::default();
        assert!(SqlAdapter::new(params(Engine::Mongo), &config).is_err());
    }

    #[tokio::test]
    async fn test_bad_custom_query_fails_without_connecting() {
        use chrono::NaiveDate;
        use tally_core::{ColumnOperation, DateRange};

        // Port 1 on localhost refuses connections; reaching it would
        // surface a connection error instead of a configuration error.
        let mut p = params(Engine::Mysql);
        p.port = Some(1);
        let mut adapter = SqlAdapter::new(p, &EngineConfig::default()).unwrap();
        let spec = AggregationSpec {
            table: "orders".to_string(),
            date_column: "created_at".to_string(),
            value_column: String::new(),
            operation: ColumnOperation::CustomQuery,
            row_operation: Some("SELECT COUNT(*) AS result FROM orders".to_string()),
            range: DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            ),
        };
        let err = adapter.monthly_aggregate(&spec).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!adapter.conn.is_open());
    }

    #[test]
    fn test_decimal_value() {
        assert_eq!(decimal_value(Decimal::new(1550, 2)), Value::from(15.5));
    }
}
