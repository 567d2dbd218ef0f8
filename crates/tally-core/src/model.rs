//! Indicator and datasource descriptors.
//!
//! These are the value objects an upstream caller hands to the engine.
//! They deserialize from the camelCase JSON shape the storage service
//! returns, so descriptor files can be fed straight to the CLI.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::month::DateRange;

/// Replaced by the dialect's inclusive date predicate on the date column.
pub const DATE_FILTER_PLACEHOLDER: &str = "${date_filter}";

/// Replaced by `<month> AS period_month, <year> AS period_year,`.
pub const GROUP_PREFIX_PLACEHOLDER: &str = "${date_group_prefix}";

/// Older spelling of [`DATE_FILTER_PLACEHOLDER`] found in stored templates.
pub const LEGACY_DATE_FILTER_PLACEHOLDER: &str = "${filtrofecha}";

/// Older spelling of [`GROUP_PREFIX_PLACEHOLDER`]; expands with the
/// `mes`/`anio` aliases those templates group by.
pub const LEGACY_GROUP_PREFIX_PLACEHOLDER: &str = "${prefijofiltrofecha}";

// ---------------------------------------------------------------------------
// Column operation
// ---------------------------------------------------------------------------

/// Reducer applied to the value column inside one month bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "OperationRepr")]
pub enum ColumnOperation {
    Average,
    Sum,
    Count,
    CountDistinct,
    CustomQuery,
}

/// Operations arrive either by name or by the numeric code the storage
/// service persists (1 = average ... 5 = custom query).
#[derive(Deserialize)]
#[serde(untagged)]
enum OperationRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<OperationRepr> for ColumnOperation {
    type Error = String;

    fn try_from(repr: OperationRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            OperationRepr::Code(code) => ColumnOperation::from_code(code)
                .ok_or_else(|| format!("unknown column operation code {}", code)),
            OperationRepr::Name(name) => name.parse(),
        }
    }
}

impl ColumnOperation {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ColumnOperation::Average),
            2 => Some(ColumnOperation::Sum),
            3 => Some(ColumnOperation::Count),
            4 => Some(ColumnOperation::CountDistinct),
            5 => Some(ColumnOperation::CustomQuery),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnOperation::Average => "AVERAGE",
            ColumnOperation::Sum => "SUM",
            ColumnOperation::Count => "COUNT",
            ColumnOperation::CountDistinct => "COUNT_DISTINCT",
            ColumnOperation::CustomQuery => "CUSTOM_QUERY",
        }
    }
}

impl std::str::FromStr for ColumnOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVERAGE" | "AVG" => Ok(ColumnOperation::Average),
            "SUM" => Ok(ColumnOperation::Sum),
            "COUNT" => Ok(ColumnOperation::Count),
            "COUNT_DISTINCT" => Ok(ColumnOperation::CountDistinct),
            "CUSTOM_QUERY" => Ok(ColumnOperation::CustomQuery),
            other => Err(format!("unknown column operation '{}'", other)),
        }
    }
}

impl fmt::Display for ColumnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Indicator
// ---------------------------------------------------------------------------

/// How an indicator is bound to its source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceBinding {
    #[serde(default)]
    pub datasource_id: Option<String>,
    pub table: String,
    pub date_column: String,
    #[serde(default)]
    pub value_column: String,
    pub column_operation: ColumnOperation,
    /// Custom query template, only meaningful for `CUSTOM_QUERY`.
    #[serde(default)]
    pub row_operation: Option<String>,
}

impl DatasourceBinding {
    /// Check the binding before any backend is touched.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(TallyError::configuration("indicator is not bound to a table"));
        }
        if self.date_column.trim().is_empty() {
            return Err(TallyError::configuration(format!(
                "indicator bound to '{}' has no date column",
                self.table
            )));
        }
        match self.column_operation {
            ColumnOperation::CustomQuery => {
                let template = self.row_operation.as_deref().unwrap_or("");
                validate_custom_template(template)
            }
            _ if self.value_column.trim().is_empty() => Err(TallyError::configuration(format!(
                "{} on '{}' needs a value column",
                self.column_operation, self.table
            ))),
            _ => Ok(()),
        }
    }
}

/// A custom query must carry both placeholders; running it without the date
/// filter or the month grouping would silently aggregate the wrong rows.
pub fn validate_custom_template(template: &str) -> Result<()> {
    if template.trim().is_empty() {
        return Err(TallyError::configuration(
            "CUSTOM_QUERY requires a query template",
        ));
    }
    if !template.contains(DATE_FILTER_PLACEHOLDER)
        && !template.contains(LEGACY_DATE_FILTER_PLACEHOLDER)
    {
        return Err(TallyError::configuration(format!(
            "custom query has no month filter; add {} to its WHERE clause",
            DATE_FILTER_PLACEHOLDER
        )));
    }
    if !template.contains(GROUP_PREFIX_PLACEHOLDER)
        && !template.contains(LEGACY_GROUP_PREFIX_PLACEHOLDER)
    {
        return Err(TallyError::configuration(format!(
            "custom query is not grouped by month; add {} at the start of its SELECT list",
            GROUP_PREFIX_PLACEHOLDER
        )));
    }
    Ok(())
}

/// A configured KPI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Indicator {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub customer_id: String,
    #[serde(default, with = "optional_date")]
    pub last_synced_date: Option<NaiveDate>,
    pub datasource: DatasourceBinding,
}

/// Accepts `2023-03-31` as well as full timestamps for `lastSyncedDate`.
/// The day is read in the timestamp's own offset.
mod optional_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDate>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDate>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => crate::month::parse_local_date(text)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{}'", text))),
        }
    }
}

// ---------------------------------------------------------------------------
// Datasource
// ---------------------------------------------------------------------------

/// Database engines the adapters can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Mysql,
    #[serde(alias = "sqlserver")]
    Mssql,
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mongodb")]
    Mongo,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Mysql => "mysql",
            Engine::Mssql => "mssql",
            Engine::Postgres => "postgres",
            Engine::Mongo => "mongo",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Mysql => 3306,
            Engine::Mssql => 1433,
            Engine::Postgres => 5432,
            Engine::Mongo => 27017,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a database-backed source.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnection {
    pub engine: Engine,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

impl DatabaseConnection {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }
}

impl fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "***" },
            )
            .field("database", &self.database)
            .finish()
    }
}

/// Flat-file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Json,
    Spreadsheet,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "csv" => Some(FileFormat::Csv),
            "json" => Some(FileFormat::Json),
            "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => Some(FileFormat::Spreadsheet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
            FileFormat::Spreadsheet => "spreadsheet",
        }
    }
}

/// Location of a file-backed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub file_path: PathBuf,
    /// Explicit extension; falls back to the path's own extension.
    #[serde(default)]
    pub extension: Option<String>,
}

impl FileLocation {
    pub fn format(&self) -> Result<FileFormat> {
        let ext = match self.extension.as_deref() {
            Some(ext) if !ext.trim().is_empty() => ext.to_string(),
            _ => self
                .file_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string(),
        };
        FileFormat::from_extension(&ext).ok_or_else(|| {
            TallyError::configuration(format!(
                "unsupported file extension '{}' for {}",
                ext,
                self.file_path.display()
            ))
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatasourceKind {
    Database(DatabaseConnection),
    File(FileLocation),
}

/// A connection descriptor. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(flatten)]
    pub kind: DatasourceKind,
    /// Table list captured when the source was discovered.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl Datasource {
    /// Short label used in logs and connection errors.
    pub fn engine_label(&self) -> String {
        match &self.kind {
            DatasourceKind::Database(db) => db.engine.to_string(),
            DatasourceKind::File(file) => match file.format() {
                Ok(format) => format!("{} file", format.as_str()),
                Err(_) => "file".to_string(),
            },
        }
    }

    /// Whether `table` may be bound by an indicator. An empty table list
    /// means the source was never discovered, so nothing is rejected.
    pub fn allows_table(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Run mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
    /// Resume from the last synced month (or backfill from the first record).
    Full,
    /// Only the month of the latest record; ignores the sync state.
    Preview,
}

/// Direction of a date probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DateExtreme {
    Min,
    Max,
}

/// Everything a backend needs to compute one monthly series.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub table: String,
    pub date_column: String,
    pub value_column: String,
    pub operation: ColumnOperation,
    pub row_operation: Option<String>,
    pub range: DateRange,
}

impl AggregationSpec {
    pub fn from_binding(binding: &DatasourceBinding, range: DateRange) -> Self {
        Self {
            table: binding.table.clone(),
            date_column: binding.date_column.clone(),
            value_column: binding.value_column.clone(),
            operation: binding.column_operation,
            row_operation: binding.row_operation.clone(),
            range,
        }
    }
}

/// One month of an indicator series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorDataPoint {
    pub indicator_id: String,
    pub customer_id: String,
    pub value: Option<f64>,
    /// Last instant of the month the value belongs to.
    pub date: DateTime<Utc>,
}
