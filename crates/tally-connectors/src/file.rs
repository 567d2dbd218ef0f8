//! Flat-file adapter. The file is parsed once per session into named
//! tables and reduced in memory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::month::cell_date;
use tally_core::reduce::extreme_month;
use tally_core::{
    AggregationSpec, ColumnMeta, DateExtreme, FileFormat, FileLocation, RawAggregateRow,
    ReductionPlan, Result, TableData, TallyError, YearMonth,
};
use tracing::{debug, info};

use crate::binding::ConnectionSlot;
use crate::config::EngineConfig;
use crate::csv_file::read_csv;
use crate::excel::read_workbook;
use crate::json_file::read_json;
use crate::DataSourceAdapter;

/// Build a table from a header row and data rows. Blank titles are named
/// by position. Rows arrive without trailing empty cells, so a final
/// one-cell row under a wider header is a footer and gets dropped, unless
/// that cell is a date: then it is a dated record with blank values.
pub fn finish_table(titles: Vec<String>, mut rows: Vec<Vec<Value>>) -> TableData {
    let is_footer = |row: &Vec<Value>| row.len() == 1 && cell_date(&row[0]).is_none();
    if titles.len() > 1 && rows.last().is_some_and(is_footer) {
        rows.pop();
    }
    let columns = titles
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            if t.is_empty() {
                ColumnMeta::new(format!("column_{}", i + 1))
            } else {
                ColumnMeta::new(t)
            }
        })
        .collect();
    TableData::new(columns, rows)
}

/// Tables of a parsed file, in document order.
#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub tables: Vec<(String, TableData)>,
}

impl ParsedDocument {
    /// Exact name first, then trimmed case-insensitive.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|(n, _)| n == name).or_else(|| {
            self.tables
                .iter()
                .position(|(n, _)| n.trim().eq_ignore_ascii_case(name.trim()))
        })
    }

    pub fn table(&self, name: &str) -> Option<&TableData> {
        self.position(name).map(|i| &self.tables[i].1)
    }
}

async fn parse(path: PathBuf, format: FileFormat, file_table: String) -> Result<Arc<ParsedDocument>> {
    let label = format!("{} file", format.as_str());
    tokio::fs::metadata(&path)
        .await
        .map_err(|e| TallyError::connection(label.as_str(), format!("{}: {}", path.display(), e)))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let shown = path.display().to_string();
    let parsed = tokio::task::spawn_blocking(move || -> anyhow::Result<ParsedDocument> {
        let tables = match format {
            FileFormat::Csv => vec![(file_table, read_csv(&path)?)],
            FileFormat::Json => vec![(file_table, read_json(&path)?)],
            FileFormat::Spreadsheet => read_workbook(&path)?,
        };
        Ok(ParsedDocument { tables })
    })
    .await
    .map_err(|e| TallyError::connection(label.as_str(), e))?
    .map_err(|e| TallyError::query(name, format!("{:#}", e)))?;

    info!("Parsed {} into {} table(s)", shown, parsed.tables.len());
    Ok(Arc::new(parsed))
}

/// Adapter over a CSV, JSON or spreadsheet file.
pub struct FileAdapter {
    location: FileLocation,
    format: FileFormat,
    file_table: String,
    document: ConnectionSlot<Arc<ParsedDocument>>,
}

impl FileAdapter {
    pub fn new(location: FileLocation, config: &EngineConfig) -> Result<Self> {
        let format = location.format()?;
        Ok(Self {
            location,
            format,
            file_table: config.file_table.clone(),
            document: ConnectionSlot::new(),
        })
    }

    async fn document(&mut self) -> Result<Arc<ParsedDocument>> {
        let path = self.location.file_path.clone();
        let format = self.format;
        let file_table = self.file_table.clone();
        let doc = self
            .document
            .get_or_open(|| parse(path, format, file_table))
            .await?;
        Ok(Arc::clone(doc))
    }

    async fn table(&mut self, name: &str) -> Result<(Arc<ParsedDocument>, usize)> {
        let doc = self.document().await?;
        match doc.position(name) {
            Some(idx) => Ok((doc, idx)),
            None => {
                let err = TallyError::configuration(format!(
                    "table '{}' not found in {}",
                    name,
                    self.location.file_path.display()
                ));
                Err(self.discard(err))
            }
        }
    }

    /// Release the parsed document after a failed call; the next call
    /// parses the file again.
    fn discard(&mut self, err: TallyError) -> TallyError {
        if self.document.is_open() {
            debug!(
                "Discarding parsed {} after error: {}",
                self.location.file_path.display(),
                err
            );
        }
        self.document.invalidate();
        err
    }
}

#[async_trait]
impl DataSourceAdapter for FileAdapter {
    fn kind(&self) -> &'static str {
        self.format.as_str()
    }

    async fn open(&mut self) -> Result<()> {
        self.document().await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        if self.document.take().is_some() {
            debug!("Released parsed {}", self.location.file_path.display());
        }
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let doc = self.document().await?;
        Ok(doc.tables.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn table_rows(
        &mut self,
        table: &str,
        limit: usize,
        raw_query: Option<&str>,
    ) -> Result<TableData> {
        if raw_query.is_some_and(|q| !q.trim().is_empty()) {
            return Err(TallyError::configuration(format!(
                "{} sources do not accept queries",
                self.format.as_str()
            )));
        }
        let (doc, idx) = self.table(table).await?;
        let mut data = doc.tables[idx].1.clone();
        data.truncate(limit);
        Ok(data)
    }

    async fn monthly_aggregate(&mut self, spec: &AggregationSpec) -> Result<Vec<RawAggregateRow>> {
        let plan = ReductionPlan::from_spec(spec)?;
        if spec.range.is_empty() {
            return Ok(Vec::new());
        }
        let (doc, idx) = self.table(&spec.table).await?;
        debug!(
            "Reducing {} rows of '{}' over {}",
            doc.tables[idx].1.rows.len(),
            spec.table,
            spec.range
        );
        plan.reduce(&spec.table, &doc.tables[idx].1)
            .map_err(|e| self.discard(e))
    }

    async fn extreme_date(
        &mut self,
        table: &str,
        date_column: &str,
        extreme: DateExtreme,
    ) -> Result<Option<YearMonth>> {
        let (doc, idx) = self.table(table).await?;
        extreme_month(table, &doc.tables[idx].1, date_column, extreme)
            .map_err(|e| self.discard(e))
    }
}
