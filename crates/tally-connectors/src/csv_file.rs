//! CSV reader: first non-empty record is the header.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use tally_core::TableData;

use crate::file::finish_table;

pub fn read_csv(path: &Path) -> anyhow::Result<TableData> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open CSV {}", path.display()))?;

    let mut headers: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<Value>> = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("CSV parse error at record {}", line + 1))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        match headers {
            None => {
                headers = Some(
                    record
                        .iter()
                        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
                        .collect(),
                );
            }
            Some(_) => rows.push(
                record
                    .iter()
                    .map(|f| {
                        if f.trim().is_empty() {
                            Value::Null
                        } else {
                            Value::String(f.to_string())
                        }
                    })
                    .collect(),
            ),
        }
    }

    Ok(finish_table(headers.unwrap_or_default(), rows))
}
