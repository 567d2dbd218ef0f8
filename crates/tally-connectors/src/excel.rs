//! Spreadsheet reader (xls, xlsx, xlsm, xlsb, ods) via calamine. Every
//! worksheet is a table.

use std::path::Path;

use anyhow::Context;
use calamine::{open_workbook_auto, Data, Range, Reader};
use serde_json::Value;
use tally_core::TableData;

use crate::file::finish_table;

pub fn read_workbook(path: &Path) -> anyhow::Result<Vec<(String, TableData)>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook
            .worksheet_range(&name)
            .with_context(|| format!("failed to read sheet '{}'", name))?;
        sheets.push((name, sheet_table(&range)));
    }
    Ok(sheets)
}

fn cell(data: &Data) -> Value {
    match data {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => Value::from(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => dt.as_datetime().map_or(Value::Null, |d| {
            Value::String(d.format("%Y-%m-%dT%H:%M:%S").to_string())
        }),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
    }
}

fn title(data: &Data) -> String {
    match cell(data) {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Header from the first non-empty row, data from the rows after it.
pub fn sheet_table(range: &Range<Data>) -> TableData {
    let mut rows = range.rows().skip_while(|r| r.iter().all(|c| cell(c).is_null()));
    let Some(header) = rows.next() else {
        return TableData::default();
    };
    let mut titles: Vec<String> = header.iter().map(title).collect();
    while titles.last().is_some_and(|t| t.is_empty()) {
        titles.pop();
    }
    let width = titles.len();

    let data = rows
        .map(|r| {
            let mut row: Vec<Value> = r.iter().take(width.max(1)).map(cell).collect();
            while row.last().is_some_and(Value::is_null) {
                row.pop();
            }
            row
        })
        .filter(|r| !r.is_empty())
        .collect();
    finish_table(titles, data)
}
