//! Tabular payload returned by every adapter's row fetch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column metadata. `data_type` is the backend's native type string when
/// the backend exposes one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub title: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl ColumnMeta {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            data_type: None,
        }
    }

    pub fn typed(title: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            data_type: Some(data_type.into()),
        }
    }
}

/// Column metadata plus row cells. Rows are positional and may be shorter
/// than `columns`; missing trailing cells read as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by title (exact match first, then trimmed and
    /// case-insensitive).
    pub fn column_index(&self, title: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.title == title)
            .or_else(|| {
                let wanted = title.trim();
                self.columns
                    .iter()
                    .position(|c| c.title.trim().eq_ignore_ascii_case(wanted))
            })
    }

    pub fn cell(&self, row: usize, column: usize) -> &Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&Value::Null)
    }

    /// Keep at most `limit` rows; `0` keeps everything.
    pub fn truncate(&mut self, limit: usize) {
        if limit > 0 {
            self.rows.truncate(limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TableData {
        TableData::new(
            vec![ColumnMeta::new("Date"), ColumnMeta::typed("amount", "int")],
            vec![
                vec![json!("2024-01-01"), json!(1)],
                vec![json!("2024-01-02")],
                vec![json!("2024-01-03"), json!(3)],
            ],
        )
    }

    #[test]
    fn test_column_index_falls_back_to_case_insensitive() {
        let t = sample();
        assert_eq!(t.column_index("amount"), Some(1));
        assert_eq!(t.column_index("date"), Some(0));
        assert_eq!(t.column_index("missing"), None);
    }

    #[test]
    fn test_short_rows_read_as_null() {
        let t = sample();
        assert_eq!(t.cell(1, 1), &Value::Null);
        assert_eq!(t.cell(9, 0), &Value::Null);
    }

    #[test]
    fn test_truncate_zero_keeps_all() {
        let mut t = sample();
        t.truncate(0);
        assert_eq!(t.rows.len(), 3);
        t.truncate(2);
        assert_eq!(t.rows.len(), 2);
    }

    #[test]
    fn test_serializes_type_key() {
        let json = serde_json::to_value(sample().columns).unwrap();
        assert_eq!(json, json!([{"title": "Date"}, {"title": "amount", "type": "int"}]));
    }
}
