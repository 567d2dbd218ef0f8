//! JSON reader: a top-level array of flat objects.

use std::path::Path;

use anyhow::{bail, Context};
use serde_json::Value;
use tally_core::{ColumnMeta, TableData};

pub fn read_json(path: &Path) -> anyhow::Result<TableData> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text).context("invalid JSON")?;
    let Value::Array(items) = value else {
        bail!("expected a JSON array of objects");
    };

    // Columns are the union of keys, in first-seen order.
    let mut titles: Vec<String> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let Value::Object(obj) = item else {
            bail!("element {} is not an object", i);
        };
        for key in obj.keys() {
            if !titles.iter().any(|t| t == key) {
                titles.push(key.clone());
            }
        }
    }

    let rows = items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut obj) => titles
                .iter()
                .map(|t| obj.remove(t).unwrap_or(Value::Null))
                .collect(),
            _ => Vec::new(),
        })
        .collect();

    Ok(TableData::new(
        titles.into_iter().map(ColumnMeta::new).collect(),
        rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn json_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_array_of_objects() {
        let file = json_file(
            r#"[{"date": "2024-01-15", "amount": 10},
                {"date": "2024-02-01", "amount": 3, "note": "late"}]"#,
        );
        let table = read_json(file.path()).unwrap();
        assert_eq!(table.columns.len(), 3);
        let note = table.column_index("note").unwrap();
        let amount = table.column_index("amount").unwrap();
        assert_eq!(table.cell(0, note), &Value::Null);
        assert_eq!(table.cell(1, amount), &Value::from(3));
    }

    #[test]
    fn test_rejects_non_array() {
        let file = json_file(r#"{"date": "2024-01-15"}"#);
        assert!(read_json(file.path()).is_err());
    }

    #[test]
    fn test_rejects_scalar_elements() {
        let file = json_file(r#"[{"a": 1}, 2]"#);
        assert!(read_json(file.path()).is_err());
    }
}
