//! Engine configuration from environment variables.

use anyhow::{Context, Result};

/// Synthetic table name CSV and JSON sources expose.
pub const DEFAULT_FILE_TABLE: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows sampled by discovery and the default cap for row previews.
    pub row_limit: usize,
    /// Negotiate TLS with SQL Server.
    pub mssql_encrypt: bool,
    /// Accept the SQL Server certificate without validation.
    pub mssql_trust_cert: bool,
    /// Table name reported for single-table files.
    pub file_table: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_limit: 100,
            mssql_encrypt: true,
            mssql_trust_cert: false,
            file_table: DEFAULT_FILE_TABLE.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            row_limit: std::env::var("TALLY_ROW_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid TALLY_ROW_LIMIT")?,
            mssql_encrypt: std::env::var("TALLY_MSSQL_ENCRYPT")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid TALLY_MSSQL_ENCRYPT")?,
            mssql_trust_cert: std::env::var("TALLY_MSSQL_TRUST_CERT")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Invalid TALLY_MSSQL_TRUST_CERT")?,
            file_table: std::env::var("TALLY_FILE_TABLE")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILE_TABLE.to_string()),
        })
    }
}
