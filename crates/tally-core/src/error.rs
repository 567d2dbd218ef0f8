//! Typed errors shared by every Tally crate.

use thiserror::Error;

/// Errors surfaced to callers of the aggregation engine.
///
/// An empty result is not an error: zero matching rows or zero months in
/// range produce an empty series.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Transport or authentication failure while opening a backend.
    #[error("connection to {engine} failed: {message}")]
    Connection { engine: String, message: String },

    /// Malformed aggregation definition, unknown table or column.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend rejected or failed a query, or returned rows that
    /// could not be interpreted.
    #[error("query on '{table}' failed: {cause}")]
    Query { table: String, cause: String },
}

impl TallyError {
    pub fn connection(engine: impl Into<String>, message: impl std::fmt::Display) -> Self {
        TallyError::Connection {
            engine: engine.into(),
            message: message.to_string(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        TallyError::Configuration(message.into())
    }

    pub fn query(table: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        TallyError::Query {
            table: table.into(),
            cause: cause.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, TallyError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = TallyError::connection("mysql", "access denied");
        assert_eq!(err.to_string(), "connection to mysql failed: access denied");

        let err = TallyError::query("sales", "syntax error near 'FROM'");
        assert_eq!(
            err.to_string(),
            "query on 'sales' failed: syntax error near 'FROM'"
        );
    }

    #[test]
    fn test_is_configuration() {
        assert!(TallyError::configuration("bad").is_configuration());
        assert!(!TallyError::query("t", "x").is_configuration());
    }
}
