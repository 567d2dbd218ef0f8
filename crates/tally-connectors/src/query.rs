//! SQL generation for the relational adapters.
//!
//! One builder serves every engine; the differences live in a [`Syntax`]
//! table per [`SqlDialect`] (identifier quoting, date literals, month/year
//! extraction, row caps, catalog queries). Identifiers and string literals
//! are escaped here because table, column and database names come from
//! user-edited descriptors and are interpolated into the statement text.

use chrono::NaiveDate;
use tally_core::model::{
    validate_custom_template, AggregationSpec, ColumnOperation, DateExtreme,
    DATE_FILTER_PLACEHOLDER, GROUP_PREFIX_PLACEHOLDER, LEGACY_DATE_FILTER_PLACEHOLDER,
    LEGACY_GROUP_PREFIX_PLACEHOLDER,
};
use tally_core::normalize::{
    LEGACY_MONTH_ALIAS, LEGACY_YEAR_ALIAS, MONTH_ALIAS, RESULT_ALIAS, YEAR_ALIAS,
};
use tally_core::{DateRange, Engine, Result, TallyError};

/// Alias of the single column returned by the extreme-date probe.
pub const EXTREME_DATE_ALIAS: &str = "extreme_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Mssql,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowCap {
    /// `SELECT ... LIMIT n`
    Limit,
    /// `SELECT TOP n ...`
    Top,
}

/// Per-engine syntax fragments. `{col}`, `{date}`, `{db}` and `{table}`
/// are substituted with already-escaped text.
struct Syntax {
    quote_open: char,
    quote_close: char,
    date_literal: &'static str,
    month_expr: &'static str,
    year_expr: &'static str,
    avg_operand: &'static str,
    row_cap: RowCap,
    /// Backslash is an escape character inside string literals.
    backslash_escapes: bool,
    list_tables: &'static str,
    table_columns: &'static str,
}

const MYSQL: Syntax = Syntax {
    quote_open: '`',
    quote_close: '`',
    date_literal: "STR_TO_DATE('{date}', '%Y-%m-%d')",
    month_expr: "MONTH({col})",
    year_expr: "YEAR({col})",
    avg_operand: "{col}",
    row_cap: RowCap::Limit,
    backslash_escapes: true,
    list_tables: "SELECT CAST(TABLE_NAME AS CHAR) AS table_name \
                  FROM information_schema.tables \
                  WHERE TABLE_SCHEMA = '{db}' AND TABLE_TYPE = 'BASE TABLE' \
                  ORDER BY TABLE_NAME",
    table_columns: "SELECT CAST(COLUMN_NAME AS CHAR) AS column_name, \
                    CAST(COLUMN_TYPE AS CHAR) AS data_type \
                    FROM information_schema.columns \
                    WHERE TABLE_SCHEMA = '{db}' AND TABLE_NAME = '{table}' \
                    ORDER BY ORDINAL_POSITION",
};

const MSSQL: Syntax = Syntax {
    quote_open: '[',
    quote_close: ']',
    date_literal: "CONVERT(date, '{date}', 23)",
    month_expr: "MONTH({col})",
    year_expr: "YEAR({col})",
    // AVG over an integer column truncates in SQL Server.
    avg_operand: "CAST({col} AS FLOAT)",
    row_cap: RowCap::Top,
    backslash_escapes: false,
    list_tables: "SELECT TABLE_NAME AS table_name \
                  FROM INFORMATION_SCHEMA.TABLES \
                  WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_CATALOG = '{db}' \
                  ORDER BY TABLE_NAME",
    table_columns: "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type \
                    FROM INFORMATION_SCHEMA.COLUMNS \
                    WHERE TABLE_CATALOG = '{db}' AND TABLE_NAME = '{table}' \
                    ORDER BY ORDINAL_POSITION",
};

const POSTGRES: Syntax = Syntax {
    quote_open: '"',
    quote_close: '"',
    date_literal: "DATE '{date}'",
    month_expr: "CAST(EXTRACT(MONTH FROM {col}) AS INTEGER)",
    year_expr: "CAST(EXTRACT(YEAR FROM {col}) AS INTEGER)",
    avg_operand: "{col}",
    row_cap: RowCap::Limit,
    backslash_escapes: false,
    list_tables: "SELECT table_name::text AS table_name \
                  FROM information_schema.tables \
                  WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                  AND table_catalog = '{db}' \
                  ORDER BY table_name",
    table_columns: "SELECT column_name::text AS column_name, data_type::text AS data_type \
                    FROM information_schema.columns \
                    WHERE table_schema = 'public' AND table_name = '{table}' \
                    ORDER BY ordinal_position",
};


impl SqlDialect {
    pub fn for_engine(engine: Engine) -> Option<Self> {
        match engine {
            Engine::Mysql => Some(SqlDialect::MySql),
            Engine::Mssql => Some(SqlDialect::Mssql),
            Engine::Postgres => Some(SqlDialect::Postgres),
            Engine::Mongo => None,
        }
    }

    fn syntax(&self) -> &'static Syntax {
        match self {
            SqlDialect::MySql => &MYSQL,
            SqlDialect::Mssql => &MSSQL,
            SqlDialect::Postgres => &POSTGRES,
        }
    }

    pub fn quote_ident(&self, name: &str) -> String {
        let s = self.syntax();
        let escaped = name.replace(s.quote_close, &format!("{0}{0}", s.quote_close));
        format!("{}{}{}", s.quote_open, escaped, s.quote_close)
    }

    pub fn date_literal(&self, date: NaiveDate) -> String {
        self.syntax()
            .date_literal
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
    }

    fn month_expr(&self, column: &str) -> String {
        self.syntax().month_expr.replace("{col}", &self.quote_ident(column))
    }

    fn year_expr(&self, column: &str) -> String {
        self.syntax().year_expr.replace("{col}", &self.quote_ident(column))
    }

    /// Inclusive day range on `column`, written as a half-open comparison
    /// so timestamps during the last day still match.
    pub fn date_filter(&self, column: &str, range: &DateRange) -> String {
        let col = self.quote_ident(column);
        format!(
            "{} >= {} AND {} < {}",
            col,
            self.date_literal(range.from),
            col,
            self.date_literal(range.end_exclusive())
        )
    }

    /// Leading select-list items that key a row by month and year.
    pub fn group_prefix(&self, column: &str) -> String {
        self.aliased_prefix(column, MONTH_ALIAS, YEAR_ALIAS)
    }

    fn aliased_prefix(&self, column: &str, month_alias: &str, year_alias: &str) -> String {
        format!(
            "{} AS {}, {} AS {},",
            self.month_expr(column),
            month_alias,
            self.year_expr(column),
            year_alias
        )
    }

    fn reducer_expr(&self, op: ColumnOperation, column: &str) -> Result<String> {
        let col = self.quote_ident(column);
        match op {
            ColumnOperation::Average => Ok(format!(
                "AVG({})",
                self.syntax().avg_operand.replace("{col}", &col)
            )),
            ColumnOperation::Sum => Ok(format!("SUM({})", col)),
            ColumnOperation::Count => Ok(format!("COUNT({})", col)),
            ColumnOperation::CountDistinct => Ok(format!("COUNT(DISTINCT {})", col)),
            ColumnOperation::CustomQuery => Err(TallyError::configuration(
                "custom queries are rendered from their template, not a reducer",
            )),
        }
    }

    /// Statement computing one row per month in `spec.range`.
    pub fn monthly_aggregate(&self, spec: &AggregationSpec) -> Result<String> {
        if spec.operation == ColumnOperation::CustomQuery {
            let template = spec.row_operation.as_deref().unwrap_or("");
            return self.render_custom_query(template, &spec.date_column, &spec.range);
        }
        let month = self.month_expr(&spec.date_column);
        let year = self.year_expr(&spec.date_column);
        Ok(format!(
            "SELECT {} {} AS {} FROM {} WHERE {} GROUP BY {}, {} ORDER BY {}, {}",
            self.group_prefix(&spec.date_column),
            self.reducer_expr(spec.operation, &spec.value_column)?,
            RESULT_ALIAS,
            self.quote_ident(&spec.table),
            self.date_filter(&spec.date_column, &spec.range),
            year,
            month,
            year,
            month
        ))
    }

    /// Substitute both placeholders of a custom query. Fails before any
    /// text is produced when either placeholder is missing. The older
    /// `${filtrofecha}` / `${prefijofiltrofecha}` pair is accepted too.
    pub fn render_custom_query(
        &self,
        template: &str,
        date_column: &str,
        range: &DateRange,
    ) -> Result<String> {
        validate_custom_template(template)?;
        let filter = self.date_filter(date_column, range);
        Ok(template
            .replace(DATE_FILTER_PLACEHOLDER, &filter)
            .replace(LEGACY_DATE_FILTER_PLACEHOLDER, &filter)
            .replace(GROUP_PREFIX_PLACEHOLDER, &self.group_prefix(date_column))
            .replace(
                LEGACY_GROUP_PREFIX_PLACEHOLDER,
                &self.aliased_prefix(date_column, LEGACY_MONTH_ALIAS, LEGACY_YEAR_ALIAS),
            ))
    }

    /// `SELECT *` capped at `limit` rows; `0` means uncapped.
    pub fn table_rows(&self, table: &str, limit: usize) -> String {
        let table = self.quote_ident(table);
        match (limit, self.syntax().row_cap) {
            (0, _) => format!("SELECT * FROM {}", table),
            (n, RowCap::Limit) => format!("SELECT * FROM {} LIMIT {}", table, n),
            (n, RowCap::Top) => format!("SELECT TOP {} * FROM {}", n, table),
        }
    }

    /// Single-row probe for the first or last non-null date.
    pub fn extreme_date(&self, table: &str, column: &str, extreme: DateExtreme) -> String {
        let col = self.quote_ident(column);
        let order = match extreme {
            DateExtreme::Min => "ASC",
            DateExtreme::Max => "DESC",
        };
        let (top, limit) = match self.syntax().row_cap {
            RowCap::Top => ("TOP 1 ", ""),
            RowCap::Limit => ("", " LIMIT 1"),
        };
        format!(
            "SELECT {}{} AS {} FROM {} WHERE {} IS NOT NULL ORDER BY {} {}{}",
            top,
            col,
            EXTREME_DATE_ALIAS,
            self.quote_ident(table),
            col,
            col,
            order,
            limit
        )
    }

    /// Body of a single-quoted string literal.
    fn sanitize_sql_string(&self, s: &str) -> String {
        let s = if self.syntax().backslash_escapes {
            s.replace('\\', "\\\\")
        } else {
            s.to_string()
        };
        s.replace('\'', "''")
    }

    /// Base tables of `database`, one `table_name` per row.
    pub fn list_tables(&self, database: &str) -> String {
        self.syntax()
            .list_tables
            .replace("{db}", &self.sanitize_sql_string(database))
    }

    /// `column_name` / `data_type` pairs for `table`, in declaration order.
    pub fn table_columns(&self, database: &str, table: &str) -> String {
        self.syntax()
            .table_columns
            .replace("{db}", &self.sanitize_sql_string(database))
            .replace("{table}", &self.sanitize_sql_string(table))
    }
}
