//! SQL Server transport over tiberius.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use tally_core::{ColumnMeta, DatabaseConnection, TableData};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

pub type MssqlClient = Client<Compat<TcpStream>>;

/// TLS settings for the TDS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MssqlTls {
    pub encrypt: bool,
    pub trust_cert: bool,
}

pub async fn connect(params: &DatabaseConnection, tls: MssqlTls) -> anyhow::Result<MssqlClient> {
    let mut config = Config::new();
    config.host(params.host.trim());
    config.port(params.port_or_default());
    config.database(&params.database);
    config.authentication(AuthMethod::sql_server(&params.user, &params.password));
    config.encryption(if tls.encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::NotSupported
    });
    if tls.trust_cert {
        config.trust_cert();
    }

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .with_context(|| format!("Failed to reach {}:{}", params.host, params.port_or_default()))?;
    tcp.set_nodelay(true)?;

    let client = Client::connect(config, tcp.compat_write())
        .await
        .context("TDS login failed")?;
    debug!("Connected to SQL Server database '{}'", params.database);
    Ok(client)
}

/// Run a statement and collect its first result set.
pub async fn fetch(client: &mut MssqlClient, sql: &str) -> anyhow::Result<TableData> {
    let mut stream = client.simple_query(sql).await?;
    let columns: Vec<ColumnMeta> = stream
        .columns()
        .await?
        .map(|cols| {
            cols.iter()
                .map(|c| ColumnMeta::typed(c.name(), format!("{:?}", c.column_type())))
                .collect()
        })
        .unwrap_or_default();
    let rows = stream
        .into_first_result()
        .await?
        .into_iter()
        .map(|row| row.into_iter().map(cell).collect())
        .collect();
    Ok(TableData::new(columns, rows))
}

fn cell(data: ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I16(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I32(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::F32(v) => v.map_or(Value::Null, |f| Value::from(f as f64)),
        ColumnData::F64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::from),
        ColumnData::String(v) => v.map_or(Value::Null, |s| Value::String(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v.map_or(Value::Null, |b| {
            Value::String(String::from_utf8_lossy(&b).into_owned())
        }),
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| {
            Value::from(n.value() as f64 / 10f64.powi(n.scale() as i32))
        }),
        d @ (ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_)) => {
            NaiveDateTime::from_sql(&d)
                .ok()
                .flatten()
                .map_or(Value::Null, |dt| {
                    Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                })
        }
        d @ ColumnData::Date(_) => NaiveDate::from_sql(&d)
            .ok()
            .flatten()
            .map_or(Value::Null, |date| Value::String(date.to_string())),
        d @ ColumnData::Time(_) => NaiveTime::from_sql(&d)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| Value::String(t.to_string())),
        d @ ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(&d)
            .ok()
            .flatten()
            .map_or(Value::Null, |dt| Value::String(dt.to_rfc3339())),
        _ => Value::Null,
    }
}
