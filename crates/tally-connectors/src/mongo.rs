//! Document-store adapter. Monthly aggregation runs as an aggregation
//! pipeline; the client is reused across calls until it fails or the
//! adapter is closed.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::{Client, Database};
use serde_json::Value;
use tally_core::month::parse_datetime;
use tally_core::normalize::{MONTH_ALIAS, RESULT_ALIAS, YEAR_ALIAS};
use tally_core::{
    AggregationSpec, ColumnMeta, ColumnOperation, DatabaseConnection, DateExtreme,
    RawAggregateRow, Result, TableData, TallyError, YearMonth,
};
use tracing::{debug, info};

use crate::binding::{connection_url, redacted, ConnectionSlot};
use crate::DataSourceAdapter;

const ENGINE: &str = "mongo";

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn bson_midnight(date: NaiveDate) -> BsonDateTime {
    let millis = date
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
        .timestamp_millis();
    BsonDateTime::from_millis(millis)
}

/// `$match` on the date range, `$group` by month and year, `$sort`
/// ascending. Distinct counts collect a set per bucket and project its
/// size.
pub fn aggregate_pipeline(spec: &AggregationSpec) -> Result<Vec<Document>> {
    let date = format!("${}", spec.date_column);
    let value = format!("${}", spec.value_column);

    let accumulator = match spec.operation {
        ColumnOperation::Average => doc! { "$avg": value.clone() },
        ColumnOperation::Sum => doc! { "$sum": value.clone() },
        ColumnOperation::Count => doc! {
            "$sum": { "$cond": [ { "$gt": [ value.clone(), Bson::Null ] }, 1, 0 ] }
        },
        ColumnOperation::CountDistinct => doc! { "$addToSet": value.clone() },
        ColumnOperation::CustomQuery => {
            return Err(TallyError::configuration(
                "custom queries are not supported for document stores",
            ))
        }
    };

    let mut range = Document::new();
    range.insert(
        spec.date_column.clone(),
        doc! {
            "$gte": bson_midnight(spec.range.from),
            "$lt": bson_midnight(spec.range.end_exclusive()),
        },
    );

    let mut group_key = Document::new();
    group_key.insert(MONTH_ALIAS, doc! { "$month": date.clone() });
    group_key.insert(YEAR_ALIAS, doc! { "$year": date });
    let mut group = Document::new();
    group.insert("_id", group_key);
    group.insert(RESULT_ALIAS, accumulator);

    let mut pipeline = vec![doc! { "$match": range }, doc! { "$group": group }];
    if spec.operation == ColumnOperation::CountDistinct {
        let mut size = Document::new();
        size.insert(RESULT_ALIAS, doc! { "$size": format!("${}", RESULT_ALIAS) });
        pipeline.push(doc! { "$project": size });
    }
    let mut sort = Document::new();
    sort.insert(format!("_id.{}", YEAR_ALIAS), 1);
    sort.insert(format!("_id.{}", MONTH_ALIAS), 1);
    pipeline.push(doc! { "$sort": sort });
    Ok(pipeline)
}

// ---------------------------------------------------------------------------
// BSON conversion
// ---------------------------------------------------------------------------

fn bson_datetime(dt: BsonDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
}

fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) if f.is_finite() => Some(*f),
        Bson::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// JSON rendering of a BSON cell; dates become RFC 3339 strings and ids
/// their hex form.
pub fn bson_value(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::DateTime(dt) => {
            bson_datetime(dt).map_or(Value::Null, |d| Value::String(d.to_rfc3339()))
        }
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Double(f) => Value::from(f),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        other => other.into_relaxed_extjson(),
    }
}

fn raw_row(doc: &Document, collection: &str) -> Result<RawAggregateRow> {
    let key = doc.get_document("_id").ok();
    let part = |alias: &str| key.and_then(|k| k.get(alias)).and_then(bson_f64);
    let period = match (part(YEAR_ALIAS), part(MONTH_ALIAS)) {
        (Some(y), Some(m)) => YearMonth::new(y as i32, m as u32),
        _ => None,
    }
    .ok_or_else(|| {
        TallyError::query(collection, format!("unexpected pipeline output {}", doc))
    })?;
    Ok(RawAggregateRow::new(
        period,
        doc.get(RESULT_ALIAS).and_then(bson_f64),
    ))
}

fn documents_to_table(docs: Vec<Document>) -> TableData {
    let columns: Vec<ColumnMeta> = docs
        .first()
        .map(|first| {
            first
                .iter()
                .filter(|(k, _)| k.as_str() != "_id")
                .map(|(k, v)| ColumnMeta::typed(k.clone(), format!("{:?}", v.element_type())))
                .collect()
        })
        .unwrap_or_default();
    let rows = docs
        .into_iter()
        .map(|mut doc| {
            columns
                .iter()
                .map(|c| doc.remove(&c.title).map_or(Value::Null, bson_value))
                .collect()
        })
        .collect();
    TableData::new(columns, rows)
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct MongoAdapter {
    params: DatabaseConnection,
    client: ConnectionSlot<Client>,
    collections: Option<Vec<String>>,
}

async fn connect(params: &DatabaseConnection) -> Result<Client> {
    let url = connection_url("mongodb", params).map_err(|e| TallyError::connection(ENGINE, e))?;
    info!("Connecting to {}", redacted(&url));
    let client = Client::with_uri_str(url.as_str())
        .await
        .map_err(|e| TallyError::connection(ENGINE, e))?;
    // The driver connects lazily; ping so bad hosts and credentials fail here.
    client
        .database(&params.database)
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(|e| TallyError::connection(ENGINE, e))?;
    Ok(client)
}

impl MongoAdapter {
    pub fn new(params: DatabaseConnection) -> Self {
        Self {
            params,
            client: ConnectionSlot::new(),
            collections: None,
        }
    }

    async fn database(&mut self) -> Result<Database> {
        let params = &self.params;
        let client = self.client.get_or_open(|| connect(params)).await?;
        Ok(client.database(&params.database))
    }

    /// Drop the client after a failed call and wrap the driver error.
    fn fail(&mut self, collection: &str, err: mongodb::error::Error) -> TallyError {
        self.client.invalidate();
        self.collections = None;
        TallyError::query(collection, err)
    }

    async fn collection_names(&mut self) -> Result<Vec<String>> {
        if let Some(names) = &self.collections {
            return Ok(names.clone());
        }
        let db = self.database().await?;
        let mut names: Vec<String> = match db.list_collection_names().await {
            Ok(names) => names,
            Err(e) => return Err(self.fail(&self.params.database.clone(), e)),
        };
        names.retain(|n| !n.starts_with("system."));
        names.sort();
        self.collections = Some(names.clone());
        Ok(names)
    }

    async fn ensure_collection(&mut self, collection: &str) -> Result<()> {
        if self.collection_names().await?.iter().any(|n| n == collection) {
            Ok(())
        } else {
            Err(TallyError::configuration(format!(
                "collection '{}' not found in database '{}'",
                collection, self.params.database
            )))
        }
    }

    async fn collect(
        &mut self,
        collection: &str,
        cursor: mongodb::error::Result<mongodb::Cursor<Document>>,
    ) -> Result<Vec<Document>> {
        let docs = match cursor {
            Ok(cursor) => cursor.try_collect::<Vec<Document>>().await,
            Err(e) => Err(e),
        };
        docs.map_err(|e| self.fail(collection, e))
    }
}

#[async_trait]
impl DataSourceAdapter for MongoAdapter {
    fn kind(&self) -> &'static str {
        ENGINE
    }

    async fn open(&mut self) -> Result<()> {
        self.database().await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.collections = None;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            debug!("Shut down mongo client for '{}'", self.params.database);
        }
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.collection_names().await
    }

    async fn table_rows(
        &mut self,
        table: &str,
        limit: usize,
        raw_query: Option<&str>,
    ) -> Result<TableData> {
        let filter = match raw_query.filter(|q| !q.trim().is_empty()) {
            Some(q) => Some(serde_json::from_str::<Document>(q).map_err(|e| {
                TallyError::configuration(format!("invalid filter for '{}': {}", table, e))
            })?),
            None => None,
        };
        self.ensure_collection(table).await?;
        let coll = self.database().await?.collection::<Document>(table);

        // An explicit filter replaces the row cap.
        let cursor = match filter {
            Some(filter) => coll.find(filter).await,
            None if limit > 0 => coll.find(doc! {}).limit(limit as i64).await,
            None => coll.find(doc! {}).await,
        };
        let docs = self.collect(table, cursor).await?;
        Ok(documents_to_table(docs))
    }

    async fn monthly_aggregate(&mut self, spec: &AggregationSpec) -> Result<Vec<RawAggregateRow>> {
        let pipeline = aggregate_pipeline(spec)?;
        if spec.range.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_collection(&spec.table).await?;
        debug!("mongo pipeline on '{}': {:?}", spec.table, pipeline);
        let coll = self.database().await?.collection::<Document>(&spec.table);
        let cursor = coll.aggregate(pipeline).await;
        let docs = self.collect(&spec.table, cursor).await?;
        docs.iter().map(|d| raw_row(d, &spec.table)).collect()
    }

    async fn extreme_date(
        &mut self,
        table: &str,
        date_column: &str,
        extreme: DateExtreme,
    ) -> Result<Option<YearMonth>> {
        self.ensure_collection(table).await?;
        let mut filter = Document::new();
        filter.insert(date_column, doc! { "$ne": Bson::Null });
        let mut sort = Document::new();
        sort.insert(
            date_column,
            match extreme {
                DateExtreme::Min => 1,
                DateExtreme::Max => -1,
            },
        );
        let coll = self.database().await?.collection::<Document>(table);
        let cursor = coll.find(filter).sort(sort).limit(1).await;
        let docs = self.collect(table, cursor).await?;
        let Some(value) = docs.first().and_then(|d| d.get(date_column)) else {
            return Ok(None);
        };
        let date = match value {
            Bson::DateTime(dt) => bson_datetime(*dt).map(|d| d.date_naive()),
            Bson::String(s) => parse_datetime(s).map(|d| d.date()),
            _ => None,
        };
        date.map(|d| Some(YearMonth::of(d))).ok_or_else(|| {
            TallyError::query(
                table,
                format!("field '{}' does not hold dates (got {})", date_column, value),
            )
        })
    }
}
