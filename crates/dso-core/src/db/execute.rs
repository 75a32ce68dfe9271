//! Query execution with chunked, cancellable row streaming.
//!
//! Rows decode into a schema-tagged map (`field id → JSON value`); no types
//! are generated per dataset. The cursor is driven by a background task that
//! feeds bounded chunks into a channel, so memory stays flat for large result
//! sets and a dropped receiver (client disconnect) cancels the cursor.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::Pool;
use futures::StreamExt;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;

use dso_error::{ApiError, Result};

use crate::plan::{QueryPlan, SelectExpr, SqlQuery};
use crate::schema::FieldKind;

/// Rows per streamed chunk; prefetches batch at this granularity too.
pub const CHUNK_SIZE: usize = 256;

/// One decoded row: selected column values keyed by field id.
pub type Row = IndexMap<String, Value>;

/// A row with its prefetched relations attached.
#[derive(Debug, Clone, Default)]
pub struct DataRow {
    pub values: Row,
    /// Related rows keyed by the relation field id.
    pub embedded: HashMap<String, Vec<DataRow>>,
    /// Row counts for summary relations, keyed by relation id.
    pub summary_counts: HashMap<String, i64>,
}

impl DataRow {
    #[must_use]
    pub fn new(values: Row) -> Self {
        Self {
            values,
            embedded: HashMap::new(),
            summary_counts: HashMap::new(),
        }
    }
}

/// Decodes backend tuples by switching on the schema descriptor per column.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    columns: Vec<(String, FieldKind, bool)>,
}

impl RowDecoder {
    /// Build a decoder for the plan's SELECT list.
    #[must_use]
    pub fn from_plan(plan: &QueryPlan) -> Self {
        let columns = plan
            .selected
            .iter()
            .map(|sel| {
                let is_geojson = matches!(sel.expr, SelectExpr::GeoJson { .. });
                (sel.field_id.clone(), sel.kind, is_geojson)
            })
            .collect();
        Self { columns }
    }

    /// Decode one backend row.
    ///
    /// # Errors
    ///
    /// `Database` when a column's wire type does not match the schema.
    pub fn decode(&self, row: &tokio_postgres::Row) -> Result<Row> {
        let mut values = Row::with_capacity(self.columns.len());
        for (idx, (field_id, kind, is_geojson)) in self.columns.iter().enumerate() {
            let value = if *is_geojson {
                decode_geojson(row, idx)?
            } else {
                decode_value(row, idx, *kind)?
            };
            values.insert(field_id.clone(), value);
        }
        Ok(values)
    }
}

fn db_err(field: usize, e: &tokio_postgres::Error) -> ApiError {
    ApiError::database(format!("cannot decode column {field}: {e}"))
}

fn decode_geojson(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let raw: Option<String> = row.try_get(idx).map_err(|e| db_err(idx, &e))?;
    match raw {
        None => Ok(Value::Null),
        Some(geojson) => serde_json::from_str(&geojson)
            .map_err(|e| ApiError::database(format!("invalid GeoJSON from backend: {e}"))),
    }
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, kind: FieldKind) -> Result<Value> {
    let value = match kind {
        FieldKind::Boolean => row
            .try_get::<_, Option<bool>>(idx)
            .map_err(|e| db_err(idx, &e))?
            .map_or(Value::Null, Value::Bool),

        FieldKind::Integer => {
            // Accept both int4 and int8 backing columns.
            if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
                v.map_or(Value::Null, |n| Value::Number(n.into()))
            } else {
                row.try_get::<_, Option<i32>>(idx)
                    .map_err(|e| db_err(idx, &e))?
                    .map_or(Value::Null, |n| Value::Number(n.into()))
            }
        }

        FieldKind::Number => {
            let v = if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
                v
            } else {
                row.try_get::<_, Option<f32>>(idx)
                    .map_err(|e| db_err(idx, &e))?
                    .map(f64::from)
            };
            v.and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
                .unwrap_or(Value::Null)
        }

        FieldKind::Date => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map_err(|e| db_err(idx, &e))?
            .map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string())),

        FieldKind::DateTime => {
            if let Ok(v) = row.try_get::<_, Option<DateTime<Utc>>>(idx) {
                v.map_or(Value::Null, |dt| Value::String(dt.to_rfc3339()))
            } else {
                row.try_get::<_, Option<NaiveDateTime>>(idx)
                    .map_err(|e| db_err(idx, &e))?
                    .map_or(Value::Null, |dt| {
                        Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
                    })
            }
        }

        FieldKind::Time => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .map_err(|e| db_err(idx, &e))?
            .map_or(Value::Null, |t| Value::String(t.format("%H:%M:%S").to_string())),

        FieldKind::Array => {
            if let Ok(v) = row.try_get::<_, Option<Vec<String>>>(idx) {
                v.map_or(Value::Null, |items| {
                    Value::Array(items.into_iter().map(Value::String).collect())
                })
            } else if let Ok(v) = row.try_get::<_, Option<Vec<i64>>>(idx) {
                v.map_or(Value::Null, |items| {
                    Value::Array(items.into_iter().map(|n| Value::Number(n.into())).collect())
                })
            } else {
                row.try_get::<_, Option<Value>>(idx)
                    .map_err(|e| db_err(idx, &e))?
                    .unwrap_or(Value::Null)
            }
        }

        FieldKind::Object => row
            .try_get::<_, Option<Value>>(idx)
            .map_err(|e| db_err(idx, &e))?
            .unwrap_or(Value::Null),

        // Strings, URIs and geometry-as-text.
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|e| db_err(idx, &e))?
            .map_or(Value::Null, Value::String),
    };
    Ok(value)
}

/// A bounded stream of decoded row chunks.
///
/// Dropping the stream cancels the driving task, which in turn drops the
/// backend cursor within one chunk.
pub struct RowChunkStream {
    rx: mpsc::Receiver<Result<Vec<Row>>>,
}

impl RowChunkStream {
    /// The next chunk, or `None` when the cursor is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<Row>>> {
        self.rx.recv().await
    }

    /// Drain the stream into memory. Prefetch batches use this; the main
    /// cursor should keep streaming instead.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            rows.extend(chunk?);
        }
        Ok(rows)
    }
}

/// Executes generated statements against the pool.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: Pool,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Run the statement and stream decoded rows in chunks.
    pub async fn stream(&self, query: SqlQuery, decoder: RowDecoder) -> Result<RowChunkStream> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ApiError::database(format!("no connection available: {e}")))?;

        let (tx, rx) = mpsc::channel::<Result<Vec<Row>>>(2);

        tokio::spawn(async move {
            let params: Vec<_> = query.params.iter().map(|p| p.as_pg()).collect();
            let row_stream = match client.query_raw(query.sql.as_str(), params).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(Err(ApiError::database(format!("query failed: {e}"))))
                        .await;
                    return;
                }
            };
            futures::pin_mut!(row_stream);

            let mut chunk: Vec<Row> = Vec::with_capacity(CHUNK_SIZE);
            while let Some(row) = row_stream.next().await {
                let decoded = match row {
                    Ok(row) => decoder.decode(&row),
                    Err(e) => Err(ApiError::database(format!("cursor failed: {e}"))),
                };
                match decoded {
                    Ok(values) => {
                        chunk.push(values);
                        if chunk.len() >= CHUNK_SIZE {
                            if tx.send(Ok(std::mem::take(&mut chunk))).await.is_err() {
                                // Receiver gone: client disconnected.
                                return;
                            }
                            chunk = Vec::with_capacity(CHUNK_SIZE);
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            if !chunk.is_empty() {
                let _ = tx.send(Ok(chunk)).await;
            }
        });

        Ok(RowChunkStream { rx })
    }

    /// Run a COUNT statement.
    pub async fn fetch_count(&self, query: SqlQuery) -> Result<i64> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ApiError::database(format!("no connection available: {e}")))?;
        let params: Vec<_> = query.params.iter().map(|p| p.as_pg()).collect();
        let row = client
            .query_one(query.sql.as_str(), &params)
            .await
            .map_err(|e| ApiError::database(format!("count query failed: {e}")))?;
        row.try_get(0)
            .map_err(|e| ApiError::database(format!("cannot decode count: {e}")))
    }

    /// Run a grouped COUNT (`SELECT key, COUNT(*) ... GROUP BY key`),
    /// returning counts keyed by the group value as text.
    pub async fn fetch_grouped_counts(
        &self,
        query: SqlQuery,
    ) -> Result<HashMap<String, i64>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ApiError::database(format!("no connection available: {e}")))?;
        let params: Vec<_> = query.params.iter().map(|p| p.as_pg()).collect();
        let rows = client
            .query(query.sql.as_str(), &params)
            .await
            .map_err(|e| ApiError::database(format!("count query failed: {e}")))?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get(0)
                .map_err(|e| ApiError::database(format!("cannot decode group key: {e}")))?;
            let count: i64 = row
                .try_get(1)
                .map_err(|e| ApiError::database(format!("cannot decode count: {e}")))?;
            counts.insert(key, count);
        }
        Ok(counts)
    }

    /// Run an MVT statement; `None` when the tile is empty.
    pub async fn fetch_tile(&self, query: SqlQuery) -> Result<Option<Vec<u8>>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ApiError::database(format!("no connection available: {e}")))?;
        let params: Vec<_> = query.params.iter().map(|p| p.as_pg()).collect();
        let rows = client
            .query(query.sql.as_str(), &params)
            .await
            .map_err(|e| ApiError::database(format!("tile query failed: {e}")))?;

        match rows.first() {
            None => Ok(None),
            Some(row) => {
                let tile: Option<Vec<u8>> = row
                    .try_get(0)
                    .map_err(|e| ApiError::database(format!("cannot decode tile: {e}")))?;
                Ok(tile.filter(|bytes| !bytes.is_empty()))
            }
        }
    }
}
