//! CSV rendering.
//!
//! The header row uses capitalized field names (`Eigenaarnaam`, `Clusterid`);
//! expanded to-one relations flatten as `Relation.Field` columns. To-many
//! expansions cannot flatten and are silently skipped. There is no pagination
//! by default: the whole cursor streams out.

use serde_json::Value;

use dso_error::{ApiError, Result};

use crate::db::{DataRow, Prefetcher, Row};
use crate::schema::{Field, FieldKind};
use crate::serialize::{RenderContext, Serializer};

use super::{spawn_byte_stream, ByteSink, ByteStream, RenderJob};

/// Render the listing as streamed CSV.
#[must_use]
pub fn render_list(job: RenderJob) -> ByteStream {
    spawn_byte_stream(move |sink| async move { stream_csv(&job, &sink).await })
}

/// One flattened output column.
struct CsvColumn {
    header: String,
    /// Relation id when this column reads from an embedded to-one row.
    relation: Option<String>,
    field_id: String,
}

async fn stream_csv(job: &RenderJob, sink: &ByteSink) -> Result<()> {
    let snapshot = job.snapshot.clone();
    let dataset = snapshot
        .dataset(&job.dataset_id)
        .ok_or_else(|| ApiError::not_found("dataset vanished during reload"))?;
    let table = dataset
        .table(&job.table_id)
        .ok_or_else(|| ApiError::not_found("table vanished during reload"))?;

    let ctx = RenderContext {
        snapshot: &snapshot,
        user: &job.user,
        base_url: job.base_url.clone(),
        version: job.version.clone(),
    };
    let serializer = Serializer::new(&ctx, dataset, table, job.plan.prefetch.clone());
    let prefetcher = Prefetcher::new(
        &snapshot,
        &job.user,
        &job.executor,
        &job.cache,
        job.options.clone(),
        job.raw_params.clone(),
    );

    // Flattened columns: own fields first, then expanded to-one relations.
    let mut columns: Vec<CsvColumn> = serializer
        .flat_fields()
        .into_iter()
        .map(|field| CsvColumn {
            header: capitalize(&csv_field_name(field)),
            relation: None,
            field_id: field.id.clone(),
        })
        .collect();

    for name in &job.plan.prefetch {
        // Only singular forward relations flatten; M2M and reverse
        // expansions are skipped, never an error.
        let Some(field) = table.field(name).filter(|f| f.relation.is_some()) else {
            continue;
        };
        let Some(target) = field.related_table() else {
            continue;
        };
        let Some(target_table) = snapshot.table(&target.dataset, &target.table) else {
            continue;
        };
        for sub in &target_table.fields {
            if sub.is_relation() || sub.is_nested_table || sub.kind() == FieldKind::Object {
                continue;
            }
            columns.push(CsvColumn {
                header: format!("{}.{}", capitalize(name), capitalize(&sub.id)),
                relation: Some(name.clone()),
                field_id: sub.id.clone(),
            });
        }
    }

    let header: Vec<&str> = columns.iter().map(|c| c.header.as_str()).collect();
    sink.send(format!("{}\r\n", header.join(","))).await?;

    let mut cursor = job.open_cursor().await?;
    while let Some(chunk) = cursor.next_chunk().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // CSV has no closing envelope; stop at a row boundary.
                tracing::error!(error = %e, "cursor failed mid-stream");
                return Ok(());
            }
        };
        let data_rows = prefetcher
            .attach(dataset, table, &job.plan.prefetch, chunk)
            .await?;

        let mut buffer = String::new();
        for row in &data_rows {
            write_row(&mut buffer, &columns, row);
        }
        sink.send(buffer).await?;
    }
    Ok(())
}

fn write_row(buffer: &mut String, columns: &[CsvColumn], row: &DataRow) {
    let empty = Row::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            buffer.push(',');
        }
        let values = match &column.relation {
            None => &row.values,
            Some(relation) => row
                .embedded
                .get(relation)
                .and_then(|rows| rows.first())
                .map_or(&empty, |child| &child.values),
        };
        let value = values.get(&column.field_id).unwrap_or(&Value::Null);
        buffer.push_str(&escape(&cell_text(value)));
    }
    buffer.push_str("\r\n");
}

/// Relation fields export their FK column name (`cluster` → `clusterId`).
fn csv_field_name(field: &Field) -> String {
    if field.relation.is_some() {
        format!("{}Id", field.id)
    } else {
        field.id.clone()
    }
}

/// `eigenaarNaam` → `Eigenaarnaam`: first letter upper, the rest lower.
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
    })
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Arrays and geometry objects export as compact JSON.
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn escape(text: &str) -> String {
    if text.contains(',') || text.contains('"') || text.contains('\n') || text.contains('\r') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
