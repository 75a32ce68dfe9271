//! HAL-JSON rendering: the DSO paginated list envelope and detail objects.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use dso_error::{ApiError, Result};

use crate::db::{DataRow, Prefetcher, CHUNK_SIZE};
use crate::serialize::{RenderContext, Serializer};

use super::{spawn_byte_stream, ByteSink, ByteStream, RenderJob};

/// Render a paginated listing.
///
/// One page of rows (plus one peeked row for the `next` link) is fetched up
/// front; prefetches and serialization then run per chunk while bytes stream
/// out. The envelope is `{_links, _embedded: {<table>: [...], <expanded>:
/// [...]}, page}`.
#[must_use]
pub fn render_list(job: RenderJob) -> ByteStream {
    spawn_byte_stream(move |sink| async move { stream_list(&job, &sink).await })
}

async fn stream_list(job: &RenderJob, sink: &ByteSink) -> Result<()> {
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

    // Collect one page; the one extra row only drives the `next` link.
    let page_size = job.plan.pagination.page_size as usize;
    let mut rows = Vec::with_capacity(page_size.min(CHUNK_SIZE));
    let mut cursor = job.open_cursor().await?;
    let mut failed = false;
    while let Some(chunk) = cursor.next_chunk().await {
        match chunk {
            Ok(chunk) => rows.extend(chunk),
            Err(e) => {
                // Headers are out; close a well-formed envelope instead of
                // appending an error body.
                tracing::error!(error = %e, "cursor failed mid-stream");
                failed = true;
                break;
            }
        }
        if job.plan.pagination.enabled && rows.len() > page_size {
            break;
        }
    }

    let has_next = job.plan.pagination.enabled && rows.len() > page_size;
    if has_next {
        rows.truncate(page_size);
    }

    // Envelope head with pagination links.
    let links = page_links(job, has_next);
    sink.send(format!(
        "{{\"_links\":{},\"_embedded\":{{\"{}\":[",
        serde_json::to_string(&links).map_err(|e| ApiError::internal(e.to_string()))?,
        table.id
    ))
    .await?;

    // Stream rows chunk-wise, collecting expansion buckets along the way.
    let mut expanded: Vec<(String, Vec<Value>)> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut first = true;
    if !failed {
        for chunk in rows.chunks(CHUNK_SIZE) {
            let data_rows = prefetcher
                .attach(dataset, table, &job.plan.prefetch, chunk.to_vec())
                .await?;
            for row in &data_rows {
                let rendered = serializer.render_row(row);
                let prefix = if first { "" } else { "," };
                first = false;
                sink.send(format!(
                    "{prefix}{}",
                    serde_json::to_string(&rendered)
                        .map_err(|e| ApiError::internal(e.to_string()))?
                ))
                .await?;
                collect_embedded(&serializer, row, &mut expanded, &mut seen);
            }
        }
    }
    sink.send("]").await?;

    for (name, rows) in expanded {
        sink.send(format!(
            ",\"{name}\":{}",
            serde_json::to_string(&rows).map_err(|e| ApiError::internal(e.to_string()))?
        ))
        .await?;
    }

    let page = page_object(job);
    sink.send(format!(
        "}},\"page\":{}}}",
        serde_json::to_string(&page).map_err(|e| ApiError::internal(e.to_string()))?
    ))
    .await?;
    Ok(())
}

fn collect_embedded(
    serializer: &Serializer<'_>,
    row: &DataRow,
    expanded: &mut Vec<(String, Vec<Value>)>,
    seen: &mut HashSet<(String, String)>,
) {
    for (name, rendered_rows) in serializer.render_embedded(row) {
        let idx = match expanded.iter().position(|(n, _)| *n == name) {
            Some(idx) => idx,
            None => {
                expanded.push((name.clone(), Vec::new()));
                expanded.len() - 1
            }
        };
        for value in rendered_rows {
            let key = value
                .pointer("/_links/self/href")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if seen.insert((name.clone(), key)) {
                expanded[idx].1.push(value);
            }
        }
    }
}

fn page_links(job: &RenderJob, has_next: bool) -> Value {
    let mut links = Map::new();
    links.insert(
        "self".to_string(),
        json!({"href": job.self_url}),
    );
    if has_next {
        links.insert(
            "next".to_string(),
            json!({"href": job.url_for_page(job.plan.pagination.page + 1)}),
        );
    }
    if job.plan.pagination.page > 1 {
        links.insert(
            "previous".to_string(),
            json!({"href": job.url_for_page(job.plan.pagination.page - 1)}),
        );
    }
    Value::Object(links)
}

fn page_object(job: &RenderJob) -> Value {
    let mut page = Map::new();
    page.insert("number".to_string(), json!(job.plan.pagination.page));
    page.insert("size".to_string(), json!(job.plan.pagination.page_size));
    if let Some(total) = job.total_count {
        let size = job.plan.pagination.page_size.max(1);
        let total_pages = (total as u64).div_ceil(size);
        page.insert("totalElements".to_string(), json!(total));
        page.insert("totalPages".to_string(), json!(total_pages));
    }
    Value::Object(page)
}

/// Render a detail object: the serialized row with `_embedded` merged in.
///
/// # Errors
///
/// `NotFound` when the identifier matches no row.
pub async fn render_detail(job: RenderJob) -> Result<Value> {
    let snapshot = job.snapshot.clone();
    let dataset = snapshot
        .dataset(&job.dataset_id)
        .ok_or_else(|| ApiError::not_found("dataset vanished during reload"))?;
    let table = dataset
        .table(&job.table_id)
        .ok_or_else(|| ApiError::not_found("table vanished during reload"))?;

    let cursor = job.open_cursor().await?;
    let rows = cursor.collect_rows().await?;
    let Some(row) = rows.into_iter().next() else {
        return Err(ApiError::not_found("No record found matching the query"));
    };

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

    let data_rows = prefetcher
        .attach(dataset, table, &job.plan.prefetch, vec![row])
        .await?;
    let row = data_rows
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::internal("prefetch dropped the row"))?;

    let mut rendered = serializer.render_row(&row);
    let embedded = serializer.render_embedded(&row);
    if !embedded.is_empty() {
        let mut bucket = Map::new();
        for (name, rows) in embedded {
            // Detail embedding of a single forward relation is an object,
            // a to-many relation stays an array.
            let value = if rows.len() == 1
                && serializer
                    .table()
                    .field(&name)
                    .is_some_and(|f| f.relation.is_some())
            {
                rows.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::Array(rows)
            };
            bucket.insert(name, value);
        }
        if let Value::Object(object) = &mut rendered {
            object.insert("_embedded".to_string(), Value::Object(bucket));
        }
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_url(url: &str, page: u64) -> RenderJob {
        use crate::plan::{Pagination, QueryPlan};
        RenderJob {
            snapshot: std::sync::Arc::new(crate::schema::SchemaSnapshot::default()),
            user: crate::auth::UserScopes::default(),
            dataset_id: "d".into(),
            table_id: "t".into(),
            base_url: "http://testserver".into(),
            version: "v1".into(),
            executor: crate::db::QueryExecutor::new(
                crate::db::create_pool(&crate::db::DbConfig {
                    url: "postgres://u:p@localhost/d".into(),
                    pool_size: 1,
                })
                .expect("valid pool config"),
            ),
            cache: std::sync::Arc::new(crate::db::PrefetchCache::new(8)),
            options: crate::plan::PlannerOptions::default(),
            raw_params: Vec::new(),
            plan: QueryPlan {
                dataset_id: "d".into(),
                table_id: "t".into(),
                db_table: "d_t".into(),
                base_alias: "t".into(),
                selected: Vec::new(),
                identifier_columns: vec!["id".into()],
                joins: Vec::new(),
                where_terms: Vec::new(),
                order_by: Vec::new(),
                distinct: false,
                prefetch: Vec::new(),
                temporal: None,
                pagination: Pagination {
                    page,
                    page_size: 20,
                    count_requested: false,
                    enabled: true,
                },
            },
            self_url: url.to_string(),
            total_count: None,
        }
    }

    #[test]
    fn test_url_for_page_adds_and_replaces() {
        let job = job_with_url("http://t/v1/a/b/?x=1", 1);
        assert_eq!(job.url_for_page(2), "http://t/v1/a/b/?x=1&page=2");

        let job = job_with_url("http://t/v1/a/b/?page=3&x=1", 3);
        assert_eq!(job.url_for_page(2), "http://t/v1/a/b/?x=1&page=2");
        // Page 1 drops the parameter entirely.
        assert_eq!(job.url_for_page(1), "http://t/v1/a/b/?x=1");
    }

    #[test]
    fn test_page_links_shape() {
        let job = job_with_url("http://t/v1/a/b/?page=2", 2);
        let links = page_links(&job, true);
        assert!(links.get("next").is_some());
        assert!(links.get("previous").is_some());
        assert_eq!(links["self"]["href"], "http://t/v1/a/b/?page=2");

        let links = page_links(&job_with_url("http://t/v1/a/b/", 1), false);
        assert!(links.get("next").is_none());
        assert!(links.get("previous").is_none());
    }

    #[test]
    fn test_page_object_with_count() {
        let mut job = job_with_url("http://t/v1/a/b/", 1);
        job.total_count = Some(45);
        let page = page_object(&job);
        assert_eq!(page["totalElements"], 45);
        assert_eq!(page["totalPages"], 3);
        assert_eq!(page["number"], 1);
        assert_eq!(page["size"], 20);
    }
}
