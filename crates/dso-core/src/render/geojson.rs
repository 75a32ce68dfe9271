//! GeoJSON rendering.
//!
//! Rows become Features: the main geometry column (already transformed to the
//! response CRS by the SELECT) is the geometry, every other readable field
//! lands in `properties`. No pagination by default; the `_links` trailer
//! carries the paging hrefs when an explicit page size was requested.

use serde_json::{json, Map, Value};

use dso_error::{ApiError, Result};

use crate::crs::Crs;
use crate::db::Prefetcher;
use crate::serialize::{RenderContext, Serializer};

use super::{spawn_byte_stream, ByteSink, ByteStream, RenderJob};

/// Render the listing as a streamed GeoJSON FeatureCollection.
#[must_use]
pub fn render_list(job: RenderJob, crs: Crs) -> ByteStream {
    spawn_byte_stream(move |sink| async move { stream_geojson(&job, crs, &sink).await })
}

async fn stream_geojson(job: &RenderJob, crs: Crs, sink: &ByteSink) -> Result<()> {
    let snapshot = job.snapshot.clone();
    let dataset = snapshot
        .dataset(&job.dataset_id)
        .ok_or_else(|| ApiError::not_found("dataset vanished during reload"))?;
    let table = dataset
        .table(&job.table_id)
        .ok_or_else(|| ApiError::not_found("table vanished during reload"))?;
    let geometry_field = table
        .main_geometry_field()
        .map(|f| f.id.clone())
        .unwrap_or_default();

    let ctx = RenderContext {
        snapshot: &snapshot,
        user: &job.user,
        base_url: job.base_url.clone(),
        version: job.version.clone(),
    };
    let serializer = Serializer::new(&ctx, dataset, table, Vec::new());
    let prefetcher = Prefetcher::new(
        &snapshot,
        &job.user,
        &job.executor,
        &job.cache,
        job.options.clone(),
        job.raw_params.clone(),
    );

    let crs_object = json!({
        "type": "name",
        "properties": {"name": format!("urn:ogc:def:crs:EPSG::{}", crs.srid())},
    });
    sink.send(format!(
        "{{\"type\":\"FeatureCollection\",\"crs\":{},\"features\":[",
        serde_json::to_string(&crs_object).map_err(|e| ApiError::internal(e.to_string()))?
    ))
    .await?;

    let mut first = true;
    let mut truncated = false;
    let mut cursor = job.open_cursor().await?;
    let page_size = job.plan.pagination.page_size as usize;
    let mut emitted = 0usize;
    let mut has_next = false;
    'outer: while let Some(chunk) = cursor.next_chunk().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Close the envelope; no error body after headers.
                tracing::error!(error = %e, "cursor failed mid-stream");
                truncated = true;
                break;
            }
        };
        let data_rows = prefetcher
            .attach(dataset, table, &job.plan.prefetch, chunk)
            .await?;
        for row in &data_rows {
            if job.plan.pagination.enabled && emitted >= page_size {
                has_next = true;
                break 'outer;
            }
            let feature = feature_for(&serializer, &geometry_field, row);
            let prefix = if first { "" } else { "," };
            first = false;
            sink.send(format!(
                "{prefix}{}",
                serde_json::to_string(&feature).map_err(|e| ApiError::internal(e.to_string()))?
            ))
            .await?;
            emitted += 1;
        }
    }

    let mut links = vec![json!({"rel": "self", "href": job.self_url})];
    if has_next && !truncated {
        links.push(json!({
            "rel": "next",
            "href": job.url_for_page(job.plan.pagination.page + 1),
        }));
    }
    sink.send(format!(
        "],\"_links\":{}}}",
        serde_json::to_string(&links).map_err(|e| ApiError::internal(e.to_string()))?
    ))
    .await?;
    Ok(())
}

fn feature_for(
    serializer: &Serializer<'_>,
    geometry_field: &str,
    row: &crate::db::DataRow,
) -> Value {
    let rendered = serializer.render_row(row);

    let mut properties = Map::new();
    let mut geometry = Value::Null;
    let mut id = Value::Null;
    if let Value::Object(object) = rendered {
        for (key, value) in object {
            if key == "_links" {
                if let Some(self_id) = value.pointer("/self/title") {
                    id = self_id.clone();
                }
                continue;
            }
            if key == geometry_field {
                geometry = value;
                continue;
            }
            properties.insert(key, value);
        }
    }

    json!({
        "type": "Feature",
        "id": id,
        "geometry": geometry,
        "properties": Value::Object(properties),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_urn_format() {
        let crs = Crs::Wgs84;
        assert_eq!(
            format!("urn:ogc:def:crs:EPSG::{}", crs.srid()),
            "urn:ogc:def:crs:EPSG::4326"
        );
    }
}
