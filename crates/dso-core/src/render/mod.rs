//! Streaming output rendering.
//!
//! A renderer consumes the lazy row stream chunk by chunk: each chunk gets
//! its relation prefetches attached, every row passes through the serializer
//! tree, and the bytes go out through a bounded channel. Memory stays flat
//! regardless of result size, and a disconnected client tears the pipeline
//! down within one chunk.

pub mod csv;
pub mod geojson;
pub mod hal;
pub mod mvt;

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use dso_error::{ApiError, Result};

use crate::auth::UserScopes;
use crate::db::{PrefetchCache, QueryExecutor, RowDecoder};
use crate::plan::{PlannerOptions, QueryPlan, SqlGenerator};
use crate::schema::SchemaSnapshot;

/// The negotiated output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    HalJson,
    Csv,
    GeoJson,
}

impl OutputFormat {
    /// Negotiate from `?_format=` (which wins) or the Accept header.
    ///
    /// # Errors
    ///
    /// `NotAcceptable` for an unknown `?_format=` value.
    pub fn negotiate(format_param: Option<&str>, accept: Option<&str>) -> Result<Self> {
        if let Some(format) = format_param {
            return match format {
                "json" => Ok(Self::HalJson),
                "csv" => Ok(Self::Csv),
                "geojson" => Ok(Self::GeoJson),
                other => Err(ApiError::NotAcceptable {
                    message: format!("Output format '{other}' is not supported"),
                }),
            };
        }

        let accept = accept.unwrap_or("*/*");
        if accept.contains("text/csv") {
            Ok(Self::Csv)
        } else if accept.contains("application/geo+json") {
            Ok(Self::GeoJson)
        } else {
            Ok(Self::HalJson)
        }
    }

    /// The response content type.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::HalJson => "application/hal+json",
            Self::Csv => "text/csv; charset=utf-8",
            Self::GeoJson => "application/geo+json",
        }
    }

    /// Whether this format streams the whole cursor by default
    /// (pagination only applies on an explicit `_pageSize`).
    #[must_use]
    pub const fn unlimited_page_size(self) -> bool {
        matches!(self, Self::Csv | Self::GeoJson)
    }
}

/// A streaming response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Sender half handed to render tasks.
pub struct ByteSink {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl ByteSink {
    /// Send a chunk; fails when the client disconnected.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Ok(bytes.into()))
            .await
            .map_err(|_| ApiError::internal("client disconnected"))
    }
}

/// Spawn a producer task and expose its output as a body stream.
///
/// A failure inside the producer is logged, not appended to the body: by then
/// headers are out, so the renderer is expected to have closed its envelope.
pub fn spawn_byte_stream<F, Fut>(producer: F) -> ByteStream
where
    F: FnOnce(ByteSink) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes>>(8);
    tokio::spawn(async move {
        if let Err(e) = producer(ByteSink { tx }).await {
            tracing::error!(error = %e, "streaming render aborted");
        }
    });
    Box::pin(tokio_stream_wrapper(rx))
}

fn tokio_stream_wrapper(
    mut rx: mpsc::Receiver<Result<Bytes>>,
) -> impl Stream<Item = Result<Bytes>> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

/// Everything a renderer needs, owned so the producer task is `'static`.
pub struct RenderJob {
    pub snapshot: Arc<SchemaSnapshot>,
    pub user: UserScopes,
    pub dataset_id: String,
    pub table_id: String,
    /// Scheme+host, no trailing slash.
    pub base_url: String,
    /// URL version segment (`v1`).
    pub version: String,
    pub executor: QueryExecutor,
    pub cache: Arc<PrefetchCache>,
    pub options: PlannerOptions,
    /// Raw query pairs, carried into prefetch temporal slices.
    pub raw_params: Vec<(String, String)>,
    pub plan: QueryPlan,
    /// Full request URL, used for self/next/previous links.
    pub self_url: String,
    /// Result of the COUNT query, when `?_count=true` was given.
    pub total_count: Option<i64>,
}

impl RenderJob {
    /// Start the main cursor for this job's plan.
    pub async fn open_cursor(&self) -> Result<crate::db::RowChunkStream> {
        let query = SqlGenerator::new().select(&self.plan)?;
        let decoder = RowDecoder::from_plan(&self.plan);
        self.executor.stream(query, decoder).await
    }

    /// Replace the page number in this job's URL.
    #[must_use]
    pub fn url_for_page(&self, page: u64) -> String {
        let (path, query) = self
            .self_url
            .split_once('?')
            .map_or((self.self_url.as_str(), ""), |(p, q)| (p, q));

        let mut pairs: Vec<String> = query
            .split('&')
            .filter(|p| !p.is_empty() && !p.starts_with("page="))
            .map(ToString::to_string)
            .collect();
        if page > 1 {
            pairs.push(format!("page={page}"));
        }
        if pairs.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", pairs.join("&"))
        }
    }
}
