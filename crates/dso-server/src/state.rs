//! Shared application state.

use std::sync::Arc;

use dso_core::db::{create_pool, PrefetchCache, QueryExecutor};
use dso_core::schema::{SchemaRegistry, SchemaSource};
use dso_error::Result;

use crate::config::ServerConfig;

/// State shared by all request handlers.
///
/// Everything here is either immutable or internally synchronized; handlers
/// never lock across I/O.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchemaRegistry>,
    pub executor: QueryExecutor,
    pub cache: Arc<PrefetchCache>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Connect the pool and load the initial schema snapshot.
    ///
    /// # Errors
    ///
    /// Startup fails when the schema source is unreachable or the database
    /// URL is invalid.
    pub async fn initialize(config: ServerConfig) -> Result<Self> {
        let source = if config.schema_source.starts_with("http://")
            || config.schema_source.starts_with("https://")
        {
            SchemaSource::Url(config.schema_source.clone())
        } else {
            SchemaSource::Directory(config.schema_source.clone().into())
        };

        let registry = Arc::new(SchemaRegistry::load(source).await?);
        let pool = create_pool(&config.database)?;

        Ok(Self {
            registry,
            executor: QueryExecutor::new(pool),
            cache: Arc::new(PrefetchCache::new(config.prefetch_cache_size)),
            config: Arc::new(config),
        })
    }
}
