//! PostgreSQL execution: pooling, streaming row fetch, relation prefetch.

mod execute;
mod pool;
mod prefetch;

pub use execute::{DataRow, QueryExecutor, Row, RowChunkStream, RowDecoder, CHUNK_SIZE};
pub use pool::{create_pool, DbConfig};
pub use prefetch::{PrefetchCache, Prefetcher};
