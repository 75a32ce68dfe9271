//! Schema loading and hot reload.
//!
//! The registry loads all schema documents at startup and keeps them in an
//! atomically swappable snapshot. Requests capture the current snapshot once
//! at entry and keep using it for their whole lifetime; a reload publishes a
//! new snapshot without interrupting in-flight requests. There is no lock on
//! the read path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

use dso_error::{ApiError, Result};

use super::types::{Dataset, Profile, SchemaSnapshot};

/// Where schema documents are loaded from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// A directory of `*.json` files; each file holds one dataset or one
    /// profile document.
    Directory(PathBuf),
    /// An HTTP endpoint serving a combined `{datasets, profiles}` document.
    Url(String),
}

/// Combined document served by a schema endpoint.
#[derive(Debug, Deserialize)]
struct CombinedDocument {
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// The process-wide schema catalog.
///
/// Startup fails if the source is unreachable; reload failures keep the
/// previous snapshot active.
pub struct SchemaRegistry {
    source:  SchemaSource,
    current: ArcSwap<SchemaSnapshot>,
    client:  reqwest::Client,
}

impl SchemaRegistry {
    /// Load the initial snapshot from the source.
    ///
    /// # Errors
    ///
    /// `Schema` when the source is unreachable or a document fails to parse.
    pub async fn load(source: SchemaSource) -> Result<Self> {
        let client = reqwest::Client::new();
        let snapshot = fetch_snapshot(&source, &client).await?;
        tracing::info!(
            datasets = snapshot.datasets().count(),
            profiles = snapshot.profiles().len(),
            "schema loaded"
        );
        Ok(Self {
            source,
            current: ArcSwap::from_pointee(snapshot),
            client,
        })
    }

    /// The current snapshot. Cheap; callers hold it for the whole request.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.current.load_full()
    }

    /// Re-read the source and atomically publish a new snapshot.
    ///
    /// On failure the previous snapshot stays active and the error is
    /// returned for logging; in-flight requests are unaffected either way.
    pub async fn reload(&self) -> Result<()> {
        match fetch_snapshot(&self.source, &self.client).await {
            Ok(snapshot) => {
                tracing::info!(datasets = snapshot.datasets().count(), "schema reloaded");
                self.current.store(Arc::new(snapshot));
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "schema reload failed, keeping previous snapshot");
                Err(e)
            }
        }
    }
}

async fn fetch_snapshot(
    source: &SchemaSource,
    client: &reqwest::Client,
) -> Result<SchemaSnapshot> {
    match source {
        SchemaSource::Directory(dir) => load_directory(dir),
        SchemaSource::Url(url) => load_url(url, client).await,
    }
}

fn load_directory(dir: &Path) -> Result<SchemaSnapshot> {
    let mut datasets = Vec::new();
    let mut profiles = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| ApiError::schema(format!("cannot read schema directory {dir:?}: {e}")))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    for path in files {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ApiError::schema(format!("cannot read {path:?}: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ApiError::schema(format!("invalid JSON in {path:?}: {e}")))?;

        // A dataset document has tables; anything with scopes is a profile.
        if value.get("tables").is_some() {
            let dataset: Dataset = serde_json::from_value(value)
                .map_err(|e| ApiError::schema(format!("invalid dataset in {path:?}: {e}")))?;
            datasets.push(dataset);
        } else if value.get("scopes").is_some() {
            let profile: Profile = serde_json::from_value(value)
                .map_err(|e| ApiError::schema(format!("invalid profile in {path:?}: {e}")))?;
            profiles.push(profile);
        } else {
            tracing::warn!(?path, "skipping unrecognized schema document");
        }
    }

    SchemaSnapshot::from_documents(datasets, profiles)
}

async fn load_url(url: &str, client: &reqwest::Client) -> Result<SchemaSnapshot> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::schema(format!("schema source unreachable: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::schema(format!(
            "schema source returned HTTP {}",
            response.status()
        )));
    }

    let document: CombinedDocument = response
        .json()
        .await
        .map_err(|e| ApiError::schema(format!("invalid schema document: {e}")))?;

    SchemaSnapshot::from_documents(document.datasets, document.profiles)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_dataset(dir: &Path) {
        let doc = serde_json::json!({
            "id": "afvalwegingen",
            "tables": [{
                "id": "containers",
                "fields": [{"id": "id", "type": "integer"}]
            }]
        });
        std::fs::write(
            dir.join("afvalwegingen.json"),
            serde_json::to_string(&doc).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());

        let registry = SchemaRegistry::load(SchemaSource::Directory(dir.path().to_path_buf()))
            .await
            .unwrap();
        let snapshot = registry.snapshot();
        assert!(snapshot.dataset("afvalwegingen").is_some());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());

        let registry = SchemaRegistry::load(SchemaSource::Directory(dir.path().to_path_buf()))
            .await
            .unwrap();

        // Break the source: invalid JSON now sits in the directory.
        std::fs::write(dir.path().join("afvalwegingen.json"), "{not json").unwrap();
        assert!(registry.reload().await.is_err());

        // The previous snapshot is still being served.
        assert!(registry.snapshot().dataset("afvalwegingen").is_some());
    }

    #[tokio::test]
    async fn test_startup_fails_on_missing_source() {
        let result =
            SchemaRegistry::load(SchemaSource::Directory(PathBuf::from("/nonexistent"))).await;
        assert!(result.is_err());
    }
}
