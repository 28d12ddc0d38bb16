/*!
JSON blob store for CDC state, keyed by opaque string.

Backed by any [ObjectStore]; production runs use an S3-compatible bucket
(MinIO), tests use the in-memory implementation. `put` overwrites
atomically at the key level: a concurrent reader observes either the old
or the new value, never a torn mix.
*/

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StorageConfig;
use crate::error::{CdcError, Result};

/// Suffix of sibling blobs carrying split-off metadata for formats whose
/// payload cannot embed it (parquet). Listings filter these out.
pub static METADATA_SUFFIX: &str = "_metadata";

/// State store over an object store.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn ObjectStore>,
}

impl StateStore {
    /// Wrap an existing object store handle.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        StateStore { store }
    }

    /// Connect to the configured S3-compatible backend.
    pub fn from_config(storage: &StorageConfig) -> Result<Self> {
        let scheme = if storage.secure { "https" } else { "http" };
        tracing::info!(endpoint = %storage.endpoint, bucket = %storage.bucket, "initializing object store");
        let store = AmazonS3Builder::new()
            // MinIO ignores the region but the builder requires one.
            .with_region("us-east-1")
            .with_endpoint(format!("{}://{}", scheme, storage.endpoint))
            .with_allow_http(!storage.secure)
            .with_access_key_id(&storage.access_key)
            .with_secret_access_key(&storage.secret_key)
            .with_bucket_name(&storage.bucket)
            .build()
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        Ok(StateStore {
            store: Arc::new(store),
        })
    }

    /// The underlying object store, shared with the snapshot writer.
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Probe the backend once at startup so a misconfigured bucket fails
    /// the process before any table runs.
    pub async fn ensure_available(&self) -> Result<()> {
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        Ok(())
    }

    /// Fetch and deserialize a state blob. A missing key is `None`, not
    /// an error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = Path::from(key);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(key, "no state at key");
                return Ok(None);
            }
            Err(err) => return Err(CdcError::StateIo(err.to_string())),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| CdcError::StateIo(format!("corrupt state at {}: {}", key, err)))?;
        Ok(Some(value))
    }

    /// Serialize and store a state blob, overwriting any previous value.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        self.store
            .put(&Path::from(key), json.into())
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        tracing::debug!(key, "stored state");
        Ok(())
    }

    /// Keys under a prefix, with `_metadata` siblings filtered out.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::TryStreamExt;
        let path = Path::from(prefix);
        let prefix = if prefix.is_empty() { None } else { Some(&path) };
        let metas: Vec<_> = self
            .store
            .list(prefix)
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?
            .try_collect()
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        Ok(metas
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| !key.ends_with(METADATA_SUFFIX))
            .collect())
    }

    /// Delete a state blob.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(&Path::from(key))
            .await
            .map_err(|err| CdcError::StateIo(err.to_string()))?;
        tracing::debug!(key, "deleted state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::state::HashState;
    use object_store::memory::InMemory;

    fn memory_store() -> StateStore {
        StateStore::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = memory_store();
        let state: Option<HashState> = store.get("ds/tbl/hash_state").await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = memory_store();
        let mut state = HashState::default();
        state
            .row_hashes
            .insert("1".to_string(), "a".repeat(32));
        store.put("ds/tbl/hash_state", &state).await.unwrap();

        let loaded: HashState = store.get("ds/tbl/hash_state").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = memory_store();
        store
            .put("ds/tbl/timestamp_state", &serde_json::json!({"last_timestamp": "a"}))
            .await
            .unwrap();
        store
            .put("ds/tbl/timestamp_state", &serde_json::json!({"last_timestamp": "b"}))
            .await
            .unwrap();
        let value: serde_json::Value =
            store.get("ds/tbl/timestamp_state").await.unwrap().unwrap();
        assert_eq!(value["last_timestamp"], "b");
    }

    #[tokio::test]
    async fn test_list_filters_metadata_siblings() {
        let store = memory_store();
        store.put("ds/tbl/hash_state", &1).await.unwrap();
        store
            .put("snapshots/ds/tbl/20240501_103000_added.parquet", &2)
            .await
            .unwrap();
        store
            .put("snapshots/ds/tbl/20240501_103000_added.parquet_metadata", &3)
            .await
            .unwrap();

        let keys = store.list("snapshots/ds/tbl").await.unwrap();
        assert_eq!(keys, vec!["snapshots/ds/tbl/20240501_103000_added.parquet"]);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = memory_store();
        store.put("ds/tbl/hash_state", &1).await.unwrap();
        store.delete("ds/tbl/hash_state").await.unwrap();
        let value: Option<i64> = store.get("ds/tbl/hash_state").await.unwrap();
        assert!(value.is_none());
    }
}
