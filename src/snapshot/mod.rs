/*!
Writes a change set to the object store as timestamped snapshot
artifacts.

One run of one table produces up to four artifacts under
`snapshots/<datasource>/<table>/`: one per non-empty change bucket plus a
summary manifest. All of a run's artifacts share the same
`YYYYMMDD_HHMMSS` prefix, taken from the single `now` the orchestrator
captured at run start, and are write-once: keys embed the timestamp so a
later run never rewrites them.
*/

pub mod format;

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{CdcError, Result};
use crate::model::changeset::{ChangeCounts, ChangeSet};
use crate::model::row::Row;
use crate::state::METADATA_SUFFIX;
use crate::util::{parse_snapshot_key, snapshot_timestamp};
use format::{BucketContext, SnapshotFormat};

/// Outcome of one snapshot save, reported per table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SnapshotOutcome {
    /// Artifacts were written.
    Saved {
        /// Format the bucket artifacts were written in.
        format: String,
        /// Every key written, bucket artifacts first, manifest last.
        files: Vec<String>,
        /// Bucket sizes, as also recorded in the manifest.
        summary: ChangeCounts,
    },
    /// The change set was empty; nothing was written.
    Skipped,
    /// An artifact write failed. State has not advanced, so the next
    /// run reproduces the delta.
    Error {
        /// Failure summary.
        message: String,
    },
}

/// Snapshot writer over an object store.
#[derive(Clone)]
pub struct SnapshotWriter {
    store: Arc<dyn ObjectStore>,
}

impl SnapshotWriter {
    /// Wrap an object store handle, usually the one the state store
    /// shares.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        SnapshotWriter { store }
    }

    fn artifact_key(
        datasource: &str,
        table: &str,
        timestamp: &str,
        bucket: &str,
        extension: &str,
    ) -> String {
        format!(
            "snapshots/{}/{}/{}_{}.{}",
            datasource, table, timestamp, bucket, extension
        )
    }

    /// Write the change set. Empty change sets produce no artifacts and
    /// return [SnapshotOutcome::Skipped].
    pub async fn save(
        &self,
        table: &str,
        datasource: &str,
        changes: &ChangeSet,
        format: SnapshotFormat,
        now: DateTime<Utc>,
    ) -> Result<SnapshotOutcome> {
        if changes.is_empty() {
            tracing::info!(table, "no changes detected, skipping snapshot");
            return Ok(SnapshotOutcome::Skipped);
        }
        tracing::info!(table, datasource, format = format.name(), "saving snapshot");

        let timestamp = snapshot_timestamp(&now);
        let timestamp_iso = now.to_rfc3339();
        let encoder = format.encoder();
        let counts = changes.counts();

        let buckets: [(&str, Vec<Value>); 3] = [
            ("added", changes.added.iter().map(Row::to_value).collect()),
            ("modified", changes.modified.iter().map(Row::to_value).collect()),
            (
                "deleted",
                changes
                    .deleted
                    .iter()
                    .map(|d| json!({"primary_key": &d.primary_key, "value": &d.value}))
                    .collect(),
            ),
        ];

        let mut files = Vec::new();
        for (operation, records) in &buckets {
            if records.is_empty() {
                continue;
            }
            let ctx = BucketContext {
                table,
                datasource,
                timestamp: &timestamp_iso,
                operation,
            };
            let encoded = encoder.encode(&ctx, records)?;
            let key = Self::artifact_key(
                datasource,
                table,
                &timestamp,
                operation,
                format.extension(),
            );
            self.put_bytes(&key, encoded.payload).await?;
            if let Some(metadata) = encoded.metadata {
                self.put_bytes(&format!("{}{}", key, METADATA_SUFFIX), metadata)
                    .await?;
            }
            files.push(key);
        }

        // The manifest is JSON for every format and lists the bucket
        // artifacts written above.
        let manifest_key = Self::artifact_key(datasource, table, &timestamp, "summary", "json");
        let manifest = json!({
            "table_name": table,
            "datasource": datasource,
            "timestamp": timestamp_iso,
            "format": format.name(),
            "files": files,
            "summary": counts,
        });
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        self.put_bytes(&manifest_key, manifest_bytes).await?;
        files.push(manifest_key);

        tracing::info!(table, files = files.len(), "snapshot saved");
        Ok(SnapshotOutcome::Saved {
            format: format.name().to_string(),
            files,
            summary: counts,
        })
    }

    /// Keys of stored snapshot artifacts, optionally narrowed to one
    /// datasource (and, within it, one table) and to a timestamp range.
    /// `_metadata` siblings are filtered out.
    pub async fn list_snapshots(
        &self,
        datasource: Option<&str>,
        table: Option<&str>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<Vec<String>> {
        let mut prefix = "snapshots".to_string();
        if let Some(datasource) = datasource {
            prefix.push('/');
            prefix.push_str(datasource);
            if let Some(table) = table {
                prefix.push('/');
                prefix.push_str(table);
            }
        }
        let path = Path::from(prefix.as_str());
        let keys: Vec<String> = self
            .store
            .list(Some(&path))
            .await
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        Ok(keys
            .into_iter()
            .filter(|key| !key.ends_with(METADATA_SUFFIX))
            .filter(|key| {
                if start.is_none() && end.is_none() {
                    return true;
                }
                // Keys outside the naming scheme cannot be range-checked
                // and are dropped, as are artifacts outside the range.
                match parse_snapshot_key(key) {
                    Some(parts) => {
                        start.map_or(true, |s| parts.timestamp >= s)
                            && end.map_or(true, |e| parts.timestamp <= e)
                    }
                    None => false,
                }
            })
            .collect())
    }

    /// Resolve an artifact key to its run's summary manifest; falls back
    /// to the information encoded in the key itself when the manifest is
    /// missing. `None` for keys outside the naming scheme.
    pub async fn snapshot_info(&self, key: &str) -> Result<Option<Value>> {
        let parts = match parse_snapshot_key(key) {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let manifest_key = Self::artifact_key(
            &parts.datasource,
            &parts.table,
            &parts.timestamp.format(crate::util::SNAPSHOT_TIMESTAMP_FORMAT).to_string(),
            "summary",
            "json",
        );
        if let Some(manifest) = self.get_json(&manifest_key).await? {
            return Ok(Some(manifest));
        }
        Ok(Some(json!({
            "datasource": parts.datasource,
            "table_name": parts.table,
            "timestamp": parts.timestamp.format(crate::util::SNAPSHOT_TIMESTAMP_FORMAT).to_string(),
            "operation": parts.operation,
            "file_key": key,
        })))
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.store
            .put(&Path::from(key), bytes.into())
            .await
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        tracing::debug!(key, "stored snapshot artifact");
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let result = match self.store.get(&Path::from(key)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(CdcError::SnapshotIo(err.to_string())),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| CdcError::SnapshotIo(err.to_string()))
    }
}
