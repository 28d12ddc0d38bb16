/*!
Timestamp watermark strategy.

Scans only rows whose watermark column moved past the previous run's
high-water mark. The scan cannot see deletes and cannot tell inserts
from updates, so every returned row is treated as added; the method fits
append-mostly fact tables whose watermark column is monotone.
*/

use async_trait::async_trait;

use super::{StateWrite, Strategy, StrategyContext, StrategyOutcome};
use crate::config::TableSpec;
use crate::error::{CdcError, Result};
use crate::fingerprint::canonical_text;
use crate::model::changeset::ChangeSet;
use crate::model::state::{timestamp_state_key, TimestampState};
use crate::source::qualified_table_name;
use futures::TryStreamExt;

/// Timestamp-based change detection.
pub struct TimestampStrategy;

#[async_trait]
impl Strategy for TimestampStrategy {
    async fn process(
        &self,
        table: &str,
        spec: &TableSpec,
        datasource: &str,
        ctx: &StrategyContext<'_>,
    ) -> Result<StrategyOutcome> {
        let column = spec
            .timestamp_column
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CdcError::Config("no timestamp column specified".to_string()))?;

        let state_key = timestamp_state_key(datasource, table);
        let last = ctx
            .states
            .get::<TimestampState>(&state_key)
            .await?
            .map(|state| state.last_timestamp);

        let where_clause = last
            .as_ref()
            .map(|watermark| format!("{} > '{}'", column, watermark));
        let qualified = qualified_table_name(spec.schema.as_deref(), table);
        let mut batches =
            ctx.reader
                .fetch_batches(datasource, &qualified, None, where_clause.as_deref())?;

        // Watermarks compare as canonical text, which is ordered for
        // ISO-8601 timestamps.
        let mut latest = last.clone();
        let mut added = Vec::new();
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(CdcError::Cancelled);
            }
            let batch = match batches.try_next().await? {
                Some(batch) => batch,
                None => break,
            };
            for row in batch {
                if let Some(value) = row.get(column) {
                    let text = canonical_text(value);
                    if !text.is_empty()
                        && latest.as_deref().map_or(true, |current| text.as_str() > current)
                    {
                        latest = Some(text);
                    }
                }
                added.push(row);
            }
        }

        // Persist only when the watermark advanced; an unchanged mark
        // would rewrite identical state for nothing.
        let mut state_writes = Vec::new();
        if let Some(new_watermark) = &latest {
            if last.as_ref() != Some(new_watermark) {
                let state = TimestampState {
                    last_timestamp: new_watermark.clone(),
                    processed_at: ctx.now,
                };
                state_writes.push(StateWrite {
                    key: state_key,
                    value: serde_json::to_value(&state)
                        .map_err(|err| CdcError::StateIo(err.to_string()))?,
                });
            }
        }

        tracing::info!(
            table,
            rows = added.len(),
            watermark = latest.as_deref().unwrap_or(""),
            "watermark scan complete"
        );
        Ok(StrategyOutcome {
            changes: ChangeSet {
                added,
                ..Default::default()
            },
            state_writes,
            stale_slots: Vec::new(),
            previous_watermark: last,
            new_watermark: latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::Rig;
    use serde_json::json;

    fn spec() -> TableSpec {
        TableSpec {
            datasource: "test_db".to_string(),
            schema: None,
            method: "timestamp".to_string(),
            timestamp_column: Some("updated_at".to_string()),
            primary_key: None,
            hash_columns: None,
            partition_size: None,
            snapshot_format: None,
        }
    }

    #[tokio::test]
    async fn test_first_run_sets_watermark() {
        let rig = Rig::new();
        rig.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at TEXT)")
            .await;
        rig.execute(
            "INSERT INTO events VALUES \
             (1, '2024-01-01T00:00:00'), (2, '2024-01-02T00:00:00'), (3, '2024-01-03T00:00:00')",
        )
        .await;

        let outcome = rig.process(&TimestampStrategy, "events", &spec()).await.unwrap();
        assert_eq!(outcome.changes.added.len(), 3);
        assert!(outcome.changes.modified.is_empty());
        assert!(outcome.changes.deleted.is_empty());
        assert_eq!(outcome.previous_watermark, None);
        assert_eq!(
            outcome.new_watermark.as_deref(),
            Some("2024-01-03T00:00:00")
        );
        assert_eq!(outcome.state_writes.len(), 1);
        assert_eq!(
            outcome.state_writes[0].value["last_timestamp"],
            "2024-01-03T00:00:00"
        );
    }

    #[tokio::test]
    async fn test_incremental_run_emits_only_new_rows() {
        let rig = Rig::new();
        rig.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at TEXT)")
            .await;
        rig.execute(
            "INSERT INTO events VALUES \
             (1, '2024-01-01T00:00:00'), (2, '2024-01-02T00:00:00'), (3, '2024-01-03T00:00:00')",
        )
        .await;
        let table_spec = spec();
        rig.run_and_commit(&TimestampStrategy, "events", &table_spec).await;

        rig.execute("INSERT INTO events VALUES (4, '2024-01-04T00:00:00')")
            .await;
        let outcome = rig
            .process(&TimestampStrategy, "events", &table_spec)
            .await
            .unwrap();
        assert_eq!(outcome.changes.added.len(), 1);
        assert_eq!(outcome.changes.added[0].get("id"), Some(&json!(4)));
        assert_eq!(
            outcome.previous_watermark.as_deref(),
            Some("2024-01-03T00:00:00")
        );
        assert_eq!(
            outcome.new_watermark.as_deref(),
            Some("2024-01-04T00:00:00")
        );
    }

    #[tokio::test]
    async fn test_unchanged_watermark_writes_no_state() {
        let rig = Rig::new();
        rig.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, updated_at TEXT)")
            .await;
        rig.execute("INSERT INTO events VALUES (1, '2024-01-01T00:00:00')")
            .await;
        let table_spec = spec();
        rig.run_and_commit(&TimestampStrategy, "events", &table_spec).await;

        let outcome = rig
            .process(&TimestampStrategy, "events", &table_spec)
            .await
            .unwrap();
        assert!(outcome.changes.is_empty());
        assert!(outcome.state_writes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_timestamp_column_is_config_error() {
        let rig = Rig::new();
        let mut bad = spec();
        bad.timestamp_column = None;
        let result = rig.process(&TimestampStrategy, "events", &bad).await;
        assert!(matches!(result, Err(CdcError::Config(_))));
    }
}
