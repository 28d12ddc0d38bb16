/*!
Whole-table hash strategy.

Every run fingerprints every row and compares against the previous run's
`hash_state` slot: unseen keys are added, changed fingerprints are
modified, and keys that vanished from the scan are deleted. The
fingerprint map lives in memory for the duration of the scan, so very
large tables belong to the hash-partition strategy instead.
*/

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use super::{Method, StateWrite, Strategy, StrategyContext, StrategyOutcome};
use crate::config::TableSpec;
use crate::error::{CdcError, Result};
use crate::fingerprint::{canonical_text, fingerprint, ColumnSelector};
use crate::model::changeset::{ChangeSet, DeletedKey};
use crate::model::row::Batch;
use crate::model::state::{hash_state_key, HashState};
use crate::source::qualified_table_name;

/// Result of one comparison scan: the new fingerprint map and the
/// changes relative to the previous one.
pub(crate) struct DiffScan {
    pub current: BTreeMap<String, String>,
    pub changes: ChangeSet,
}

/// Stream the batches, fingerprint each row and diff against the
/// previous fingerprint map. Shared by the hash and hash-partition
/// strategies; the latter runs it once per partition slice.
pub(crate) async fn diff_scan(
    mut batches: BoxStream<'static, Result<Batch>>,
    cancel: &CancellationToken,
    primary_key: &str,
    selector: &ColumnSelector,
    previous: &BTreeMap<String, String>,
) -> Result<DiffScan> {
    let mut current = BTreeMap::new();
    let mut changes = ChangeSet::default();
    loop {
        if cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }
        let batch = match batches.try_next().await? {
            Some(batch) => batch,
            None => break,
        };
        for row in batch {
            let pk = row.get(primary_key).map(canonical_text).unwrap_or_default();
            if pk.is_empty() {
                tracing::warn!(primary_key, "row missing primary key value, skipping");
                continue;
            }
            let hash = fingerprint(&row, selector);
            match previous.get(&pk) {
                Some(prev) if *prev == hash => {}
                Some(_) => changes.modified.push(row),
                None => changes.added.push(row),
            }
            current.insert(pk, hash);
        }
    }
    for pk in previous.keys() {
        if !current.contains_key(pk) {
            changes.deleted.push(DeletedKey {
                primary_key: primary_key.to_string(),
                value: pk.clone(),
            });
        }
    }
    Ok(DiffScan { current, changes })
}

/// Validated hash preconditions: the primary key and the fingerprint
/// selector.
pub(crate) fn hash_spec(spec: &TableSpec) -> Result<(&str, ColumnSelector)> {
    let columns = spec
        .hash_columns
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CdcError::Config("no hash columns specified".to_string()))?;
    let primary_key = spec
        .primary_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| CdcError::Config("no primary key specified".to_string()))?;
    Ok((primary_key, ColumnSelector::from_spec(columns)))
}

/// Hash-based change detection over the whole table.
pub struct HashStrategy;

#[async_trait]
impl Strategy for HashStrategy {
    async fn process(
        &self,
        table: &str,
        spec: &TableSpec,
        datasource: &str,
        ctx: &StrategyContext<'_>,
    ) -> Result<StrategyOutcome> {
        let (primary_key, selector) = hash_spec(spec)?;

        let state_key = hash_state_key(datasource, table);
        let previous: BTreeMap<String, String> = ctx
            .states
            .get::<HashState>(&state_key)
            .await?
            .map(|state| state.row_hashes)
            .unwrap_or_default();

        let qualified = qualified_table_name(spec.schema.as_deref(), table);
        let batches = ctx.reader.fetch_batches(datasource, &qualified, None, None)?;
        let scan = diff_scan(batches, ctx.cancel, primary_key, &selector, &previous).await?;

        let new_state = HashState {
            row_hashes: scan.current,
            processed_at: Some(ctx.now),
        };
        tracing::info!(
            table,
            method = Method::Hash.name(),
            added = scan.changes.added.len(),
            modified = scan.changes.modified.len(),
            deleted = scan.changes.deleted.len(),
            "scan complete"
        );
        Ok(StrategyOutcome {
            changes: scan.changes,
            state_writes: vec![StateWrite {
                key: state_key,
                value: serde_json::to_value(&new_state)
                    .map_err(|err| CdcError::StateIo(err.to_string()))?,
            }],
            ..Default::default()
        })
    }
}
