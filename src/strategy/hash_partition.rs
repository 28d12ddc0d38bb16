/*!
Partitioned hash strategy for tables whose fingerprint map does not fit
in memory at once.

The table is split into `N = ceil(count / partition_size)` slices by
`MOD(ABS(CAST(COALESCE(<pk>, 0) AS INTEGER)), N)`, and the hash
comparison runs per slice against a per-slice state slot. `N` is a
function of the current row count; when it differs from the previous
run, the old `partition_*_of_M` slots are never consulted (the rows
reappear as added/deleted once) and are handed back for
garbage-collection.
*/

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::hash::{diff_scan, hash_spec};
use super::{Method, StateWrite, Strategy, StrategyContext, StrategyOutcome};
use crate::config::TableSpec;
use crate::error::{CdcError, Result};
use crate::model::changeset::ChangeSet;
use crate::model::state::{partition_state_key, HashState};
use crate::source::qualified_table_name;
use crate::util::parse_partition_slot;

const DEFAULT_PARTITION_SIZE: u64 = 10_000;

/// Hash-based change detection, one primary-key partition at a time.
pub struct HashPartitionStrategy;

#[async_trait]
impl Strategy for HashPartitionStrategy {
    async fn process(
        &self,
        table: &str,
        spec: &TableSpec,
        datasource: &str,
        ctx: &StrategyContext<'_>,
    ) -> Result<StrategyOutcome> {
        let (primary_key, selector) = hash_spec(spec)?;
        let partition_size = spec.partition_size.unwrap_or(DEFAULT_PARTITION_SIZE);
        if partition_size == 0 {
            return Err(CdcError::Config(
                "partition_size must be positive".to_string(),
            ));
        }

        let qualified = qualified_table_name(spec.schema.as_deref(), table);

        // The partition predicate coerces the key to an integer, so a
        // non-integer key column cannot be partitioned.
        let info = ctx.reader.table_info(datasource, &qualified).await?;
        let key_column = info
            .columns
            .iter()
            .find(|column| column.name == primary_key)
            .ok_or_else(|| {
                CdcError::Config(format!("primary key column not found: {}", primary_key))
            })?;
        if !key_column.is_integer() {
            return Err(CdcError::Config(format!(
                "hash-partition requires an integer primary key, {} is {}",
                primary_key, key_column.type_name
            )));
        }

        let total = ctx
            .reader
            .execute_scalar(datasource, &format!("SELECT COUNT(*) FROM {}", qualified))
            .await?
            .max(0) as u64;
        let partitions = std::cmp::max(1, (total + partition_size - 1) / partition_size);
        tracing::info!(table, total, partitions, "partitioned scan starting");

        let mut changes = ChangeSet::default();
        let mut state_writes = Vec::new();
        for partition in 0..partitions {
            let state_key = partition_state_key(datasource, table, partition, partitions);
            let previous: BTreeMap<String, String> = ctx
                .states
                .get::<HashState>(&state_key)
                .await?
                .map(|state| state.row_hashes)
                .unwrap_or_default();

            let predicate =
                ctx.reader
                    .partition_predicate(datasource, primary_key, partitions, partition)?;
            let batches =
                ctx.reader
                    .fetch_batches(datasource, &qualified, None, Some(&predicate))?;
            let scan = diff_scan(batches, ctx.cancel, primary_key, &selector, &previous).await?;

            let new_state = HashState {
                row_hashes: scan.current,
                processed_at: Some(ctx.now),
            };
            state_writes.push(StateWrite {
                key: state_key,
                value: serde_json::to_value(&new_state)
                    .map_err(|err| CdcError::StateIo(err.to_string()))?,
            });
            changes.extend(scan.changes);
        }

        let stale_slots = self
            .stale_slots(ctx, datasource, table, partitions)
            .await?;

        tracing::info!(
            table,
            method = Method::HashPartition.name(),
            partitions,
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "scan complete"
        );
        Ok(StrategyOutcome {
            changes,
            state_writes,
            stale_slots,
            ..Default::default()
        })
    }
}

impl HashPartitionStrategy {
    /// Slots of a previous run with a different partition count. They
    /// are never consulted; the orchestrator deletes them once the new
    /// slots are committed.
    async fn stale_slots(
        &self,
        ctx: &StrategyContext<'_>,
        datasource: &str,
        table: &str,
        partitions: u64,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}/{}/", datasource, table);
        let keys = ctx.states.list(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|key| {
                key.rsplit('/')
                    .next()
                    .and_then(parse_partition_slot)
                    .map_or(false, |(_, total)| total != partitions)
            })
            .collect())
    }
}
