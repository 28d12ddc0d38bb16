/*!
Change-detection strategies.

Each strategy scans one table, compares it to the previous run's state
and produces a [StrategyOutcome]: the change set plus the state writes
that will make this run the new baseline. Strategies never touch the
store themselves on the write side; the orchestrator commits the pending
writes only after the snapshot artifacts are durable, so a crash in
between leaves the previous state intact and the next run reproduces the
delta.
*/

pub mod hash;
pub mod hash_partition;
pub mod timestamp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::TableSpec;
use crate::error::{CdcError, Result};
use crate::model::changeset::ChangeSet;
use crate::source::SourceReader;
use crate::state::StateStore;

/// A configured change-detection method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Watermark scan over a monotone timestamp column.
    Timestamp,
    /// Whole-table fingerprint comparison.
    Hash,
    /// Fingerprint comparison per primary-key partition.
    HashPartition,
}

impl Method {
    /// Parse a configured method name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "timestamp" => Ok(Method::Timestamp),
            "hash" => Ok(Method::Hash),
            "hash-partition" | "hashpartition" => Ok(Method::HashPartition),
            other => Err(CdcError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Canonical name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Timestamp => "timestamp",
            Method::Hash => "hash",
            Method::HashPartition => "hash-partition",
        }
    }
}

/// One pending state slot write, applied by the orchestrator after the
/// snapshot artifacts are durable.
#[derive(Debug, Clone)]
pub struct StateWrite {
    /// Slot key.
    pub key: String,
    /// Serialized blob.
    pub value: serde_json::Value,
}

/// Result of one strategy run over one table.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    /// The change set, with buckets disjoint by primary key.
    pub changes: ChangeSet,
    /// State slots to commit once artifacts are durable.
    pub state_writes: Vec<StateWrite>,
    /// Stale state slots to garbage-collect after the commit.
    pub stale_slots: Vec<String>,
    /// Watermark before this run (timestamp method only).
    pub previous_watermark: Option<String>,
    /// Watermark after this run (timestamp method only).
    pub new_watermark: Option<String>,
}

/// Everything a strategy needs besides the table itself. Handles are
/// borrowed: strategies use the datasource and the store but never own
/// or close them.
pub struct StrategyContext<'a> {
    /// Reader over the configured datasources.
    pub reader: &'a SourceReader,
    /// Store holding the previous run's state.
    pub states: &'a StateStore,
    /// Cooperative cancel signal, checked between batches.
    pub cancel: &'a CancellationToken,
    /// The single `now` captured at run start.
    pub now: DateTime<Utc>,
}

/// A change-detection strategy over `(table, spec, datasource)`.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Scan the table and produce its change set and pending state.
    async fn process(
        &self,
        table: &str,
        spec: &TableSpec,
        datasource: &str,
        ctx: &StrategyContext<'_>,
    ) -> Result<StrategyOutcome>;
}

/// The strategy implementing a method.
pub fn for_method(method: Method) -> Box<dyn Strategy> {
    match method {
        Method::Timestamp => Box::new(timestamp::TimestampStrategy),
        Method::Hash => Box::new(hash::HashStrategy),
        Method::HashPartition => Box::new(hash_partition::HashPartitionStrategy),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::Utc;
    use object_store::memory::InMemory;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Config;

    /// One sqlite-backed datasource plus an in-memory state store, the
    /// environment every strategy test runs in.
    pub(crate) struct Rig {
        pub reader: SourceReader,
        pub states: StateStore,
        pub cancel: CancellationToken,
    }

    impl Rig {
        pub fn new() -> Rig {
            // one pooled connection so every query sees the same
            // in-memory database; batch size 3 exercises chunking
            let config = Config::from_json(
                r#"{
                    "datasources": {"test_db": {"url": "sqlite::memory:"}},
                    "global_settings": {
                        "batch_size": 3,
                        "connection_pool": {"pool_size": 1, "max_overflow": 0, "timeout": 5}
                    }
                }"#,
            )
            .unwrap();
            Rig {
                reader: SourceReader::connect(&config).unwrap(),
                states: StateStore::new(Arc::new(InMemory::new())),
                cancel: CancellationToken::new(),
            }
        }

        pub async fn execute(&self, sql: &str) {
            sqlx::query(sql)
                .execute(self.reader.test_pool("test_db"))
                .await
                .unwrap();
        }

        pub async fn process(
            &self,
            strategy: &dyn Strategy,
            table: &str,
            spec: &TableSpec,
        ) -> Result<StrategyOutcome> {
            let ctx = StrategyContext {
                reader: &self.reader,
                states: &self.states,
                cancel: &self.cancel,
                now: Utc::now(),
            };
            strategy.process(table, spec, "test_db", &ctx).await
        }

        /// Run the strategy and commit its pending state, as the
        /// orchestrator does after a successful snapshot write.
        pub async fn run_and_commit(
            &self,
            strategy: &dyn Strategy,
            table: &str,
            spec: &TableSpec,
        ) -> StrategyOutcome {
            let outcome = self.process(strategy, table, spec).await.unwrap();
            for write in &outcome.state_writes {
                self.states.put(&write.key, &write.value).await.unwrap();
            }
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("timestamp").unwrap(), Method::Timestamp);
        assert_eq!(Method::parse("Hash").unwrap(), Method::Hash);
        assert_eq!(
            Method::parse("hash-partition").unwrap(),
            Method::HashPartition
        );
        assert_eq!(
            Method::parse("hashpartition").unwrap(),
            Method::HashPartition
        );
        assert!(matches!(
            Method::parse("merkle"),
            Err(CdcError::UnsupportedMethod(_))
        ));
    }
}
