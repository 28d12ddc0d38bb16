/*!
Run orchestration.

One [CdcService::run] invocation processes a set of configured tables:
per table it dispatches the configured strategy, writes the snapshot
artifacts and only then commits the strategy's pending state, so a crash
between the two leaves the previous state intact and the next run
reproduces the delta. Tables are independent; a failure is recorded in
the run report and never aborts the run.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::model::changeset::{ChangeCounts, ChangeSet};
use crate::snapshot::format::SnapshotFormat;
use crate::snapshot::{SnapshotOutcome, SnapshotWriter};
use crate::source::SourceReader;
use crate::state::StateStore;
use crate::strategy::{for_method, Method, StrategyContext};

/// Result of processing one table.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TableOutcome {
    /// The strategy ran to completion.
    Success {
        /// The method that ran.
        method: String,
        /// Bucket counts.
        changes: ChangeCounts,
        /// The full change set, flattened into `added` / `modified` /
        /// `deleted`.
        #[serde(flatten)]
        change_set: ChangeSet,
        /// Snapshot write result, present when snapshotting is enabled.
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<SnapshotOutcome>,
        /// Watermark before the run (timestamp method).
        #[serde(skip_serializing_if = "Option::is_none")]
        last_timestamp: Option<String>,
        /// Watermark after the run (timestamp method).
        #[serde(skip_serializing_if = "Option::is_none")]
        new_timestamp: Option<String>,
    },
    /// The table was skipped or failed; the run continued.
    Error {
        /// Failure summary.
        message: String,
    },
}

impl TableOutcome {
    /// Whether the table ran to completion.
    pub fn is_success(&self) -> bool {
        matches!(self, TableOutcome::Success { .. })
    }

    fn error(message: impl Into<String>) -> Self {
        TableOutcome::Error {
            message: message.into(),
        }
    }
}

/// Aggregated results of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Per-table outcomes.
    pub results: BTreeMap<String, TableOutcome>,
}

impl RunReport {
    /// Number of tables that ran to completion.
    pub fn successes(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    /// Number of tables that were skipped or failed.
    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }
}

/// The run orchestrator: owns the datasource handles and the object
/// store for the lifetime of the process.
pub struct CdcService {
    config: Arc<Config>,
    reader: SourceReader,
    states: StateStore,
    snapshots: SnapshotWriter,
    cancel: CancellationToken,
}

impl CdcService {
    /// Connect to the configured datasources and storage backend.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let reader = SourceReader::connect(&config)?;
        let states = StateStore::from_config(&config.storage)?;
        Ok(Self::with_stores(config, reader, states))
    }

    /// Assemble a service over existing handles; the snapshot writer
    /// shares the state store's backend.
    pub fn with_stores(config: Arc<Config>, reader: SourceReader, states: StateStore) -> Self {
        let snapshots = SnapshotWriter::new(states.object_store());
        CdcService {
            config,
            reader,
            states,
            snapshots,
            cancel: CancellationToken::new(),
        }
    }

    /// The state store backing this service.
    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// The snapshot writer backing this service, also useful for
    /// inventory queries.
    pub fn snapshots(&self) -> &SnapshotWriter {
        &self.snapshots
    }

    /// Cancel signal for this service. Strategies honor it between
    /// batches and abandon without writing state or artifacts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process one table according to its configured method. Never
    /// returns an error; failures become the table's outcome.
    pub async fn process_table(&self, table: &str) -> TableOutcome {
        let spec = match self.config.table(table) {
            Some(spec) => spec,
            None => {
                tracing::error!(table, "no configuration found for table");
                return TableOutcome::error(format!("no configuration for table {}", table));
            }
        };
        if spec.datasource.is_empty() {
            return TableOutcome::error("no datasource specified");
        }
        let method = match Method::parse(&spec.method) {
            Ok(method) => method,
            Err(err) => {
                tracing::error!(table, method = %spec.method, "unsupported CDC method");
                return TableOutcome::error(err.to_string());
            }
        };
        tracing::info!(table, method = method.name(), "processing table");

        // One `now` per table run: every artifact of the run shares the
        // key prefix derived from it.
        let now = Utc::now();
        let ctx = StrategyContext {
            reader: &self.reader,
            states: &self.states,
            cancel: &self.cancel,
            now,
        };
        let strategy = for_method(method);
        let outcome = match strategy.process(table, spec, &spec.datasource, &ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(table, error = %err, "table processing failed");
                return TableOutcome::error(err.to_string());
            }
        };

        let snapshot = if self.config.global_settings.snapshot.enabled {
            let format_name = spec
                .snapshot_format
                .as_deref()
                .unwrap_or(&self.config.global_settings.snapshot.format);
            let saved = match SnapshotFormat::parse(format_name) {
                Ok(format) => {
                    self.snapshots
                        .save(table, &spec.datasource, &outcome.changes, format, now)
                        .await
                }
                Err(err) => Err(err),
            };
            Some(saved.unwrap_or_else(|err| {
                tracing::warn!(table, error = %err, "failed to save snapshot");
                SnapshotOutcome::Error {
                    message: err.to_string(),
                }
            }))
        } else {
            None
        };

        // State advances only once the artifacts are durable, so a
        // failed snapshot is retried from the previous state on the
        // next run.
        if matches!(&snapshot, Some(SnapshotOutcome::Error { .. })) {
            tracing::warn!(table, "snapshot failed, state not advanced");
        } else {
            for write in &outcome.state_writes {
                if let Err(err) = self.states.put(&write.key, &write.value).await {
                    tracing::error!(table, key = %write.key, error = %err, "state commit failed");
                    return TableOutcome::error(err.to_string());
                }
            }
            for slot in &outcome.stale_slots {
                if let Err(err) = self.states.delete(slot).await {
                    tracing::warn!(slot = %slot, error = %err, "failed to remove stale partition slot");
                }
            }
        }

        TableOutcome::Success {
            method: method.name().to_string(),
            changes: outcome.changes.counts(),
            change_set: outcome.changes,
            snapshot,
            last_timestamp: outcome.previous_watermark,
            new_timestamp: outcome.new_watermark,
        }
    }

    /// Process the named tables, or every configured table when `None`.
    /// Tables run concurrently up to the connection-pool size; ordering
    /// among them is unspecified.
    pub async fn run(&self, tables: Option<&[String]>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let names: Vec<String> = match tables {
            Some(requested) => requested
                .iter()
                .filter(|name| {
                    let known = self.config.table(name).is_some();
                    if !known {
                        tracing::warn!(table = %name, "table not found in configuration");
                    }
                    known
                })
                .cloned()
                .collect(),
            None => self.config.tables.keys().cloned().collect(),
        };
        tracing::info!(%run_id, tables = names.len(), "starting CDC run");

        let limit = self
            .config
            .global_settings
            .connection_pool
            .pool_size
            .max(1) as usize;
        let results: BTreeMap<String, TableOutcome> = futures::stream::iter(
            names.into_iter().map(|name| async move {
                let outcome = self.process_table(&name).await;
                (name, outcome)
            }),
        )
        .buffer_unordered(limit)
        .collect()
        .await;

        let report = RunReport {
            run_id,
            started_at,
            results,
        };
        tracing::info!(
            %run_id,
            successes = report.successes(),
            failures = report.failures(),
            "CDC run finished"
        );
        report
    }

    /// Release the datasource handles. Called once at process shutdown.
    pub async fn close(&self) {
        self.reader.close().await;
    }
}
