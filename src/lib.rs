#![deny(missing_docs)]
/*!
# cdc-rs

cdc-rs performs periodic change data capture against relational source
tables by comparing the current table content to a previously persisted
summary and emitting a delta of added, modified and deleted rows. Deltas
are written to an object store as timestamped snapshot artifacts for
downstream ETL staging.

Three change-detection methods are supported per table:
* `timestamp` — watermark scan over a monotone timestamp column.
* `hash` — whole-table row fingerprint comparison.
* `hash-partition` — fingerprint comparison per primary-key partition,
  for tables whose fingerprint map does not fit in memory.

Tables stream in bounded batches; per-table state lives in the object
store and advances only after the run's snapshot artifacts are durable.

*/
pub mod cdc;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod strategy;
pub mod util;

pub use object_store;
