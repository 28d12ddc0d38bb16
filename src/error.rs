/*!
 * defines the [CdcError] and [Result] types.
*/

use thiserror::Error;

/// CDC error type. One variant per failure class so the orchestrator can
/// decide between skipping a table and failing it.
#[derive(Error, Debug)]
pub enum CdcError {
    /// A table specification is missing a required field or carries an
    /// invalid one.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The datasource could not be reached or refused authentication.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// The source table does not exist or has an unexpected shape.
    #[error("schema error: {0}")]
    Schema(String),
    /// A query failed to execute on the source.
    #[error("query error: {0}")]
    Query(String),
    /// The object store failed while reading or writing a state slot.
    /// State is never advanced when this is raised.
    #[error("state store error: {0}")]
    StateIo(String),
    /// The object store failed while writing a snapshot artifact.
    #[error("snapshot write error: {0}")]
    SnapshotIo(String),
    /// The configured CDC method string is not one of the known methods.
    #[error("unsupported CDC method: {0}")]
    UnsupportedMethod(String),
    /// The run was cancelled between batches; nothing was written.
    #[error("run cancelled")]
    Cancelled,
}

/// CDC result type
pub type Result<T> = std::result::Result<T, CdcError>;
