/*!
Data structures shared by the CDC engine: rows, change sets and the
persisted per-table state blobs.
*/

pub mod changeset;
pub mod row;
pub mod state;
