//! Durable inventory of observed instances.
//!
//! [`InventoryStore`] is the contract the reconciler depends on; the
//! [`SqliteStore`] implementation keeps two relations, one row per observed
//! instance lifetime and one row per (instance id, tag key). Existence is
//! always scoped to non-terminated rows, so a terminated record is never
//! resurrected by a later upsert.

mod schema;
mod sqlite;

use thiserror::Error;

use crate::instance::Instance;

pub use schema::SCHEMA_VERSION;
pub use sqlite::{Clock, SqliteStore};

/// Errors raised by the inventory store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or configured.
    #[error("failed to open inventory database {path}: {message}")]
    Open {
        /// Database location.
        path: String,
        /// Underlying error text.
        message: String,
    },
    /// A statement failed to execute.
    #[error("inventory {operation} failed: {message}")]
    Query {
        /// Store operation that issued the statement.
        operation: &'static str,
        /// Underlying error text.
        message: String,
    },
    /// The database was created by an incompatible schema version.
    #[error("inventory schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version this build understands.
        expected: u32,
        /// Version recorded in the database.
        found: u32,
    },
    /// A stored row could not be decoded.
    #[error("stored record for {id} is corrupt: {message}")]
    Corrupt {
        /// Identifier of the offending row.
        id: String,
        /// Decoding error text.
        message: String,
    },
    /// A previous writer panicked while holding the connection.
    #[error("inventory connection lock poisoned")]
    Poisoned,
}

/// Persistent, keyed repository of [`Instance`] records.
///
/// Every write is atomic per call. Implementations serialise writes so that
/// no two operations touch the same id concurrently.
pub trait InventoryStore: Send + Sync {
    /// Returns `true` when a non-terminated row exists for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lookup fails.
    fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Inserts the instance, or updates the mutable fields of its active row.
    ///
    /// Inserts stamp `last_seen` with the current time; updates refresh it.
    /// Identity and creation-time fields are never rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails; nothing is applied.
    fn upsert(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Replaces every stored tag of the instance with its current mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails; nothing is applied.
    fn replace_tags(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Lists the ids of all non-terminated rows, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn active_instance_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Marks every listed id as terminated; unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails; nothing is applied.
    fn mark_terminated(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Loads the active record for `id`, tags included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or the row is corrupt.
    fn instance(&self, id: &str) -> Result<Option<Instance>, StoreError>;

    /// Lists stored records ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or a row is corrupt.
    fn list_instances(&self, include_terminated: bool) -> Result<Vec<Instance>, StoreError>;
}
