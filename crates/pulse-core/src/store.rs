//! Boundary traits between the synchronization core and its collaborators.
//!
//! The orchestrator never touches storage or the user database directly:
//! it reads and writes tracked sources through [`SourceRegistry`], events
//! through [`EventStore`], and resolves authors through
//! [`IdentityResolver`]. The atomic commit of a sync run goes through
//! [`SyncStore::commit_sync`], which implementations must make
//! all-or-nothing.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;
use crate::source::{SourceId, TrackedSource};

/// Reference to a registered user, produced by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Stable user id in the enclosing system.
    pub id: u64,
    /// Login/handle, used for display.
    pub login: String,
}

/// Errors raised by the persistent stores.
///
/// Any of these during the commit step is fatal for that source's run: no
/// partial state may remain and the high-water mark must not advance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Referenced source does not exist.
    #[error("source not found: {0}")]
    SourceNotFound(SourceId),
}

/// Read/write access to tracked-source records.
pub trait SourceRegistry: Send + Sync {
    /// Returns every source due for a sync run.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry cannot be read.
    fn list_due_sources(&self) -> Result<Vec<TrackedSource>, StoreError>;

    /// Looks up one source by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry cannot be read.
    fn get_source(&self, id: SourceId) -> Result<Option<TrackedSource>, StoreError>;

    /// Inserts or replaces a source record. Called from the administration
    /// boundary, not from sync runs.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    fn register_source(&self, source: &TrackedSource) -> Result<(), StoreError>;

    /// Advances the high-water mark for a source.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails or the source is unknown.
    fn update_high_water_mark(
        &self,
        id: SourceId,
        mark: NaiveDateTime,
    ) -> Result<(), StoreError>;
}

/// Append-only access to normalized events.
pub trait EventStore: Send + Sync {
    /// Appends events for a source, ignoring any whose natural key is
    /// already present. Returns how many were actually inserted.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    fn append_events(&self, source_id: SourceId, events: &[Event]) -> Result<usize, StoreError>;

    /// Returns the storage keys of every event already recorded for a
    /// source.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    fn natural_keys(&self, source_id: SourceId) -> Result<HashSet<String>, StoreError>;

    /// Returns a source's events ordered newest-first.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    fn events_for_source(&self, source_id: SourceId) -> Result<Vec<Event>, StoreError>;
}

/// Combined store handle the orchestrator runs against.
pub trait SyncStore: SourceRegistry + EventStore {
    /// Commits one sync run atomically: appends `events` (duplicates
    /// ignored) and advances the high-water mark when `mark` is given.
    /// Returns how many events were inserted.
    ///
    /// Either everything in the run is persisted or nothing is.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction fails; implementations must
    /// roll back completely in that case.
    fn commit_sync(
        &self,
        source_id: SourceId,
        events: &[Event],
        mark: Option<NaiveDateTime>,
    ) -> Result<usize, StoreError>;
}

/// Author lookup against the enclosing system's user database.
pub trait IdentityResolver: Send + Sync {
    /// Resolves a backend-reported author name or handle to a registered
    /// user, if one matches.
    fn find_user_by_identity(&self, name_or_handle: &str) -> Option<UserRef>;
}

/// Identity resolver for deployments without a user database: every author
/// stays a free-text name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentityResolver;

impl IdentityResolver for NoIdentityResolver {
    fn find_user_by_identity(&self, _name_or_handle: &str) -> Option<UserRef> {
        None
    }
}
