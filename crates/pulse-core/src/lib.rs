//! pulse-core - Activity Synchronization Domain Model
//!
//! This library holds the backend-agnostic half of the pulse activity
//! synchronization core: the tracked-source and event model, the
//! commit/feed normalizer, the diff formatter, the sync configuration, and
//! the boundary traits through which the orchestrator talks to persistent
//! storage and the identity service.
//!
//! Everything here is free of I/O. Adapters (subprocess VCS invocation,
//! feed fetching) and the SQLite-backed stores live in `pulse-daemon`.
//!
//! # Modules
//!
//! - [`config`]: sync configuration parsed from TOML
//! - [`diff`]: stable plain-text rendering of raw unified diffs
//! - [`event`]: normalized events, natural keys and raw adapter records
//! - [`normalize`]: timestamp/title/author normalization into [`Event`]
//! - [`source`]: tracked sources, origins and the closed VCS kind set
//! - [`store`]: registry, event-store and identity boundary traits

pub mod config;
pub mod diff;
pub mod event;
pub mod normalize;
pub mod source;
pub mod store;

pub use config::{ConfigError, SyncConfig};
pub use event::{
    AuthorIdentity, Event, EventId, EventPayload, NaturalKey, RawCommit, RawFeedEntry,
};
pub use normalize::{normalize_commit, normalize_feed_entry, RawTimestamp};
pub use source::{SourceId, SourceOrigin, TrackedSource, UnsupportedVcs, VcsKind};
pub use store::{
    EventStore, IdentityResolver, NoIdentityResolver, SourceRegistry, StoreError, SyncStore,
    UserRef,
};
