//! pulse-daemon - Activity Synchronization Daemon Library
//!
//! The I/O half of the pulse synchronization core: adapters that pull raw
//! activity out of external sources, the SQLite-backed stores, the
//! per-source orchestrator and the bounded-parallelism worker that runs
//! whole batches.
//!
//! # Modules
//!
//! - [`feed`]: HTTP feed fetch and RSS/Atom parsing
//! - [`store`]: SQLite source registry and event store
//! - [`sync`]: per-source orchestrator with the atomic commit step
//! - [`vcs`]: subprocess-backed VCS adapters (git, svn via git-svn, hg,
//!   bzr)
//! - [`worker`]: semaphore-bounded batch runner and periodic loop

pub mod feed;
pub mod store;
pub mod sync;
pub mod vcs;
pub mod worker;

pub use feed::{FeedAdapter, FeedError, FeedSource};
pub use store::SqliteStore;
pub use sync::{Orchestrator, SyncError, SyncOutcome};
pub use vcs::{CloneResult, VcsAdapter, VcsBackend, VcsError};
pub use worker::{BatchReport, ShutdownHandle, SourceLocks, SyncWorker};
