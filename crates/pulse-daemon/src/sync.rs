//! The sync orchestrator: one source, one run, one atomic commit.
//!
//! For a tracked source the orchestrator dispatches to the right adapter,
//! normalizes what came back, drops candidates whose natural key is
//! already stored, and commits the survivors together with the advanced
//! high-water mark in a single transaction. A failure anywhere after
//! dispatch aborts the run for that source with no partial writes; the
//! next scheduled run retries naturally because the whole pipeline is
//! idempotent.

use std::path::PathBuf;
use std::sync::Arc;

use pulse_core::{
    normalize_commit, normalize_feed_entry, Event, IdentityResolver, SourceId, SourceOrigin,
    StoreError, SyncConfig, SyncStore, TrackedSource,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::feed::{FeedError, FeedSource};
use crate::vcs::{VcsBackend, VcsError};

/// Per-source sync failure. One source failing never affects another
/// source's run in the same batch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// Clone/update/extraction failure; retried next run.
    #[error(transparent)]
    Vcs(#[from] VcsError),

    /// Feed fetch or parse failure; retried next run.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Persistence failure; fatal for this source's run, nothing was
    /// written and the high-water mark did not move.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The clone root directory could not be prepared.
    #[error("failed to prepare clone root {path}: {error}")]
    CloneRoot {
        /// The configured root.
        path: PathBuf,
        /// Underlying io failure.
        error: std::io::Error,
    },
}

/// What one successful sync run did, for the operator report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The synced source.
    pub source_id: SourceId,
    /// Raw records the adapter produced.
    pub fetched: usize,
    /// Events that survived dedup and were persisted.
    pub inserted: usize,
    /// Whether this run performed the initial clone; `None` for feed
    /// sources.
    pub fresh_clone: Option<bool>,
}

/// Orchestrates sync runs against the boundary traits.
pub struct Orchestrator {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    resolver: Arc<dyn IdentityResolver>,
    vcs: Arc<dyn VcsBackend>,
    feed: Arc<dyn FeedSource>,
}

impl Orchestrator {
    /// Builds an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        resolver: Arc<dyn IdentityResolver>,
        vcs: Arc<dyn VcsBackend>,
        feed: Arc<dyn FeedSource>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            vcs,
            feed,
        }
    }

    /// The store this orchestrator commits into.
    #[must_use]
    pub fn store(&self) -> Arc<dyn SyncStore> {
        Arc::clone(&self.store)
    }

    /// The working-copy directory for a cloned source. Deterministic, so
    /// repeated runs target the same clone.
    #[must_use]
    pub fn clone_path(&self, source: &TrackedSource) -> PathBuf {
        self.config.clones_root.join(&source.slug)
    }

    fn ensure_clone_root(&self) -> Result<(), SyncError> {
        let path = &self.config.clones_root;
        let made_fresh = !path.is_dir();
        std::fs::create_dir_all(path).map_err(|error| SyncError::CloneRoot {
            path: path.clone(),
            error,
        })?;
        #[cfg(unix)]
        if made_fresh {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).map_err(
                |error| SyncError::CloneRoot {
                    path: path.clone(),
                    error,
                },
            )?;
        }
        Ok(())
    }

    /// Runs one sync for `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] when the adapter, normalization input or
    /// the commit fails; in every failure case the source's stored events
    /// and high-water mark are untouched.
    pub async fn sync_source(&self, source: &TrackedSource) -> Result<SyncOutcome, SyncError> {
        debug!(source = %source.id, slug = %source.slug, "sync starting");

        let (candidates, fresh_clone) = match &source.origin {
            SourceOrigin::Cloned { clone_url, vcs, .. } => {
                self.ensure_clone_root()?;
                let dest = self.clone_path(source);
                let clone = self.vcs.sync_repository(*vcs, clone_url, &dest).await?;
                let raw = self.vcs.extract_recent_commits(*vcs, &dest).await?;
                let events: Vec<Event> = raw
                    .iter()
                    .map(|commit| normalize_commit(commit, self.resolver.as_ref()))
                    .collect();
                (events, Some(clone.fresh))
            },
            SourceOrigin::Feed { feed_url } => {
                let raw = self.feed.fetch_feed(feed_url).await?;
                let events: Vec<Event> = raw
                    .iter()
                    .map(|entry| normalize_feed_entry(entry, self.resolver.as_ref()))
                    .collect();
                (events, None)
            },
        };
        let fetched = candidates.len();

        // The mark advances over every candidate, seen or not, so a
        // re-fetch of old history can never pull it backward and an
        // all-duplicate run leaves it where it was.
        let newest = candidates.iter().map(|event| event.timestamp).max();
        let mark = match (source.most_recent_event_time, newest) {
            (Some(old), Some(new)) if new > old => Some(new),
            (None, Some(new)) => Some(new),
            _ => None,
        };

        let seen = self.store.natural_keys(source.id)?;
        let fresh_events: Vec<Event> = candidates
            .into_iter()
            .filter(|event| !seen.contains(&event.natural_key.storage_key()))
            .collect();

        let inserted = self.store.commit_sync(source.id, &fresh_events, mark)?;

        info!(
            source = %source.id,
            slug = %source.slug,
            fetched,
            inserted,
            "sync committed"
        );

        Ok(SyncOutcome {
            source_id: source.id,
            fetched,
            inserted,
            fresh_clone,
        })
    }
}
