//! Batch runner and periodic worker.
//!
//! Every due source is an independent unit of work. A batch fans the
//! sources out over a semaphore-bounded set of tasks so clones and feed
//! fetches never overwhelm the network or local disk, while a keyed
//! per-source lock serializes concurrent syncs of the same source -
//! concurrent clone/update of one working copy is unsafe, but distinct
//! sources share nothing and run fully in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pulse_core::SourceId;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::sync::Orchestrator;

/// Keyed per-source locks. Lock values are created on first use and live
/// for the worker's lifetime; the set of tracked sources is small and
/// administrator-curated, so the map is never evicted.
#[derive(Default)]
pub struct SourceLocks {
    inner: Mutex<HashMap<SourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SourceLocks {
    /// Returns the lock guarding `id`, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which requires a prior
    /// panic while holding it.
    #[must_use]
    pub fn lock_for(&self, id: SourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("source lock map poisoned");
        Arc::clone(map.entry(id).or_default())
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Sources the batch attempted.
    pub attempted: usize,
    /// Sources that committed.
    pub succeeded: usize,
    /// Sources that failed and were skipped until the next run.
    pub failed: usize,
    /// Events inserted across the whole batch.
    pub inserted: usize,
}

/// Handle for stopping a running [`SyncWorker`] loop. The batch in
/// flight finishes before the loop exits; its commit is transactional
/// either way.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<tokio::sync::Notify>,
}

impl ShutdownHandle {
    /// Requests shutdown and wakes the loop if it is sleeping between
    /// batches.
    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
    }
}

/// Runs sync batches, either once or on a poll interval.
pub struct SyncWorker {
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
    poll_interval: std::time::Duration,
    locks: Arc<SourceLocks>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<tokio::sync::Notify>,
}

impl SyncWorker {
    /// Builds a worker around an orchestrator.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        concurrency: usize,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            orchestrator,
            concurrency,
            poll_interval,
            locks: Arc::new(SourceLocks::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Returns a handle for requesting shutdown of the periodic loop.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            wake: Arc::clone(&self.wake),
        }
    }

    /// Syncs every due source once. One source's failure never aborts
    /// another's sync; failures are logged with enough detail to diagnose
    /// the offending command.
    pub async fn run_once(&self) -> BatchReport {
        let sources = match self.orchestrator.store().list_due_sources() {
            Ok(sources) => sources,
            Err(e) => {
                warn!(error = %e, "failed to list due sources; skipping batch");
                return BatchReport::default();
            },
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let semaphore = Arc::clone(&semaphore);
            let orchestrator = Arc::clone(&self.orchestrator);
            let lock = self.locks.lock_for(source.id);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("batch semaphore closed");
                let _guard = lock.lock_owned().await;

                match orchestrator.sync_source(&source).await {
                    Ok(outcome) => Some(outcome.inserted),
                    Err(e) => {
                        warn!(
                            source = %source.id,
                            slug = %source.slug,
                            error = %e,
                            "sync failed; source skipped until next run"
                        );
                        None
                    },
                }
            }));
        }

        let mut report = BatchReport::default();
        for handle in handles {
            report.attempted += 1;
            match handle.await {
                Ok(Some(inserted)) => {
                    report.succeeded += 1;
                    report.inserted += inserted;
                },
                Ok(None) => report.failed += 1,
                Err(e) => {
                    warn!(error = %e, "sync task panicked");
                    report.failed += 1;
                },
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            inserted = report.inserted,
            "batch finished"
        );
        report
    }

    /// Runs batches on the poll interval until shutdown is requested.
    pub async fn run(&self) {
        info!(
            concurrency = self.concurrency,
            poll_interval_secs = self.poll_interval.as_secs(),
            "sync worker starting"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    self.run_once().await;
                },
                () = self.wake.notified() => break,
            }
        }

        info!("sync worker shutting down");
    }
}
