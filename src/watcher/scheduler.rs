//! Periodic poll driver.
//!
//! Each tick snapshots the pollable repositories and fans one
//! [`Watcher::refresh_one`] per repository out over a pool of `workers`
//! permits.  A tick only completes once the pool has drained; a tick that
//! fires while the previous one is still draining is dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Watcher;

/// Source of scheduler ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick.  `false` once the source is exhausted.
    async fn tick(&mut self) -> bool;
}

/// Wall-clock ticker.  The first tick fires immediately.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks on demand through the paired [`mpsc::Sender`].
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

impl ManualTicker {
    pub fn new() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(8);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every repository in the snapshot was polled.
    Completed { polled: usize },
    /// The previous tick was still draining.
    Skipped,
}

/// Clears the running flag when a tick ends, whichever way it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    watcher: Arc<Watcher>,
    workers: usize,
    running: AtomicBool,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(watcher: Arc<Watcher>, workers: usize) -> Self {
        Self {
            watcher,
            workers: workers.max(1),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        }
    }

    /// Start driving ticks from `ticker` on a background task.
    ///
    /// Each tick runs on its own task so that a slow tick never delays the
    /// ticker; overlapping ticks are rejected by [`run_tick`](Self::run_tick).
    pub fn start(self: &Arc<Self>, mut ticker: impl Ticker + 'static) {
        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            info!(workers = scheduler.workers, "scheduler started");
            let mut ticks = JoinSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    more = ticker.tick() => {
                        if !more {
                            break;
                        }
                        let scheduler = Arc::clone(&scheduler);
                        ticks.spawn(async move { scheduler.run_tick().await });
                    }
                    Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "tick task failed");
                        }
                    }
                }
            }
            // An in-flight tick runs to completion.
            while let Some(joined) = ticks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "tick task failed");
                }
            }
            info!("scheduler stopped");
        });

        let previous = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            warn!("scheduler restarted; aborting previous driver");
            previous.abort();
        }
    }

    /// Stop ticking and wait for the in-flight tick to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler driver failed");
            }
        }
    }

    /// Run one tick to completion, or skip it if another tick is running.
    pub async fn run_tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.watcher.metrics().ticks_skipped_total.inc();
            info!("previous tick still draining; skipping");
            return TickOutcome::Skipped;
        }
        let _running = RunningGuard(&self.running);

        let repositories = match self.watcher.store().find_active_repositories().await {
            Ok(repositories) => repositories,
            Err(e) => {
                error!(error = %format!("{e:#}"), "cannot load repositories");
                return TickOutcome::Completed { polled: 0 };
            }
        };
        self.watcher
            .metrics()
            .active_repositories
            .set(repositories.len() as i64);
        debug!(count = repositories.len(), "tick started");

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut polls = JoinSet::new();
        for repository in &repositories {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let watcher = Arc::clone(&self.watcher);
            let id = repository.id;
            polls.spawn(async move {
                let _permit = permit;
                if let Err(e) = watcher.refresh_one(id).await {
                    warn!(repository = id, error = %format!("{e:#}"), "poll could not complete");
                }
            });
        }

        let mut polled = 0;
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(()) => polled += 1,
                Err(e) => error!(error = %e, "poll task panicked"),
            }
        }
        debug!(polled, "tick finished");
        TickOutcome::Completed { polled }
    }
}
