//! In-memory redirect index.
//!
//! Holds every active definition, partitioned by dimension and keyed by
//! source, behind a read/write lock. Reloads are wholesale: the snapshot
//! is fetched from the store outside the lock and swapped in under the
//! write lock, so request handlers never wait on store latency. A failed
//! reload keeps the previous snapshot in service.
//!
//! Lifecycle: [`RedirectIndex::new`] → [`load`](RedirectIndex::load) →
//! [`spawn_reloader`](RedirectIndex::spawn_reloader) →
//! [`ReloadTask::shutdown`].

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use redirects_core::store::{DimensionSnapshot, RedirectStore};
use redirects_core::{Dimension, RedirectDefinition, RedirectError, Result};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::signal::{drain_pending, recv_signal, Received};

pub struct RedirectIndex {
    store: Arc<dyn RedirectStore>,
    timeout: Duration,
    snapshot: RwLock<DimensionSnapshot>,
}

impl RedirectIndex {
    /// Creates an empty index; call [`load`](Self::load) before serving.
    pub fn new(store: Arc<dyn RedirectStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            snapshot: RwLock::new(DimensionSnapshot::new()),
        }
    }

    /// Reloads every active definition from the store.
    ///
    /// Returns the number of definitions now in the index. On failure the
    /// previous snapshot stays in place and the error is returned.
    pub async fn load(&self) -> Result<usize> {
        let fetched = match tokio::time::timeout(self.timeout, self.store.find_all(true)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                error!(error = %e, "redirect index reload failed, keeping previous snapshot");
                return Err(e);
            }
            Err(_) => {
                let e = RedirectError::unavailable(format!(
                    "store did not answer within {:?}",
                    self.timeout
                ));
                error!(error = %e, "redirect index reload timed out, keeping previous snapshot");
                return Err(e);
            }
        };

        let count = count_definitions(&fetched);
        let dimensions = fetched.len();
        let previous = {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, fetched)
        };
        drop(previous);

        info!(definitions = count, dimensions, "redirect index loaded");
        Ok(count)
    }

    /// Looks up the definition for `source` in one dimension.
    pub fn lookup(&self, dimension: &str, source: &str) -> Option<RedirectDefinition> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(dimension)?.get(source).cloned()
    }

    /// Total number of definitions across all dimensions.
    pub fn len(&self) -> usize {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        count_definitions(&guard)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensions present in the current snapshot, sorted.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        let mut dims: Vec<Dimension> = guard.keys().cloned().collect();
        dims.sort();
        dims
    }

    /// Starts the background reload loop.
    ///
    /// The loop reloads on every signal from `receiver` and, when
    /// `poll_interval` is set, periodically. Signals that queued up while
    /// waiting are drained first, so a burst results in one reload.
    pub fn spawn_reloader(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<()>,
        poll_interval: Option<Duration>,
    ) -> ReloadTask {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let index = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = poll_interval.map(|period| {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = recv_signal(&mut receiver) => {
                        if received == Received::Closed {
                            info!("update signal closed, stopping redirect index reloader");
                            break;
                        }
                        let coalesced = drain_pending(&mut receiver);
                        debug!(coalesced, "reloading redirect index after update signal");
                    }
                    _ = next_tick(&mut ticker) => {
                        debug!("periodic redirect index reload");
                    }
                }

                // Failures are logged by load(); the previous snapshot keeps serving.
                let _ = index.load().await;
            }
        });

        ReloadTask {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }
}

fn count_definitions(snapshot: &DimensionSnapshot) -> usize {
    snapshot.values().map(|by_source| by_source.len()).sum()
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle to the background reload loop. Dropping it also stops the loop.
pub struct ReloadTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ReloadTask {
    /// Stops the loop and waits for it to finish; the subscription is
    /// released with it.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "redirect index reloader ended abnormally");
        }
    }
}
