//! Package deletion worker pool (spec §4.8).
//!
//! Fleet package deletions are minute-scale, so `Version.delete` submits them
//! here instead of blocking the request on the call. One process-wide pool
//! serialises deletions (the source material runs them one at a time; a
//! single worker loop reproduces that without inventing unbounded
//! parallelism Fleet was never sized for). Submissions return immediately;
//! shutdown drains the queue bounded by `MAX_WAIT_FOR_PKG_DELETION`, then
//! abandons whatever remains.
//!
//! Draining polls an outstanding-job counter rather than closing the
//! channel: [`PkgDeletionPool`] is cloned into every caller that can submit
//! a job (e.g. [`crate::version::VersionService`]) and those clones outlive
//! a single shutdown call, so the channel itself never actually closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::fleet::FleetClient;

enum Job {
    Delete { package_id: String, title: String },
}

/// Handle to the single process-wide deletion pool. Cheap to clone; every
/// clone shares the same outstanding-job counter and channel.
#[derive(Clone)]
pub struct PkgDeletionPool {
    tx: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
}

impl PkgDeletionPool {
    /// Spawns the worker loop and returns a handle plus its `JoinHandle` so
    /// the caller can await it during shutdown.
    pub fn spawn(fleet: Arc<dyn FleetClient>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let worker_outstanding = Arc::clone(&outstanding);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Delete { package_id, title } => {
                        info!(title = %title, package_id = %package_id, "deleting fleet package");
                        if let Err(e) = fleet.delete_package(&package_id).await {
                            error!(
                                alert = true,
                                title = %title,
                                package_id = %package_id,
                                error = %e,
                                "package deletion failed"
                            );
                        } else {
                            info!(title = %title, package_id = %package_id, "fleet package deleted");
                        }
                    }
                }
                worker_outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        });
        (PkgDeletionPool { tx, outstanding }, worker)
    }

    /// Enqueues a package for deletion. Returns immediately — admins are
    /// told (via changelog/alert) to wait or watch alerts before reusing a
    /// package name (spec §4.8).
    pub fn submit(&self, title: impl Into<String>, package_id: impl Into<String>) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Job::Delete {
                package_id: package_id.into(),
                title: title.into(),
            })
            .is_err()
        {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Jobs submitted but not yet finished — surfaced by `/state` and used
    /// by [`drain`].
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Polls the pool's outstanding-job counter until it drains to zero or
/// `budget` elapses, then abandons whatever remains rather than awaiting the
/// worker task itself (spec §4.8, §5).
pub async fn drain(pool: PkgDeletionPool, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = pool.outstanding_count();
        if remaining == 0 {
            info!("package deletion pool drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining, "package deletion pool drain budget exceeded, abandoning remaining jobs");
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FakeFleetClient;

    #[tokio::test]
    async fn submitted_deletion_eventually_runs() {
        let fleet = Arc::new(FakeFleetClient::new());
        let package_id = fleet.create_package("firefox", "120.0", "firefox.pkg").await.unwrap();
        let (pool, _worker) = PkgDeletionPool::spawn(fleet.clone());

        pool.submit("firefox", package_id.clone());
        drain(pool, Duration::from_secs(2)).await;

        assert!(fleet.fetch_package(&package_id).await.unwrap().is_none());
    }
}
