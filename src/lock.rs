//! Per-title and per-version advisory locking (spec §4.2).
//!
//! The spec's source material polls every ~300ms; Design Note §9 asks the
//! implementation to prefer a map of condition variables keyed by title with
//! TTL-based supervisory sweep instead, while preserving the external
//! contract (60 minute TTL, one holder per entity at a time). That's what
//! this module does: each title gets a [`tokio::sync::Notify`] that waiters
//! subscribe to, with a bounded poll as a safety net against missed
//! wakeups (lost wakeup is otherwise fatal to a pure condvar design).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Res, XoloError};

/// How long a held lock remains valid before a sweep considers it orphaned.
pub const LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on how long a waiter sleeps between retries if it never
/// observes a wakeup notification (belt-and-braces against a missed
/// `notify_waiters`).
const POLL_FALLBACK: Duration = Duration::from_millis(300);

struct TitleLock {
    expires_at: Option<Instant>,
    versions: HashMap<String, Instant>,
    notify: Arc<Notify>,
}

impl TitleLock {
    fn new() -> Self {
        TitleLock {
            expires_at: None,
            versions: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.expires_at.is_none() && self.versions.is_empty()
    }
}

/// Owns the title/version lock table and the per-title changelog RW locks.
///
/// A single instance lives in [`crate::state::AppState`] for the lifetime of
/// the process; there is deliberately no hidden module-level static (Design
/// Note §9).
pub struct LockManager {
    entity_locks: StdMutex<HashMap<String, TitleLock>>,
    changelog_locks: StdMutex<HashMap<String, Arc<RwLock<()>>>>,
    shutting_down: AtomicBool,
}

/// RAII handle to a held title lock. Releasing happens on drop; callers
/// never call an explicit `release`.
pub struct TitleGuard {
    manager: Arc<LockManager>,
    title: String,
}

/// RAII handle to a held (title, version) lock. Holding this implies the
/// caller also holds (or is about to acquire) the parent [`TitleGuard`];
/// the two are usually acquired together via
/// [`LockManager::acquire_title_and_version`].
pub struct VersionGuard {
    manager: Arc<LockManager>,
    title: String,
    version: String,
}

impl Drop for TitleGuard {
    fn drop(&mut self) {
        self.manager.release_title(&self.title);
    }
}

impl Drop for VersionGuard {
    fn drop(&mut self) {
        self.manager.release_version(&self.title, &self.version);
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            entity_locks: StdMutex::new(HashMap::new()),
            changelog_locks: StdMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Sweeps every title/version lock whose TTL has elapsed without an
    /// explicit release, per spec §4.2 ("Expired locks are swept
    /// opportunistically ... by `remove_expired_object_locks`").
    pub fn remove_expired_object_locks(&self) {
        let now = Instant::now();
        let mut map = self.entity_locks.lock().unwrap();
        let mut to_notify = Vec::new();
        map.retain(|title, lock| {
            if let Some(exp) = lock.expires_at {
                if exp <= now {
                    warn!(title = %title, "sweeping expired title lock");
                    lock.expires_at = None;
                }
            }
            let before = lock.versions.len();
            lock.versions.retain(|_, exp| *exp > now);
            if lock.versions.len() != before {
                warn!(title = %title, "sweeping expired version lock(s)");
            }
            if !lock.is_empty() {
                to_notify.push(lock.notify.clone());
            }
            !lock.is_empty()
        });
        drop(map);
        for n in to_notify {
            n.notify_waiters();
        }
    }

    /// Acquires the title-scoped lock, waiting for any current holder's TTL
    /// to elapse or for an explicit release. Returns `Err(Server)` if the
    /// server is shutting down (spec §4.2, §5).
    pub async fn acquire_title(self: &Arc<Self>, title: &str) -> Res<TitleGuard> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(XoloError::Server("server is shutting down".into()));
            }
            self.remove_expired_object_locks();

            let wait_on = {
                let mut map = self.entity_locks.lock().unwrap();
                let entry = map.entry(title.to_string()).or_insert_with(TitleLock::new);
                let now = Instant::now();
                let free = entry.expires_at.is_none_or(|exp| exp <= now);
                if free {
                    entry.expires_at = Some(now + LOCK_TTL);
                    debug!(title = %title, "acquired title lock");
                    None
                } else {
                    Some(entry.notify.clone())
                }
            };

            match wait_on {
                None => {
                    return Ok(TitleGuard {
                        manager: Arc::clone(self),
                        title: title.to_string(),
                    });
                }
                Some(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(POLL_FALLBACK) => {}
                    }
                }
            }
        }
    }

    /// Acquires the version-scoped lock. The caller must already hold the
    /// title lock (`_title_guard` enforces this at the type level and is
    /// otherwise unused) — spec §4.2's ordering rule (title before version)
    /// is structural, not merely documented.
    pub async fn acquire_version(
        self: &Arc<Self>,
        _title_guard: &TitleGuard,
        title: &str,
        version: &str,
    ) -> Res<VersionGuard> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(XoloError::Server("server is shutting down".into()));
            }
            self.remove_expired_object_locks();

            let wait_on = {
                let mut map = self.entity_locks.lock().unwrap();
                let entry = map.entry(title.to_string()).or_insert_with(TitleLock::new);
                let now = Instant::now();
                let free = entry
                    .versions
                    .get(version)
                    .is_none_or(|exp| *exp <= now);
                if free {
                    entry.versions.insert(version.to_string(), now + LOCK_TTL);
                    debug!(title = %title, version = %version, "acquired version lock");
                    None
                } else {
                    Some(entry.notify.clone())
                }
            };

            match wait_on {
                None => {
                    return Ok(VersionGuard {
                        manager: Arc::clone(self),
                        title: title.to_string(),
                        version: version.to_string(),
                    });
                }
                Some(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(POLL_FALLBACK) => {}
                    }
                }
            }
        }
    }

    /// Convenience wrapper acquiring both locks in the mandated order.
    pub async fn acquire_title_and_version(
        self: &Arc<Self>,
        title: &str,
        version: &str,
    ) -> Res<(TitleGuard, VersionGuard)> {
        let title_guard = self.acquire_title(title).await?;
        let version_guard = self.acquire_version(&title_guard, title, version).await?;
        Ok((title_guard, version_guard))
    }

    fn release_title(&self, title: &str) {
        let notify = {
            let mut map = self.entity_locks.lock().unwrap();
            if let Some(lock) = map.get_mut(title) {
                lock.expires_at = None;
                debug!(title = %title, "released title lock");
                let notify = lock.notify.clone();
                if lock.is_empty() {
                    map.remove(title);
                }
                Some(notify)
            } else {
                None
            }
        };
        if let Some(n) = notify {
            n.notify_waiters();
        }
    }

    fn release_version(&self, title: &str, version: &str) {
        let notify = {
            let mut map = self.entity_locks.lock().unwrap();
            if let Some(lock) = map.get_mut(title) {
                lock.versions.remove(version);
                debug!(title = %title, version = %version, "released version lock");
                let notify = lock.notify.clone();
                if lock.is_empty() {
                    map.remove(title);
                }
                Some(notify)
            } else {
                None
            }
        };
        if let Some(n) = notify {
            n.notify_waiters();
        }
    }

    /// Returns the reentrant-by-construction changelog RW lock for `title`,
    /// creating one on first use. Reentrancy here means: a single `write()`
    /// critical section is allowed to call private helpers that would
    /// otherwise need their own read lock, because the call graph is
    /// structured to acquire the lock exactly once per operation rather
    /// than relying on the lock implementation itself being reentrant
    /// (Design Note §9).
    fn changelog_lock(&self, title: &str) -> Arc<RwLock<()>> {
        let mut map = self.changelog_locks.lock().unwrap();
        map.entry(title.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub async fn changelog_read(&self, title: &str) -> tokio::sync::OwnedRwLockReadGuard<()> {
        self.changelog_lock(title).read_owned().await
    }

    pub async fn changelog_write(&self, title: &str) -> tokio::sync::OwnedRwLockWriteGuard<()> {
        self.changelog_lock(title).write_owned().await
    }

    /// Drops the changelog lock entry for a deleted title so the map does
    /// not grow without bound across the lifetime of the process.
    pub fn forget_changelog_lock(&self, title: &str) {
        self.changelog_locks.lock().unwrap().remove(title);
    }

    /// Number of titles currently holding a live title or version lock —
    /// surfaced by the `/state` admin route.
    pub fn active_lock_count(&self) -> usize {
        self.entity_locks.lock().unwrap().len()
    }

    /// Refuses further acquisitions and begins the shutdown wait described
    /// in spec §5: poll until every entity lock has cleared or its TTL has
    /// elapsed, logging progress.
    pub async fn begin_shutdown_and_wait(&self, poll_interval: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("lock manager: shutdown started, waiting for entity locks to clear");
        loop {
            self.remove_expired_object_locks();
            let remaining = self.entity_locks.lock().unwrap().len();
            if remaining == 0 {
                info!("lock manager: all entity locks clear");
                return;
            }
            info!(remaining, "lock manager: waiting for entity locks to clear");
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn second_acquire_blocks_until_first_releases() {
        let mgr = Arc::new(LockManager::new());
        let guard = mgr.acquire_title("firefox").await.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = tokio::spawn(async move { mgr2.acquire_title("firefox").await });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let second_guard = waiter.await.unwrap().unwrap();
        drop(second_guard);
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let mgr = Arc::new(LockManager::new());
        {
            let mut map = mgr.entity_locks.lock().unwrap();
            let mut lock = TitleLock::new();
            lock.expires_at = Some(Instant::now() - StdDuration::from_secs(1));
            map.insert("stale".to_string(), lock);
        }
        let guard = mgr.acquire_title("stale").await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn title_then_version_ordering_is_enforced_by_types() {
        let mgr = Arc::new(LockManager::new());
        let (t, v) = mgr.acquire_title_and_version("firefox", "1.0.0").await.unwrap();
        drop(v);
        drop(t);
    }
}
