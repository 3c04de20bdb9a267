//! Bounded-time background watchers (spec §4.7).
//!
//! Two flavours: the patch-visibility watcher (started after `Version.create`)
//! and the EA-acceptance watcher (started whenever a title's requirement
//! becomes or changes EA). Both are idempotent — re-entering the workflow
//! that would start one must not spawn a second watcher while one is alive
//! for the same entity (spec §4.7, Design Note §9) — so each watcher kind
//! keeps a set of live keys guarding against double-spawn.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::catalog::CatalogClient;
use crate::fleet::FleetClient;

/// How often the patch-visibility watcher polls Catalog (spec §4.7.1).
const PATCH_VISIBILITY_POLL: Duration = Duration::from_secs(15);
/// How often the EA-acceptance watcher polls Fleet (spec §4.7.2).
const EA_ACCEPTANCE_POLL: Duration = Duration::from_secs(30);

/// Outcome handed back to the caller once a patch-visibility watcher settles,
/// so `Version.create`'s workflow can finish building the patch policy (spec
/// §4.7.1: "When visible, assign the package to the patch version in Fleet,
/// then create the patch policy").
pub enum PatchVisibilityOutcome {
    Visible,
    TimedOut,
}

/// Tracks live watcher keys so a second call for the same (title[, version])
/// is a no-op rather than a duplicate background task.
#[derive(Default)]
struct LiveSets {
    patch_visibility: HashSet<(String, String)>,
    ea_acceptance: HashSet<String>,
}

/// Owns every outstanding patch-visibility and EA-acceptance watcher. A
/// single instance lives in [`crate::state::AppState`] for the process
/// lifetime (Design Note §9: no hidden module-level singleton).
pub struct WatcherRegistry {
    live: StdMutex<LiveSets>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    max_wait: Duration,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        WatcherRegistry {
            live: StdMutex::new(LiveSets::default()),
            handles: StdMutex::new(Vec::new()),
            max_wait: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_max_wait(max_wait: Duration) -> Self {
        WatcherRegistry {
            live: StdMutex::new(LiveSets::default()),
            handles: StdMutex::new(Vec::new()),
            max_wait,
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of watcher tasks still running — surfaced by `/state`.
    pub fn active_count(&self) -> usize {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Starts a patch-visibility watcher for `(title, version)` unless one is
    /// already running for that key. `on_visible` runs once the patch
    /// becomes visible and is where the caller assigns the package and
    /// creates the patch policy (spec §4.7.1).
    pub fn start_patch_visibility_watcher<F, Fut>(
        self: &Arc<Self>,
        catalog: Arc<dyn CatalogClient>,
        title: String,
        version: String,
        patch_id: String,
        on_visible: F,
    ) where
        F: FnOnce(PatchVisibilityOutcome) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = (title.clone(), version.clone());
        {
            let mut live = self.live.lock().unwrap();
            if live.patch_visibility.contains(&key) {
                info!(title = %title, version = %version, "patch-visibility watcher already running, skipping");
                return;
            }
            live.patch_visibility.insert(key.clone());
        }

        let registry = Arc::clone(self);
        let max_wait = self.max_wait;
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + max_wait;
            let outcome = loop {
                match catalog.patch_is_visible(&patch_id).await {
                    Ok(true) => break PatchVisibilityOutcome::Visible,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(title = %title, version = %version, error = %e, "patch-visibility poll failed, retrying");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    error!(
                        alert = true,
                        title = %title,
                        version = %version,
                        "patch-visibility watcher timed out waiting for catalog"
                    );
                    break PatchVisibilityOutcome::TimedOut;
                }
                tokio::time::sleep(PATCH_VISIBILITY_POLL).await;
            };
            on_visible(outcome).await;
            registry.live.lock().unwrap().patch_visibility.remove(&key);
        });
        self.track(handle);
    }

    /// Starts an EA-acceptance watcher for `ea_id` unless one is already
    /// running for this title. Submits acceptance as soon as Fleet reports
    /// `accepted=false` — i.e. has noticed the Catalog-side change (spec
    /// §4.7.2).
    pub fn start_ea_acceptance_watcher(self: &Arc<Self>, fleet: Arc<dyn FleetClient>, title: String, ea_id: String) {
        {
            let mut live = self.live.lock().unwrap();
            if live.ea_acceptance.contains(&title) {
                info!(title = %title, "ea-acceptance watcher already running, skipping");
                return;
            }
            live.ea_acceptance.insert(title.clone());
        }

        let registry = Arc::clone(self);
        let max_wait = self.max_wait;
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + max_wait;
            loop {
                match fleet.ea_accepted(&ea_id).await {
                    Ok(false) => {
                        if let Err(e) = fleet.submit_ea_acceptance(&ea_id).await {
                            warn!(title = %title, error = %e, "submitting ea acceptance failed, retrying");
                        } else {
                            info!(title = %title, ea_id = %ea_id, "ea acceptance submitted");
                            break;
                        }
                    }
                    Ok(true) => {
                        // Already accepted; nothing to do.
                        break;
                    }
                    Err(e) => {
                        warn!(title = %title, error = %e, "ea-accepted poll failed, retrying");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    error!(alert = true, title = %title, ea_id = %ea_id, "ea-acceptance watcher timed out");
                    break;
                }
                tokio::time::sleep(EA_ACCEPTANCE_POLL).await;
            }
            registry.live.lock().unwrap().ea_acceptance.remove(&title);
        });
        self.track(handle);
    }

    /// Awaits (bounded by `budget`) every outstanding watcher — part of the
    /// shutdown sequence (spec §5).
    pub async fn drain(&self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let remaining = self.active_count();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                if remaining > 0 {
                    warn!(remaining, "shutdown proceeding with watchers still outstanding");
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogClient;
    use crate::fleet::FakeFleetClient;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn patch_visibility_watcher_fires_on_visible() {
        let catalog = Arc::new(FakeCatalogClient::new());
        let title_id = catalog.create_title("firefox", "Firefox", "Mozilla").await.unwrap();
        let patch = catalog.create_patch(&title_id, "120.0").await.unwrap();

        let registry = Arc::new(WatcherRegistry::with_max_wait(Duration::from_secs(2)));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);

        registry.start_patch_visibility_watcher(
            catalog.clone(),
            "firefox".into(),
            "120.0".into(),
            patch.id.clone(),
            move |outcome| async move {
                if matches!(outcome, PatchVisibilityOutcome::Visible) {
                    fired2.store(true, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        catalog.set_visible(&patch.id, true);
        tokio::time::sleep(Duration::from_millis(200)).await;

        registry.drain(Duration::from_secs(1)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ea_acceptance_watcher_submits_once() {
        let fleet = Arc::new(FakeFleetClient::new());
        let ea_id = fleet.create_ea("xolo-firefox-ea", "#!/bin/sh\necho 1").await.unwrap();
        let registry = Arc::new(WatcherRegistry::with_max_wait(Duration::from_secs(2)));

        registry.start_ea_acceptance_watcher(fleet.clone(), "firefox".into(), ea_id.clone());
        registry.drain(Duration::from_secs(1)).await;

        assert!(fleet.ea_accepted(&ea_id).await.unwrap());
    }

    #[test]
    fn double_start_for_same_key_is_ignored() {
        let registry = Arc::new(WatcherRegistry::new());
        let fleet = Arc::new(FakeFleetClient::new());
        registry.start_ea_acceptance_watcher(fleet.clone(), "firefox".into(), "ea-1".into());
        // second call for the same title while the first is still tracked
        // as live must not register a second handle.
        registry.start_ea_acceptance_watcher(fleet, "firefox".into(), "ea-1".into());
        assert!(registry.active_count() <= 1);
    }
}
