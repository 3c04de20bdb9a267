//! Background maintenance scheduler (spec §4.9).
//!
//! A single 1-hour interval timer gates a cleanup workflow behind two
//! conditions: the local clock hour matches `cleanup_hour`, and at least
//! 23 h have elapsed since the last run (or the caller forces it). The
//! workflow itself reuses [`crate::version::VersionService::delete`] so
//! scheduler-driven deletions go through the exact same lock/changelog path
//! a request-driven one would (spec §2 "Control flow": "the Scheduler runs
//! periodic workflows by invoking the same request path internally").
//!
//! Email notification (spec §4.9's monthly unreleased-pilot nudge) is
//! SMTP/alert plumbing, explicitly out of scope (spec §1) — this module logs
//! the would-be notification instead of sending one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::Res;
use crate::fleet::FleetClient;
use crate::store::Store;
use crate::title::Actor;
use crate::types::VersionState;
use crate::version::VersionService;

/// The tunables the scheduler needs out of [`crate::config::Config`],
/// kept as a narrow copy rather than taking the whole struct so this module
/// doesn't need to know about catalog/fleet credentials or TLS paths.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cleanup_hour: u32,
    pub deprecated_lifetime_days: i64,
    pub keep_skipped_versions: bool,
    pub unreleased_pilots_notification_days: i64,
}

/// The identity `ChangelogEntry`s record for scheduler-driven mutations —
/// there is no human admin behind a cleanup run.
fn scheduler_actor() -> Actor {
    Actor {
        admin: "xolo-scheduler".to_string(),
        host: "internal".to_string(),
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    fleet: Arc<dyn FleetClient>,
    versions: Arc<VersionService>,
    config: SchedulerConfig,
    last_run: AsyncMutex<Option<DateTime<Utc>>>,
    shutting_down: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, fleet: Arc<dyn FleetClient>, versions: Arc<VersionService>, config: SchedulerConfig) -> Self {
        Scheduler {
            store,
            fleet,
            versions,
            config,
            last_run: AsyncMutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Whether cleanup is eligible to run at `now`, given `last_run` (spec
    /// §4.9: "iff (a) local clock hour equals CLEANUP_HOUR, and (b) at least
    /// 23 h elapsed since last run, or force=true"). A free function so the
    /// gating logic is testable without waiting on a real clock.
    fn should_run(now: DateTime<Utc>, last_run: Option<DateTime<Utc>>, cleanup_hour: u32, force: bool) -> bool {
        if force {
            return true;
        }
        if now.hour() != cleanup_hour {
            return false;
        }
        match last_run {
            None => true,
            Some(prev) => now.signed_duration_since(prev) >= chrono::Duration::hours(23),
        }
    }

    /// Runs the hourly tick loop until `is_shutting_down` flips. Intended to
    /// be spawned once off [`crate::state::AppState`] (spec §5: "the
    /// Scheduler runs its timer on a dedicated worker").
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.maybe_run_cleanup(Utc::now(), false).await {
                warn!(error = %e, "scheduled cleanup run failed");
            }
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Runs cleanup if `should_run` says it's due (or `force` is set),
    /// recording `now` as the new `last_run` on completion. Returns whether
    /// cleanup actually ran.
    pub async fn maybe_run_cleanup(&self, now: DateTime<Utc>, force: bool) -> Res<bool> {
        let mut last_run = self.last_run.lock().await;
        if !Self::should_run(now, *last_run, self.config.cleanup_hour, force) {
            return Ok(false);
        }
        self.cleanup(now).await?;
        *last_run = Some(now);
        Ok(true)
    }

    /// spec §4.9 cleanup workflow.
    async fn cleanup(&self, now: DateTime<Utc>) -> Res<()> {
        info!("running scheduled cleanup");
        let actor = scheduler_actor();

        for title_slug in self.store.list_titles().await? {
            let title = self.store.load_title(&title_slug).await?;

            if let Some(ea_id) = &title.external_ids.fleet_ea_id {
                match self.fleet.ea_accepted(ea_id).await {
                    Ok(false) => {
                        if let Err(e) = self.fleet.submit_ea_acceptance(ea_id).await {
                            warn!(title = %title_slug, error = %e, "cleanup auto-accept failed");
                        }
                    }
                    Ok(true) => {}
                    Err(e) => warn!(title = %title_slug, error = %e, "cleanup ea_accepted check failed"),
                }
            }

            for version_slug in self.store.list_versions(&title_slug).await? {
                let v = self.store.load_version(&title_slug, &version_slug).await?;
                let should_delete = match v.state {
                    VersionState::Deprecated => {
                        self.config.deprecated_lifetime_days > 0
                            && v.deprecated_at
                                .map(|d| now.signed_duration_since(d) >= chrono::Duration::days(self.config.deprecated_lifetime_days))
                                .unwrap_or(false)
                    }
                    VersionState::Skipped => !self.config.keep_skipped_versions,
                    _ => false,
                };
                if should_delete {
                    info!(title = %title_slug, version = %version_slug, state = ?v.state, "cleanup deleting version");
                    self.versions.delete(&title_slug, &version_slug, &actor).await?;
                }
            }

            if now.day() == 1 {
                self.maybe_notify_unreleased_pilot(&title_slug, now).await?;
            }
        }

        Ok(())
    }

    async fn maybe_notify_unreleased_pilot(&self, title_slug: &str, now: DateTime<Utc>) -> Res<()> {
        let title = self.store.load_title(title_slug).await?;
        let Some(newest) = title.version_order.first() else {
            return Ok(());
        };
        let v = self.store.load_version(title_slug, newest).await?;
        if v.state != VersionState::Pilot {
            return Ok(());
        }
        let days_in_pilot = now.signed_duration_since(v.created_at).num_days();
        if days_in_pilot >= self.config.unreleased_pilots_notification_days {
            // Out of scope (spec §1): actually sending mail is SMTP plumbing
            // left to the surrounding deployment. This is the seam.
            warn!(
                title = %title_slug,
                version = %newest,
                days_in_pilot,
                "version has been in pilot past the notification threshold"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogClient, FakeCatalogClient};
    use crate::fleet::FakeFleetClient;
    use crate::lock::LockManager;
    use crate::pkg_deletion::PkgDeletionPool;
    use crate::title::{NewTitle, TitleService};
    use crate::types::{ExpirationPolicy, Requirement};
    use crate::version::NewVersion;
    use crate::watchers::WatcherRegistry;
    use tempfile::tempdir;

    fn actor() -> Actor {
        Actor {
            admin: "admin".into(),
            host: "test-host".into(),
        }
    }

    #[test]
    fn should_run_respects_hour_and_cooldown() {
        let hour2 = "2026-01-05T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let hour3 = "2026-01-05T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(Scheduler::should_run(hour2, None, 2, false));
        assert!(!Scheduler::should_run(hour3, None, 2, false));

        let next_day_hour2 = "2026-01-06T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!Scheduler::should_run(next_day_hour2, Some(hour2), 2, false));
        let enough_later = hour2 + chrono::Duration::hours(23);
        assert!(Scheduler::should_run(enough_later, Some(hour2), 2, false));
    }

    #[test]
    fn force_overrides_gating() {
        let now = "2026-01-05T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(Scheduler::should_run(now, Some(now), 2, true));
    }

    #[tokio::test]
    async fn cleanup_deletes_old_deprecated_version() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let locks = Arc::new(LockManager::new());
        let catalog: Arc<dyn CatalogClient> = Arc::new(FakeCatalogClient::new());
        let fleet: Arc<dyn FleetClient> = Arc::new(FakeFleetClient::new());
        let watchers = Arc::new(WatcherRegistry::new());
        let (pool, _worker) = PkgDeletionPool::spawn(Arc::clone(&fleet));

        let title_svc = TitleService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
            Arc::clone(&watchers),
        );
        let version_svc = Arc::new(VersionService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
            watchers,
            pool,
        ));

        title_svc
            .create(
                NewTitle {
                    title: "firefox".into(),
                    display_name: "Firefox".into(),
                    publisher: "Mozilla".into(),
                    requirement: Requirement::Script {
                        version_script: "#!/bin/sh\necho 1".into(),
                    },
                    self_service: false,
                    self_service_category: None,
                    description: None,
                    pilot_groups: vec!["pilots".into()],
                    release_groups: vec!["all-mac".into()],
                    excluded_groups: vec![],
                    uninstall: None,
                    expiration: ExpirationPolicy::default(),
                },
                &actor(),
            )
            .await
            .unwrap();
        version_svc
            .create(
                "firefox",
                NewVersion {
                    version: "1.0.0".into(),
                    min_os: "12.0".into(),
                    max_os: None,
                    reboot: false,
                    publish_date: None,
                    standalone: true,
                    pilot_groups: None,
                    killapps: vec![],
                    package_filename: None,
                },
                &actor(),
            )
            .await
            .unwrap();

        let mut v = store.load_version("firefox", "1.0.0").await.unwrap();
        v.state = VersionState::Deprecated;
        v.deprecated_at = Some(Utc::now() - chrono::Duration::days(60));
        store.save_version(&v).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            fleet,
            version_svc,
            SchedulerConfig {
                cleanup_hour: 2,
                deprecated_lifetime_days: 30,
                keep_skipped_versions: false,
                unreleased_pilots_notification_days: 180,
            },
        );
        let ran = scheduler.maybe_run_cleanup(Utc::now(), true).await.unwrap();
        assert!(ran);
        assert!(!store.version_exists("firefox", "1.0.0").await);
    }
}
