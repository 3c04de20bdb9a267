//! The release state machine (spec §4.6 "Release state machine", §8
//! scenarios 1–2).
//!
//! `release(title, V)` walks every version of a title oldest-first so that
//! no two versions are ever simultaneously `released` (spec §5 ordering
//! guarantee), applying one of three transitions depending on where a
//! version sits relative to `V` in `version_order`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::catalog::CatalogClient;
use crate::changelog::Changelog;
use crate::error::{Res, XoloError};
use crate::fleet::{FleetClient, PolicyOptions, PolicyScope};
use crate::lock::LockManager;
use crate::store::Store;
use crate::title::{exclusions_with_frozen, Actor};
use crate::types::{ChangelogEntry, Title, Version, VersionState};

pub struct ReleaseEngine {
    pub store: Arc<Store>,
    pub locks: Arc<LockManager>,
    pub catalog: Arc<dyn CatalogClient>,
    pub fleet: Arc<dyn FleetClient>,
}

impl ReleaseEngine {
    pub fn new(store: Arc<Store>, locks: Arc<LockManager>, catalog: Arc<dyn CatalogClient>, fleet: Arc<dyn FleetClient>) -> Self {
        ReleaseEngine {
            store,
            locks,
            catalog,
            fleet,
        }
    }

    /// spec §4.6 "Release state machine". `rollback` is true when `target`
    /// sits behind the title's current `released_version` in `version_order`
    /// — the caller decides this (spec §9 open question (b): `rollback` is
    /// only ever set from the rollback branch, never guessed here).
    pub async fn release(&self, title_slug: &str, target: &str, rollback: bool, actor: &Actor) -> Res<Title> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;

        let mut title = self.store.load_title(title_slug).await?;
        if !title.version_order.iter().any(|v| v == target) {
            return Err(XoloError::NotFound(format!(
                "version '{title_slug}' '{target}' not found"
            )));
        }

        let target_version = self.store.load_version(title_slug, target).await?;
        if target_version.state == VersionState::Released {
            return Err(XoloError::InvalidData(format!("version '{target}' is already released")));
        }

        let index: HashMap<String, usize> = title
            .version_order
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        let target_idx = index[target];

        // Oldest first, so no intermediate state ever shows two versions
        // simultaneously `released` (spec §5, §4.6).
        for version_slug in title.version_order.clone().into_iter().rev() {
            let mut v = self.store.load_version(title_slug, &version_slug).await?;
            let v_idx = index[&version_slug];

            if version_slug == target {
                self.promote_to_released(&title, &mut v, rollback).await?;
            } else if v_idx > target_idx {
                // Older than the target.
                match v.state {
                    VersionState::Released => self.demote(&title, &mut v, VersionState::Deprecated).await?,
                    VersionState::Pilot => self.demote(&title, &mut v, VersionState::Skipped).await?,
                    _ => {}
                }
            } else if rollback && matches!(v.state, VersionState::Deprecated | VersionState::Skipped) {
                // Newer than the target: only restored to pilot on rollback.
                self.reset_to_pilot(&title, &mut v).await?;
            }

            self.store.save_version(&v).await?;
        }

        title.released_version = Some(target.to_string());
        self.store.save_title(&title).await?;

        let _guard = self.locks.changelog_write(title_slug).await;
        Changelog::new(&self.store, title_slug)
            .append(&ChangelogEntry::message(
                &actor.admin,
                &actor.host,
                format!("version released: {target}"),
            ))
            .await?;
        drop(_guard);

        info!(title = %title_slug, version = %target, rollback, "release transition applied");
        Ok(title)
    }

    async fn promote_to_released(&self, title: &Title, v: &mut Version, rollback: bool) -> Res<()> {
        v.state = VersionState::Released;
        v.allow_downgrade = rollback;

        if let Some(patch_id) = &v.external_ids.catalog_patch_id {
            self.catalog.enable_patch(patch_id).await?;
        }

        let options = PolicyOptions {
            package_id: v.external_ids.fleet_package_id.clone(),
            self_service: title.self_service,
            allow_downgrade: rollback,
            reboot: v.reboot,
        };
        let excluded = exclusions_with_frozen(title);
        if let Some(manual_id) = &v.external_ids.fleet_manual_install_policy_id {
            let scope = PolicyScope {
                target_groups: vec![crate::version::ALL_COMPUTERS.to_string()],
                excluded_groups: excluded.clone(),
            };
            self.fleet.update_policy(manual_id, &scope, &options).await?;
        }
        if let Some(patch_policy_id) = &v.external_ids.fleet_patch_policy_id {
            let scope = PolicyScope {
                target_groups: title.release_groups.clone(),
                excluded_groups: excluded,
            };
            self.fleet.update_policy(patch_policy_id, &scope, &options).await?;
        }
        Ok(())
    }

    /// Released→deprecated or pilot→skipped: stop further auto-installs by
    /// clearing the auto-install policy's targets (spec §4.6 step for
    /// `vobj < V`).
    async fn demote(&self, title: &Title, v: &mut Version, state: VersionState) -> Res<()> {
        v.state = state;
        if state == VersionState::Deprecated {
            v.deprecated_at = Some(Utc::now());
        }
        if let Some(auto_id) = &v.external_ids.fleet_auto_install_policy_id {
            let excluded = exclusions_with_frozen(title);
            let scope = PolicyScope {
                target_groups: vec![],
                excluded_groups: excluded,
            };
            let options = PolicyOptions {
                package_id: v.external_ids.fleet_package_id.clone(),
                self_service: false,
                allow_downgrade: v.allow_downgrade,
                reboot: v.reboot,
            };
            self.fleet.update_policy(auto_id, &scope, &options).await?;
        }
        Ok(())
    }

    /// Deprecated/skipped→pilot on rollback: restore pilot-group scope,
    /// remove from self-service, disable `allow_downgrade` (spec §4.6
    /// `vobj > V` rollback branch).
    async fn reset_to_pilot(&self, title: &Title, v: &mut Version) -> Res<()> {
        v.state = VersionState::Pilot;
        v.deprecated_at = None;
        v.allow_downgrade = false;

        let excluded = exclusions_with_frozen(title);
        let pilot_groups = v.pilot_groups.clone().unwrap_or_else(|| title.pilot_groups.clone());
        let options = PolicyOptions {
            package_id: v.external_ids.fleet_package_id.clone(),
            self_service: false,
            allow_downgrade: false,
            reboot: v.reboot,
        };
        if let Some(auto_id) = &v.external_ids.fleet_auto_install_policy_id {
            let mut auto_excluded = excluded.clone();
            if let Some(installed) = &title.external_ids.fleet_installed_group_id {
                auto_excluded.push(installed.clone());
            }
            let scope = PolicyScope {
                target_groups: pilot_groups,
                excluded_groups: auto_excluded,
            };
            self.fleet.update_policy(auto_id, &scope, &options).await?;
        }
        if let Some(manual_id) = &v.external_ids.fleet_manual_install_policy_id {
            let scope = PolicyScope {
                target_groups: vec![crate::version::ALL_COMPUTERS.to_string()],
                excluded_groups: excluded,
            };
            self.fleet.update_policy(manual_id, &scope, &options).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogClient;
    use crate::fleet::FakeFleetClient;
    use crate::title::{NewTitle, TitleService};
    use crate::types::{ExpirationPolicy, Requirement};
    use crate::version::{NewVersion, VersionService};
    use crate::watchers::WatcherRegistry;
    use crate::pkg_deletion::PkgDeletionPool;
    use tempfile::tempdir;

    fn actor() -> Actor {
        Actor {
            admin: "admin".into(),
            host: "test-host".into(),
        }
    }

    struct Fixture {
        title_svc: TitleService,
        version_svc: VersionService,
        release_engine: ReleaseEngine,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let store = Arc::new(Store::new(dir));
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
        let version_svc = VersionService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
            watchers,
            pool,
        );
        let release_engine = ReleaseEngine::new(store, locks, catalog, fleet);
        Fixture {
            title_svc,
            version_svc,
            release_engine,
        }
    }

    fn new_title(slug: &str) -> NewTitle {
        NewTitle {
            title: slug.into(),
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
        }
    }

    fn new_version(v: &str) -> NewVersion {
        NewVersion {
            version: v.into(),
            min_os: "12.0".into(),
            max_os: None,
            reboot: false,
            publish_date: None,
            standalone: true,
            pilot_groups: None,
            killapps: vec![],
            package_filename: None,
        }
    }

    #[tokio::test]
    async fn scenario_create_add_release() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.title_svc.create(new_title("firefox"), &actor()).await.unwrap();
        f.version_svc.create("firefox", new_version("1.0.0"), &actor()).await.unwrap();

        let title = f.release_engine.release("firefox", "1.0.0", false, &actor()).await.unwrap();
        assert_eq!(title.released_version.as_deref(), Some("1.0.0"));

        let v = f.release_engine.store.load_version("firefox", "1.0.0").await.unwrap();
        assert_eq!(v.state, VersionState::Released);

        let entries = Changelog::new(&f.release_engine.store, "firefox").read_all().await.unwrap();
        let messages: Vec<_> = entries.iter().filter_map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["Title Created", "Version 1.0.0 created", "version released: 1.0.0"]);
    }

    #[tokio::test]
    async fn scenario_rollback_demotes_current_and_restores_target() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.title_svc.create(new_title("app"), &actor()).await.unwrap();
        f.version_svc.create("app", new_version("1.5.0"), &actor()).await.unwrap();
        f.version_svc.create("app", new_version("2.0.0"), &actor()).await.unwrap();

        f.release_engine.release("app", "2.0.0", false, &actor()).await.unwrap();
        let title = f.release_engine.release("app", "1.5.0", true, &actor()).await.unwrap();

        assert_eq!(title.released_version.as_deref(), Some("1.5.0"));
        let older = f.release_engine.store.load_version("app", "1.5.0").await.unwrap();
        assert_eq!(older.state, VersionState::Released);
        assert!(older.allow_downgrade);

        let newer = f.release_engine.store.load_version("app", "2.0.0").await.unwrap();
        assert_eq!(newer.state, VersionState::Deprecated);
    }

    #[tokio::test]
    async fn releasing_already_released_is_invalid_data() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.title_svc.create(new_title("firefox"), &actor()).await.unwrap();
        f.version_svc.create("firefox", new_version("1.0.0"), &actor()).await.unwrap();
        f.release_engine.release("firefox", "1.0.0", false, &actor()).await.unwrap();

        let err = f.release_engine.release("firefox", "1.0.0", false, &actor()).await.unwrap_err();
        assert!(matches!(err, XoloError::InvalidData(_)));
    }

    #[tokio::test]
    async fn releasing_nonexistent_version_is_not_found() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.title_svc.create(new_title("firefox"), &actor()).await.unwrap();

        let err = f.release_engine.release("firefox", "9.9.9", false, &actor()).await.unwrap_err();
        assert!(matches!(err, XoloError::NotFound(_)));
    }
}
