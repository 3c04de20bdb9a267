//! Version entity workflows: create / update / delete (spec §4.6).
//!
//! Shares [`crate::title::TitleService`]'s shape (store + two external
//! clients + changelog + watchers) but additionally owns the
//! [`crate::pkg_deletion::PkgDeletionPool`] handle, since only version
//! deletion touches it. The release state machine itself lives in
//! [`crate::release`] — this module only ever sets a fresh version to
//! `pending`→`pilot` on create; everything past that is the release
//! engine's job.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::catalog::{CatalogClient, PatchCapabilities};
use crate::changelog::Changelog;
use crate::error::{Res, XoloError};
use crate::fleet::{FleetClient, PolicyKind, PolicyOptions, PolicyScope};
use crate::lock::LockManager;
use crate::pkg_deletion::PkgDeletionPool;
use crate::store::Store;
use crate::title::{exclusions_with_frozen, side_object_name};
use crate::types::{ChangelogEntry, KillApp, Title, Version, VersionExternalIds, VersionState};
use crate::watchers::{PatchVisibilityOutcome, WatcherRegistry};

/// Marker `PolicyScope::target_groups` entry meaning "every computer" —
/// distinct from an *empty* `target_groups`, which spec §9 open question (a)
/// reserves for "remove all pilot targets" on the auto-install policy. Only
/// the manual-install policy (spec §4.6 `Version.create` step 3: "scope: all
/// targets") uses this marker.
pub const ALL_COMPUTERS: &str = "__ALL_COMPUTERS__";

/// Fields a caller supplies when adding a version; ids/state/timestamps are
/// derived by the workflow.
#[derive(Debug, Deserialize)]
pub struct NewVersion {
    pub version: String,
    pub min_os: String,
    pub max_os: Option<String>,
    pub reboot: bool,
    pub publish_date: Option<chrono::NaiveDate>,
    pub standalone: bool,
    pub pilot_groups: Option<Vec<String>>,
    pub killapps: Vec<KillApp>,
    /// Filename of the already-uploaded installer, if any (upload itself is
    /// out of scope per spec §1 — the multipart handler is external).
    pub package_filename: Option<String>,
}

pub struct VersionService {
    pub store: Arc<Store>,
    pub locks: Arc<LockManager>,
    pub catalog: Arc<dyn CatalogClient>,
    pub fleet: Arc<dyn FleetClient>,
    pub watchers: Arc<WatcherRegistry>,
    pub pkg_deletion: PkgDeletionPool,
}

impl VersionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        locks: Arc<LockManager>,
        catalog: Arc<dyn CatalogClient>,
        fleet: Arc<dyn FleetClient>,
        watchers: Arc<WatcherRegistry>,
        pkg_deletion: PkgDeletionPool,
    ) -> Self {
        VersionService {
            store,
            locks,
            catalog,
            fleet,
            watchers,
            pkg_deletion,
        }
    }

    async fn append_changelog(&self, title: &str, entry: ChangelogEntry) -> Res<()> {
        let _guard = self.locks.changelog_write(title).await;
        Changelog::new(&self.store, title).append(&entry).await
    }

    /// spec §4.6 `Version.create`.
    pub async fn create(
        &self,
        title_slug: &str,
        new: NewVersion,
        actor: &crate::title::Actor,
    ) -> Res<Version> {
        let (_title_guard, _version_guard) = self
            .locks
            .acquire_title_and_version(title_slug, &new.version)
            .await?;

        let mut title = self.store.load_title(title_slug).await?;
        if self.store.version_exists(title_slug, &new.version).await {
            return Err(XoloError::AlreadyExists(format!(
                "version '{title_slug}' '{}' already exists",
                new.version
            )));
        }

        let catalog_title_id = title.external_ids.catalog_title_id.clone().ok_or_else(|| {
            XoloError::MissingData(format!("title '{title_slug}' has no catalog id"))
        })?;

        info!(title = %title_slug, version = %new.version, "creating version");

        // Catalog: patch with capabilities, killapps, component.
        let patch = self.catalog.create_patch(&catalog_title_id, &new.version).await?;
        self.catalog
            .set_patch_capabilities(
                &patch.id,
                &PatchCapabilities {
                    min_os: new.min_os.clone(),
                    max_os: new.max_os.clone(),
                },
            )
            .await?;
        self.catalog.set_patch_killapps(&patch.id, &new.killapps).await?;
        self.catalog
            .set_patch_component(&patch.id, &title.requirement)
            .await?;

        // Fleet: package, manual-install policy, auto-install policy.
        let filename = new
            .package_filename
            .clone()
            .unwrap_or_else(|| format!("{title_slug}-{}.pkg", new.version));
        let fleet_package_id = self
            .fleet
            .create_package(title_slug, &new.version, &filename)
            .await?;

        let excluded = exclusions_with_frozen(&title);

        let manual_name = side_object_name(title_slug, &format!("{}-manual", new.version));
        let manual_scope = PolicyScope {
            target_groups: vec![ALL_COMPUTERS.to_string()],
            excluded_groups: excluded.clone(),
        };
        let manual_options = PolicyOptions {
            package_id: Some(fleet_package_id.clone()),
            self_service: title.self_service,
            allow_downgrade: false,
            reboot: new.reboot,
        };
        let fleet_manual_install_policy_id = self
            .fleet
            .create_policy(PolicyKind::ManualInstall, &manual_name, &manual_scope, &manual_options)
            .await?;

        let pilot_groups = new.pilot_groups.clone().unwrap_or_else(|| title.pilot_groups.clone());
        let mut auto_excluded = excluded.clone();
        if let Some(installed) = &title.external_ids.fleet_installed_group_id {
            auto_excluded.push(installed.clone());
        }
        let auto_name = side_object_name(title_slug, &format!("{}-auto", new.version));
        let auto_scope = PolicyScope {
            target_groups: pilot_groups,
            excluded_groups: auto_excluded,
        };
        let fleet_auto_install_policy_id = self
            .fleet
            .create_policy(PolicyKind::AutoInstall, &auto_name, &auto_scope, &manual_options)
            .await?;

        let version = Version {
            title: title_slug.to_string(),
            version: new.version.clone(),
            min_os: new.min_os,
            max_os: new.max_os,
            reboot: new.reboot,
            publish_date: new.publish_date,
            standalone: new.standalone,
            pilot_groups: new.pilot_groups,
            killapps: new.killapps,
            state: VersionState::Pilot,
            allow_downgrade: false,
            created_at: Utc::now(),
            deprecated_at: None,
            external_ids: VersionExternalIds {
                catalog_patch_id: Some(patch.id.clone()),
                fleet_package_id: Some(fleet_package_id),
                fleet_package_filename: Some(filename),
                fleet_manual_install_policy_id: Some(fleet_manual_install_policy_id),
                fleet_auto_install_policy_id: Some(fleet_auto_install_policy_id),
                fleet_patch_policy_id: None,
            },
        };

        title.version_order.insert(0, version.version.clone());
        self.store.save_title(&title).await?;
        self.store.save_version(&version).await?;

        self.append_changelog(
            title_slug,
            ChangelogEntry::message(&actor.admin, &actor.host, format!("Version {} created", version.version))
                .with_version(version.version.clone()),
        )
        .await?;

        self.spawn_patch_policy_watcher(title_slug.to_string(), version.version.clone(), patch.id, &title);

        Ok(version)
    }

    /// Starts the bounded patch-visibility watcher that finishes building
    /// out the version once Catalog reports the patch visible (spec §4.7.1).
    fn spawn_patch_policy_watcher(&self, title_slug: String, version: String, patch_id: String, title: &Title) {
        let store = Arc::clone(&self.store);
        let fleet = Arc::clone(&self.fleet);
        let release_groups = title.release_groups.clone();
        let excluded = exclusions_with_frozen(title);

        self.watchers.start_patch_visibility_watcher(
            Arc::clone(&self.catalog),
            title_slug.clone(),
            version.clone(),
            patch_id,
            move |outcome| async move {
                if !matches!(outcome, PatchVisibilityOutcome::Visible) {
                    return;
                }
                let Ok(mut v) = store.load_version(&title_slug, &version).await else {
                    return;
                };
                let Some(package_id) = v.external_ids.fleet_package_id.clone() else {
                    return;
                };
                let patch_name = format!("xolo-{title_slug}-{version}-patch");
                let scope = PolicyScope {
                    target_groups: release_groups,
                    excluded_groups: excluded,
                };
                let options = PolicyOptions {
                    package_id: Some(package_id),
                    self_service: false,
                    allow_downgrade: false,
                    reboot: v.reboot,
                };
                match fleet
                    .create_policy(PolicyKind::Patch, &patch_name, &scope, &options)
                    .await
                {
                    Ok(policy_id) => {
                        v.external_ids.fleet_patch_policy_id = Some(policy_id);
                        let _ = store.save_version(&v).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            alert = true,
                            title = %title_slug,
                            version = %version,
                            error = %e,
                            "failed to create patch policy after visibility"
                        );
                    }
                }
            },
        );
    }

    /// spec §4.6 `Version.update`.
    pub async fn update(&self, title_slug: &str, incoming: Version, actor: &crate::title::Actor) -> Res<Version> {
        let (_title_guard, _version_guard) = self
            .locks
            .acquire_title_and_version(title_slug, &incoming.version)
            .await?;

        let title = self.store.load_title(title_slug).await?;
        let prior = self.store.load_version(title_slug, &incoming.version).await?;
        let changes = prior.diff(&incoming);
        if changes.is_empty() {
            info!(title = %title_slug, version = %incoming.version, "version update produced no changes, skipping");
            return Ok(prior);
        }

        for change in &changes {
            self.append_changelog(
                title_slug,
                ChangelogEntry::attr_change(&actor.admin, &actor.host, change)
                    .with_version(incoming.version.clone()),
            )
            .await?;
        }

        let mut updated = incoming;
        updated.external_ids = prior.external_ids.clone();
        updated.state = prior.state;
        updated.created_at = prior.created_at;
        updated.deprecated_at = prior.deprecated_at;
        updated.allow_downgrade = prior.allow_downgrade;

        if let Some(patch_id) = &updated.external_ids.catalog_patch_id {
            self.catalog
                .set_patch_capabilities(
                    patch_id,
                    &PatchCapabilities {
                        min_os: updated.min_os.clone(),
                        max_os: updated.max_os.clone(),
                    },
                )
                .await?;
            self.catalog.set_patch_killapps(patch_id, &updated.killapps).await?;
        }

        let excluded = exclusions_with_frozen(&title);
        let options = PolicyOptions {
            package_id: updated.external_ids.fleet_package_id.clone(),
            self_service: title.self_service,
            allow_downgrade: updated.allow_downgrade,
            reboot: updated.reboot,
        };
        if let Some(manual_id) = &updated.external_ids.fleet_manual_install_policy_id {
            let scope = PolicyScope {
                target_groups: vec![ALL_COMPUTERS.to_string()],
                excluded_groups: excluded.clone(),
            };
            self.fleet.update_policy(manual_id, &scope, &options).await?;
        }
        if let Some(auto_id) = &updated.external_ids.fleet_auto_install_policy_id {
            let pilot_groups = updated.pilot_groups.clone().unwrap_or_else(|| title.pilot_groups.clone());
            let mut auto_excluded = excluded;
            if let Some(installed) = &title.external_ids.fleet_installed_group_id {
                auto_excluded.push(installed.clone());
            }
            let scope = PolicyScope {
                target_groups: pilot_groups,
                excluded_groups: auto_excluded,
            };
            self.fleet.update_policy(auto_id, &scope, &options).await?;
        }

        self.store.save_version(&updated).await?;
        Ok(updated)
    }

    /// spec §4.6 `Version.delete`.
    pub async fn delete(&self, title_slug: &str, version: &str, actor: &crate::title::Actor) -> Res<()> {
        let (_title_guard, _version_guard) = self.locks.acquire_title_and_version(title_slug, version).await?;

        let mut title = self.store.load_title(title_slug).await?;
        let v = self.store.load_version(title_slug, version).await?;

        if let Some(id) = &v.external_ids.fleet_patch_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.fleet_manual_install_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.fleet_auto_install_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.catalog_patch_id {
            self.catalog.delete_patch(id).await?;
        }
        if let Some(package_id) = v.external_ids.fleet_package_id {
            // Package deletion is minute-scale; offload rather than block
            // the request on it (spec §4.8).
            self.pkg_deletion.submit(title_slug, package_id);
        }

        title.version_order.retain(|v| v != version);
        if title.released_version.as_deref() == Some(version) {
            warn!(title = %title_slug, version = %version, "deleting the currently released version, clearing released_version");
            title.released_version = None;
        }
        self.store.save_title(&title).await?;
        self.store.delete_version(title_slug, version).await?;

        self.append_changelog(
            title_slug,
            ChangelogEntry::message(&actor.admin, &actor.host, format!("Version {version} deleted"))
                .with_version(version.to_string()),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogClient;
    use crate::fleet::FakeFleetClient;
    use crate::title::{Actor, NewTitle, TitleService};
    use crate::types::{ExpirationPolicy, Requirement};
    use tempfile::tempdir;

    fn actor() -> Actor {
        Actor {
            admin: "admin".into(),
            host: "test-host".into(),
        }
    }

    fn services(dir: &std::path::Path) -> (TitleService, VersionService) {
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
        let version_svc = VersionService::new(store, locks, catalog, fleet, watchers, pool);
        (title_svc, version_svc)
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
    async fn create_prepends_to_version_order_and_starts_pilot() {
        let dir = tempdir().unwrap();
        let (title_svc, version_svc) = services(dir.path());
        title_svc.create(new_title("firefox"), &actor()).await.unwrap();

        let v1 = version_svc.create("firefox", new_version("1.0.0"), &actor()).await.unwrap();
        assert_eq!(v1.state, VersionState::Pilot);
        let v2 = version_svc.create("firefox", new_version("1.1.0"), &actor()).await.unwrap();
        assert_eq!(v2.state, VersionState::Pilot);

        let title = version_svc.store.load_title("firefox").await.unwrap();
        assert_eq!(title.version_order, vec!["1.1.0", "1.0.0"]);
    }

    #[tokio::test]
    async fn create_twice_same_version_is_already_exists() {
        let dir = tempdir().unwrap();
        let (title_svc, version_svc) = services(dir.path());
        title_svc.create(new_title("firefox"), &actor()).await.unwrap();
        version_svc.create("firefox", new_version("1.0.0"), &actor()).await.unwrap();
        let err = version_svc
            .create("firefox", new_version("1.0.0"), &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, XoloError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_removes_from_version_order() {
        let dir = tempdir().unwrap();
        let (title_svc, version_svc) = services(dir.path());
        title_svc.create(new_title("firefox"), &actor()).await.unwrap();
        version_svc.create("firefox", new_version("1.0.0"), &actor()).await.unwrap();

        version_svc.delete("firefox", "1.0.0", &actor()).await.unwrap();

        let title = version_svc.store.load_title("firefox").await.unwrap();
        assert!(title.version_order.is_empty());
        assert!(!version_svc.store.version_exists("firefox", "1.0.0").await);
    }
}
