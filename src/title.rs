//! Title entity workflows: create / update / delete / repair (spec §4.6).
//!
//! Mirrors the teacher's `management::artist` module in shape — a service
//! struct wrapping the store plus the two external clients — but every
//! workflow here additionally orchestrates Catalog-then-Fleet side effects
//! and changelog bookkeeping, which the teacher's Spotify sync never needed.
//!
//! Naming convention for catalog/fleet side-objects (spec §3 invariant):
//! a fixed prefix, the title slug, and a per-object suffix, so that two
//! titles never collide and a given title's objects are discoverable by
//! prefix scan alone.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::catalog::{CatalogClient, PatchCapabilities};
use crate::changelog::Changelog;
use crate::error::{Res, XoloError};
use crate::fleet::{FleetClient, PolicyScope};
use crate::lock::LockManager;
use crate::store::Store;
use crate::types::{ChangelogEntry, Requirement, Title, TitleExternalIds};
use crate::watchers::WatcherRegistry;

/// Fixed prefix every Catalog/Fleet side-object name carries (spec §3).
pub const NAME_PREFIX: &str = "xolo-";

pub fn side_object_name(title: &str, suffix: &str) -> String {
    format!("{NAME_PREFIX}{title}-{suffix}")
}

/// Context a caller supplies for changelog attribution — who made the call
/// and from where (spec §3 "Changelog entry" `{admin, host}`).
#[derive(Debug, Clone)]
pub struct Actor {
    pub admin: String,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequirementTransition {
    Unchanged,
    AppToEa,
    EaToApp,
    UpdateApp,
    UpdateEa,
}

fn classify_transition(prior: &Requirement, new: &Requirement) -> RequirementTransition {
    use Requirement::*;
    match (prior, new) {
        (App { .. }, App { .. }) if prior == new => RequirementTransition::Unchanged,
        (App { .. }, App { .. }) => RequirementTransition::UpdateApp,
        (Script { .. }, Script { .. }) if prior == new => RequirementTransition::Unchanged,
        (Script { .. }, Script { .. }) => RequirementTransition::UpdateEa,
        (App { .. }, Script { .. }) => RequirementTransition::AppToEa,
        (Script { .. }, App { .. }) => RequirementTransition::EaToApp,
    }
}

/// Fields a caller may set when creating a title; the rest of [`Title`] is
/// derived (ids, timestamps, version list) by the workflow itself.
#[derive(Debug, Deserialize)]
pub struct NewTitle {
    pub title: String,
    pub display_name: String,
    pub publisher: String,
    pub requirement: Requirement,
    pub self_service: bool,
    pub self_service_category: Option<String>,
    pub description: Option<String>,
    pub pilot_groups: Vec<String>,
    pub release_groups: Vec<String>,
    pub excluded_groups: Vec<String>,
    pub uninstall: Option<crate::types::Uninstall>,
    pub expiration: crate::types::ExpirationPolicy,
}

pub struct TitleService {
    pub store: Arc<Store>,
    pub locks: Arc<LockManager>,
    pub catalog: Arc<dyn CatalogClient>,
    pub fleet: Arc<dyn FleetClient>,
    pub watchers: Arc<WatcherRegistry>,
}

impl TitleService {
    pub fn new(
        store: Arc<Store>,
        locks: Arc<LockManager>,
        catalog: Arc<dyn CatalogClient>,
        fleet: Arc<dyn FleetClient>,
        watchers: Arc<WatcherRegistry>,
    ) -> Self {
        TitleService {
            store,
            locks,
            catalog,
            fleet,
            watchers,
        }
    }

    async fn append_changelog(&self, title: &str, entry: ChangelogEntry) -> Res<()> {
        let _guard = self.locks.changelog_write(title).await;
        Changelog::new(&self.store, title).append(&entry).await
    }

    /// spec §4.6 `Title.create`.
    pub async fn create(&self, new: NewTitle, actor: &Actor) -> Res<Title> {
        let _title_guard = self.locks.acquire_title(&new.title).await?;

        if self.store.title_exists(&new.title).await {
            return Err(XoloError::AlreadyExists(format!("title '{}' already exists", new.title)));
        }

        info!(title = %new.title, "creating title");

        // Catalog first.
        let catalog_title_id = self
            .catalog
            .create_title(&new.title, &new.display_name, &new.publisher)
            .await?;
        self.catalog
            .set_requirement(&catalog_title_id, &new.requirement)
            .await?;

        // Fleet next: category, installed smart group, frozen static group.
        let fleet_category_id = match &new.self_service_category {
            Some(name) => Some(self.fleet.ensure_category(name).await?),
            None => None,
        };
        let installed_group_name = side_object_name(&new.title, "installed");
        let fleet_installed_group_id = self
            .fleet
            .create_installed_smart_group(&installed_group_name, &new.requirement)
            .await?;
        let frozen_group_name = side_object_name(&new.title, "frozen");
        let fleet_frozen_group_id = self.fleet.create_frozen_static_group(&frozen_group_name).await?;

        let title = Title {
            title: new.title.clone(),
            display_name: new.display_name,
            publisher: new.publisher,
            requirement: new.requirement,
            self_service: new.self_service,
            self_service_category: new.self_service_category,
            self_service_icon_id: None,
            description: new.description,
            pilot_groups: new.pilot_groups,
            release_groups: new.release_groups,
            excluded_groups: new.excluded_groups,
            uninstall: new.uninstall,
            expiration: new.expiration,
            version_order: Vec::new(),
            released_version: None,
            external_ids: TitleExternalIds {
                catalog_title_id: Some(catalog_title_id),
                fleet_category_id,
                fleet_installed_group_id: Some(fleet_installed_group_id),
                fleet_frozen_group_id: Some(fleet_frozen_group_id),
                fleet_ea_id: None,
                fleet_patch_title_id: None,
            },
            creation_date: Utc::now(),
            created_by: actor.admin.clone(),
        };

        self.store.save_title(&title).await?;
        self.append_changelog(
            &title.title,
            ChangelogEntry::message(&actor.admin, &actor.host, "Title Created"),
        )
        .await?;

        Ok(title)
    }

    /// spec §4.6 `Title.update`.
    pub async fn update(&self, title_slug: &str, incoming: Title, actor: &Actor) -> Res<Title> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;

        let prior = self.store.load_title(title_slug).await?;
        let changes = incoming.diff(&prior);
        if changes.is_empty() {
            info!(title = %title_slug, "update produced no changes, skipping");
            return Ok(prior);
        }

        // Record the diff before mutating externals so forensic state
        // survives a failure partway through (spec §4.6 step 3).
        for change in &changes {
            self.append_changelog(title_slug, ChangelogEntry::attr_change(&actor.admin, &actor.host, change))
                .await?;
        }

        let catalog_title_id = prior
            .external_ids
            .catalog_title_id
            .clone()
            .ok_or_else(|| XoloError::MissingData(format!("title '{title_slug}' has no catalog id")))?;

        let result = self
            .apply_update(&prior, &incoming, &catalog_title_id, actor)
            .await;

        if let Err(e) = &result {
            self.append_changelog(
                title_slug,
                ChangelogEntry::message(&actor.admin, &actor.host, format!("update failed: {e}")),
            )
            .await
            .ok();
            if e.is_unexpected_upstream() {
                tracing::error!(alert = true, title = %title_slug, error = %e, "title update hit an unexpected upstream failure");
            }
        }

        result
    }

    async fn apply_update(
        &self,
        prior: &Title,
        incoming: &Title,
        catalog_title_id: &str,
        actor: &Actor,
    ) -> Res<Title> {
        let transition = classify_transition(&prior.requirement, &incoming.requirement);

        self.catalog
            .update_title(catalog_title_id, &incoming.display_name)
            .await?;

        if transition != RequirementTransition::Unchanged {
            self.catalog.set_requirement(catalog_title_id, &incoming.requirement).await?;

            // Invariant (spec §8): patch-component kind must track the
            // title's requirement kind after any update completes.
            for version in self.store.list_versions(&prior.title).await? {
                let v = self.store.load_version(&prior.title, &version).await?;
                if let Some(patch_id) = &v.external_ids.catalog_patch_id {
                    self.catalog.set_patch_component(patch_id, &incoming.requirement).await?;
                }
            }
        }

        let mut fleet_ea_id = prior.external_ids.fleet_ea_id.clone();
        let mut fleet_category_id = prior.external_ids.fleet_category_id.clone();

        let group_kind_changed = matches!(
            transition,
            RequirementTransition::AppToEa | RequirementTransition::EaToApp
        );
        if group_kind_changed {
            if let Some(group_id) = &prior.external_ids.fleet_installed_group_id {
                self.fleet
                    .update_installed_smart_group(group_id, &incoming.requirement)
                    .await?;
            }
            match (&prior.requirement, &incoming.requirement) {
                (Requirement::App { .. }, Requirement::Script { version_script }) => {
                    let ea_name = side_object_name(&prior.title, "ea");
                    fleet_ea_id = Some(self.fleet.create_ea(&ea_name, version_script).await?);
                    self.watchers.start_ea_acceptance_watcher(
                        Arc::clone(&self.fleet),
                        prior.title.clone(),
                        fleet_ea_id.clone().expect("just created"),
                    );
                }
                (Requirement::Script { .. }, Requirement::App { .. }) => {
                    if let Some(old_ea) = fleet_ea_id.take() {
                        self.fleet.delete_ea(&old_ea).await?;
                    }
                }
                _ => {}
            }
        } else if transition == RequirementTransition::UpdateEa {
            if let (Some(ea_id), Requirement::Script { version_script }) = (&fleet_ea_id, &incoming.requirement) {
                self.fleet.update_ea(ea_id, version_script).await?;
                self.watchers.start_ea_acceptance_watcher(
                    Arc::clone(&self.fleet),
                    prior.title.clone(),
                    ea_id.clone(),
                );
            }
        }

        if prior.self_service_category != incoming.self_service_category {
            if let Some(name) = &incoming.self_service_category {
                fleet_category_id = Some(self.fleet.ensure_category(name).await?);
            } else {
                fleet_category_id = None;
            }
        }

        let mut updated = incoming.clone();
        updated.external_ids.fleet_ea_id = fleet_ea_id;
        updated.external_ids.fleet_category_id = fleet_category_id;
        updated.creation_date = prior.creation_date;
        updated.created_by = prior.created_by.clone();
        updated.external_ids.catalog_title_id = prior.external_ids.catalog_title_id.clone();
        updated.external_ids.fleet_installed_group_id = prior.external_ids.fleet_installed_group_id.clone();
        updated.external_ids.fleet_frozen_group_id = prior.external_ids.fleet_frozen_group_id.clone();
        updated.external_ids.fleet_patch_title_id = prior.external_ids.fleet_patch_title_id.clone();
        updated.version_order = prior.version_order.clone();
        updated.released_version = prior.released_version.clone();

        // Version-scoped Fleet edits (scope changes for pilot/release/
        // excluded groups, self-service on/off, category, icon) are applied
        // across every version in a second pass, matching spec §4.6 step 5.
        self.apply_version_scoped_fleet_edits(&updated).await?;

        self.store.save_title(&updated).await?;
        let _ = actor;
        Ok(updated)
    }

    async fn apply_version_scoped_fleet_edits(&self, title: &Title) -> Res<()> {
        for version in self.store.list_versions(&title.title).await? {
            let v = self.store.load_version(&title.title, &version).await?;
            let Some(manual_policy_id) = &v.external_ids.fleet_manual_install_policy_id else {
                continue;
            };
            let excluded = exclusions_with_frozen(title);
            let scope = PolicyScope {
                target_groups: vec![],
                excluded_groups: excluded.clone(),
            };
            let options = crate::fleet::PolicyOptions {
                package_id: v.external_ids.fleet_package_id.clone(),
                self_service: title.self_service,
                allow_downgrade: false,
                reboot: v.reboot,
            };
            self.fleet.update_policy(manual_policy_id, &scope, &options).await?;

            if let Some(auto_policy_id) = &v.external_ids.fleet_auto_install_policy_id {
                let pilot_groups = v.pilot_groups.clone().unwrap_or_else(|| title.pilot_groups.clone());
                let auto_scope = PolicyScope {
                    target_groups: pilot_groups,
                    excluded_groups: excluded,
                };
                self.fleet.update_policy(auto_policy_id, &auto_scope, &options).await?;
            }
        }
        Ok(())
    }

    /// spec §4.6 `Title.delete`.
    pub async fn delete(&self, title_slug: &str, actor: &Actor) -> Res<()> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;

        let title = self.store.load_title(title_slug).await?;

        // Cascade versions oldest to newest so Catalog never observes a
        // re-release as newer versions disappear (spec §4.6 step 1).
        for version in title.version_order.iter().rev() {
            self.delete_version_internal(&title, version).await?;
        }

        if let Some(id) = &title.external_ids.catalog_title_id {
            self.catalog.delete_title(id).await?;
        }
        if let Some(id) = &title.external_ids.fleet_patch_title_id {
            warn!(title = %title_slug, patch_title_id = %id, "leaving patch-title deactivation to fleet cascade");
        }
        if let Some(id) = &title.external_ids.fleet_installed_group_id {
            self.fleet.delete_smart_group(id).await?;
        }
        if let Some(id) = &title.external_ids.fleet_frozen_group_id {
            self.fleet.delete_static_group(id).await?;
        }
        if let Some(id) = &title.external_ids.fleet_ea_id {
            self.fleet.delete_ea(id).await?;
        }
        self.locks.forget_changelog_lock(title_slug);

        let _guard = self.locks.changelog_write(title_slug).await;
        Changelog::new(&self.store, title_slug)
            .finalize_and_archive(&ChangelogEntry::message(&actor.admin, &actor.host, "Title Deleted"))
            .await?;
        drop(_guard);

        self.store.delete_title(title_slug).await?;
        Ok(())
    }

    async fn delete_version_internal(&self, title: &Title, version: &str) -> Res<()> {
        let v = match self.store.load_version(&title.title, version).await {
            Ok(v) => v,
            Err(XoloError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Some(id) = &v.external_ids.fleet_patch_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.fleet_manual_install_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.fleet_auto_install_policy_id {
            self.fleet.delete_policy(id).await?;
        }
        if let Some(id) = &v.external_ids.fleet_package_id {
            self.fleet.delete_package(id).await?;
        }
        if let Some(id) = &v.external_ids.catalog_patch_id {
            self.catalog.delete_patch(id).await?;
        }
        self.store.delete_version(&title.title, version).await
    }

    /// spec §6 `POST /titles/<slug>/freeze`: pins `host` to its current
    /// version by adding it to the title's frozen static group, which every
    /// policy scope excludes (spec §4.6, [`exclusions_with_frozen`]).
    pub async fn freeze(&self, title_slug: &str, host: &str, actor: &Actor) -> Res<()> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;
        let title = self.store.load_title(title_slug).await?;
        let group_id = title
            .external_ids
            .fleet_frozen_group_id
            .as_ref()
            .ok_or_else(|| XoloError::MissingData(format!("title '{title_slug}' has no frozen group")))?;
        self.fleet.add_to_static_group(group_id, host).await?;
        self.append_changelog(
            title_slug,
            ChangelogEntry::message(&actor.admin, &actor.host, format!("froze host {host}")),
        )
        .await
    }

    /// spec §6 `POST /titles/<slug>/thaw`: the inverse of [`Self::freeze`].
    pub async fn thaw(&self, title_slug: &str, host: &str, actor: &Actor) -> Res<()> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;
        let title = self.store.load_title(title_slug).await?;
        let group_id = title
            .external_ids
            .fleet_frozen_group_id
            .as_ref()
            .ok_or_else(|| XoloError::MissingData(format!("title '{title_slug}' has no frozen group")))?;
        self.fleet.remove_from_static_group(group_id, host).await?;
        self.append_changelog(
            title_slug,
            ChangelogEntry::message(&actor.admin, &actor.host, format!("thawed host {host}")),
        )
        .await
    }

    /// Recomputes and re-applies a title's Catalog/Fleet side-objects
    /// without changing any user-visible attribute — for recovering from a
    /// partial failure mid-workflow (spec §4.6 mentions `repair` alongside
    /// `update`/`release` as a mutator, without detailing its algorithm;
    /// this reuses the update apply-path against the title's own current
    /// state, which is the repair every other mutator already performs
    /// implicitly).
    pub async fn repair(&self, title_slug: &str, actor: &Actor) -> Res<Title> {
        let _title_guard = self.locks.acquire_title(title_slug).await?;
        let title = self.store.load_title(title_slug).await?;
        let catalog_title_id = title
            .external_ids
            .catalog_title_id
            .clone()
            .ok_or_else(|| XoloError::MissingData(format!("title '{title_slug}' has no catalog id")))?;
        let repaired = self.apply_update(&title, &title, &catalog_title_id, actor).await?;
        Ok(repaired)
    }
}

/// The excluded-groups set a policy scope uses: the title's own exclusions
/// plus the frozen group, which every fleet policy spec §4.6 describes
/// excludes (spec §4.11 client-data output does the analogous thing).
pub fn exclusions_with_frozen(title: &Title) -> Vec<String> {
    let mut excluded = title.excluded_groups.clone();
    if let Some(frozen) = &title.external_ids.fleet_frozen_group_id {
        excluded.push(frozen.clone());
    }
    excluded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogClient;
    use crate::fleet::FakeFleetClient;
    use tempfile::tempdir;

    fn actor() -> Actor {
        Actor {
            admin: "admin".into(),
            host: "test-host".into(),
        }
    }

    fn service(dir: &std::path::Path) -> TitleService {
        TitleService::new(
            Arc::new(Store::new(dir)),
            Arc::new(LockManager::new()),
            Arc::new(FakeCatalogClient::new()),
            Arc::new(FakeFleetClient::new()),
            Arc::new(WatcherRegistry::new()),
        )
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
            release_groups: vec![],
            excluded_groups: vec![],
            uninstall: None,
            expiration: crate::types::ExpirationPolicy::default(),
        }
    }

    #[tokio::test]
    async fn create_writes_title_created_changelog_entry() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let title = svc.create(new_title("firefox"), &actor()).await.unwrap();
        assert!(title.external_ids.catalog_title_id.is_some());
        assert!(title.external_ids.fleet_installed_group_id.is_some());

        let entries = Changelog::new(&svc.store, "firefox").read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.as_deref(), Some("Title Created"));
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create(new_title("firefox"), &actor()).await.unwrap();
        let err = svc.create(new_title("firefox"), &actor()).await.unwrap_err();
        assert!(matches!(err, XoloError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_with_no_changes_skips_changelog() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let title = svc.create(new_title("firefox"), &actor()).await.unwrap();
        let same = title.clone();
        svc.update("firefox", same, &actor()).await.unwrap();

        let entries = Changelog::new(&svc.store, "firefox").read_all().await.unwrap();
        assert_eq!(entries.len(), 1, "no additional entries for an empty diff");
    }

    #[tokio::test]
    async fn requirement_switch_rewrites_kind() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        let mut new = new_title("appbased");
        new.requirement = Requirement::App {
            app_name: "Foo".into(),
            app_bundle_id: "com.x.foo".into(),
        };
        let title = svc.create(new, &actor()).await.unwrap();
        assert!(title.external_ids.fleet_ea_id.is_none());

        let mut switched = title.clone();
        switched.requirement = Requirement::Script {
            version_script: "#!/bin/sh\necho 1".into(),
        };
        let updated = svc.update("appbased", switched, &actor()).await.unwrap();
        assert!(updated.requirement.is_script());
        assert!(updated.external_ids.fleet_ea_id.is_some());
    }

    #[tokio::test]
    async fn freeze_then_thaw_round_trips() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create(new_title("firefox"), &actor()).await.unwrap();
        svc.freeze("firefox", "host-1", &actor()).await.unwrap();
        svc.thaw("firefox", "host-1", &actor()).await.unwrap();

        let entries = Changelog::new(&svc.store, "firefox").read_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].message.as_deref(), Some("froze host host-1"));
        assert_eq!(entries[2].message.as_deref(), Some("thawed host host-1"));
    }

    #[tokio::test]
    async fn delete_removes_title_directory() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create(new_title("firefox"), &actor()).await.unwrap();
        svc.delete("firefox", &actor()).await.unwrap();
        assert!(!svc.store.title_exists("firefox").await);
    }
}
