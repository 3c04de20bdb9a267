//! Core data model: [`Title`], [`Version`], and the small value types that
//! hang off them (spec §3). Mirrors the teacher's `types.rs` in spirit —
//! plain `serde`-derived structs — but every type here additionally knows
//! which of its fields are changelog-tracked (§4.6 `Title.update`), since
//! that bookkeeping has to live somewhere and the attribute itself is the
//! natural place for it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a client detects whether (and which version of) a title is installed.
///
/// Exactly one of these is configured per title (spec §3 invariant); every
/// place that dispatches on detection mechanism — Catalog requirement,
/// Catalog patch component, Fleet installed-group criteria, client-data
/// output, the EA-acceptance watcher — switches on this tag (Design Note §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    App {
        app_name: String,
        app_bundle_id: String,
    },
    Script {
        version_script: String,
    },
}

impl Requirement {
    pub fn is_script(&self) -> bool {
        matches!(self, Requirement::Script { .. })
    }
}

/// Mutually exclusive uninstall mechanisms (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Uninstall {
    Script { uninstall_script: String },
    Ids { uninstall_ids: Vec<String> },
}

/// A title's configured expiration policy. `None` means expiration is not
/// configured for this title.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExpirationPolicy {
    pub enabled: bool,
    pub expire_after_days: Option<u32>,
}

/// The Fleet/Catalog side-object identifiers a title accumulates as it makes
/// first contact with the two external systems (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TitleExternalIds {
    pub catalog_title_id: Option<String>,
    pub fleet_category_id: Option<String>,
    pub fleet_installed_group_id: Option<String>,
    pub fleet_frozen_group_id: Option<String>,
    pub fleet_ea_id: Option<String>,
    pub fleet_patch_title_id: Option<String>,
}

/// A software product managed by Xolo (spec §3 "Title").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Title {
    pub title: String,
    pub display_name: String,
    pub publisher: String,
    pub requirement: Requirement,

    pub self_service: bool,
    pub self_service_category: Option<String>,
    pub self_service_icon_id: Option<String>,
    pub description: Option<String>,

    pub pilot_groups: Vec<String>,
    pub release_groups: Vec<String>,
    pub excluded_groups: Vec<String>,
    pub uninstall: Option<Uninstall>,
    pub expiration: ExpirationPolicy,

    /// Newest-first ordering of this title's versions. Authoritative for
    /// "older than"/"newer than" comparisons in the release engine (§4.6).
    pub version_order: Vec<String>,
    pub released_version: Option<String>,

    pub external_ids: TitleExternalIds,

    pub creation_date: DateTime<Utc>,
    pub created_by: String,
}

/// Attribute names tracked for `Title.update`'s changelog diff (spec §4.6
/// step 1: "only attributes flagged `changelog` are tracked"). Array
/// attributes are compared as sorted multisets by [`Title::diff`].
const TITLE_CHANGELOG_ATTRS: &[&str] = &[
    "display_name",
    "publisher",
    "requirement",
    "self_service",
    "self_service_category",
    "self_service_icon_id",
    "description",
    "pilot_groups",
    "release_groups",
    "excluded_groups",
    "uninstall",
    "expiration",
];

/// One changed attribute, as produced by [`Title::diff`] / [`Version::diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttrChange {
    pub attrib: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

impl Title {
    /// Attribute-level diff between `self` (incoming) and `prior` (stored),
    /// restricted to changelog-tracked attributes, with array-valued
    /// attributes compared as sorted multisets rather than ordered vectors
    /// (spec §4.6 step 1).
    pub fn diff(&self, prior: &Title) -> Vec<AttrChange> {
        let new_json = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let old_json = serde_json::to_value(prior).unwrap_or(serde_json::Value::Null);
        diff_tracked_attrs(TITLE_CHANGELOG_ATTRS, &old_json, &new_json)
    }
}

/// Compares two serialized objects attribute-by-attribute, restricted to
/// `tracked`, normalizing array values to a sorted-string multiset before
/// comparison so reordering alone never produces a spurious change.
pub(crate) fn diff_tracked_attrs(
    tracked: &[&str],
    old_json: &serde_json::Value,
    new_json: &serde_json::Value,
) -> Vec<AttrChange> {
    let mut changes = Vec::new();
    for attr in tracked {
        let old_v = old_json.get(attr).cloned().unwrap_or(serde_json::Value::Null);
        let new_v = new_json.get(attr).cloned().unwrap_or(serde_json::Value::Null);
        if normalize_for_diff(&old_v) != normalize_for_diff(&new_v) {
            changes.push(AttrChange {
                attrib: attr.to_string(),
                old: old_v,
                new: new_v,
            });
        }
    }
    changes
}

fn normalize_for_diff(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Array(items) => {
            let mut set: BTreeSet<String> = BTreeSet::new();
            for item in items {
                set.insert(item.to_string());
            }
            serde_json::Value::Array(set.into_iter().map(serde_json::Value::String).collect())
        }
        other => other.clone(),
    }
}

/// One `name;bundleID` kill-app entry (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillApp {
    pub name: String,
    pub bundle_id: String,
}

/// The release lifecycle state of a [`Version`] (spec §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Pending,
    Pilot,
    Released,
    Deprecated,
    Skipped,
}

/// The Fleet/Catalog side-object identifiers a version accumulates as it is
/// built out (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VersionExternalIds {
    pub catalog_patch_id: Option<String>,
    pub fleet_package_id: Option<String>,
    pub fleet_package_filename: Option<String>,
    pub fleet_manual_install_policy_id: Option<String>,
    pub fleet_auto_install_policy_id: Option<String>,
    pub fleet_patch_policy_id: Option<String>,
}

/// One release of a [`Title`] (spec §3 "Version").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    pub title: String,
    pub version: String,

    pub min_os: String,
    pub max_os: Option<String>,
    pub reboot: bool,
    pub publish_date: Option<NaiveDate>,
    pub standalone: bool,
    /// Per-version override of the title's `pilot_groups`. An empty list
    /// removes all pilot targets rather than meaning "all computers"
    /// (spec §9 open question (a)).
    pub pilot_groups: Option<Vec<String>>,
    pub killapps: Vec<KillApp>,

    pub state: VersionState,
    pub allow_downgrade: bool,

    pub created_at: DateTime<Utc>,
    pub deprecated_at: Option<DateTime<Utc>>,

    pub external_ids: VersionExternalIds,
}

const VERSION_CHANGELOG_ATTRS: &[&str] = &[
    "min_os",
    "max_os",
    "reboot",
    "publish_date",
    "standalone",
    "pilot_groups",
    "killapps",
];

impl Version {
    pub fn diff(&self, prior: &Version) -> Vec<AttrChange> {
        let new_json = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let old_json = serde_json::to_value(prior).unwrap_or(serde_json::Value::Null);
        diff_tracked_attrs(VERSION_CHANGELOG_ATTRS, &old_json, &new_json)
    }

    pub fn has_uploaded_installer(&self) -> bool {
        self.external_ids.fleet_package_id.is_some()
    }
}

/// Append-only changelog record (spec §3 "Changelog entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub time: DateTime<Utc>,
    pub admin: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrib: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
}

impl ChangelogEntry {
    pub fn message(admin: impl Into<String>, host: impl Into<String>, message: impl Into<String>) -> Self {
        ChangelogEntry {
            time: Utc::now(),
            admin: admin.into(),
            host: host.into(),
            version: None,
            message: Some(message.into()),
            attrib: None,
            old: None,
            new: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn attr_change(
        admin: impl Into<String>,
        host: impl Into<String>,
        change: &AttrChange,
    ) -> Self {
        ChangelogEntry {
            time: Utc::now(),
            admin: admin.into(),
            host: host.into(),
            version: None,
            message: None,
            attrib: Some(change.attrib.clone()),
            old: Some(change.old.clone()),
            new: Some(change.new.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_title() -> Title {
        Title {
            title: "firefox".into(),
            display_name: "Firefox".into(),
            publisher: "Mozilla".into(),
            requirement: Requirement::Script {
                version_script: "#!/bin/sh\necho 1".into(),
            },
            self_service: false,
            self_service_category: None,
            self_service_icon_id: None,
            description: None,
            pilot_groups: vec!["pilots".into()],
            release_groups: vec![],
            excluded_groups: vec![],
            uninstall: None,
            expiration: ExpirationPolicy::default(),
            version_order: vec![],
            released_version: None,
            external_ids: TitleExternalIds::default(),
            creation_date: Utc::now(),
            created_by: "admin".into(),
        }
    }

    #[test]
    fn empty_diff_for_identical_titles() {
        let t = sample_title();
        assert!(t.diff(&t).is_empty());
    }

    #[test]
    fn reordering_array_attrs_does_not_produce_a_diff() {
        let mut a = sample_title();
        a.pilot_groups = vec!["a".into(), "b".into()];
        let mut b = sample_title();
        b.pilot_groups = vec!["b".into(), "a".into()];
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn changed_attribute_is_reported() {
        let a = sample_title();
        let mut b = sample_title();
        b.display_name = "Firefox ESR".into();
        let changes = a.diff(&b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attrib, "display_name");
    }
}
