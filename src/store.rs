//! On-disk persistence for titles, versions, and their ancillary files
//! (spec §4.1).
//!
//! The layout mirrors the teacher's `StateManager` (one JSON file per
//! logical record under a `dirs`-resolved data directory) but is scoped to
//! an explicit `data_dir` passed in at construction instead of a hardcoded
//! `sporlcli/state` path, and every write lands via a temp-file-then-rename
//! so a crash mid-write can never leave a half-written JSON file where a
//! reader expects a complete one.
//!
//! ```text
//! <data_dir>/
//!   titles/
//!     <title>/
//!       <title>.json
//!       changelog.jsonl
//!       changelog.jsonl.bak
//!       version-script
//!       uninstall-script
//!       self-service-icon.<ext>
//!       versions/
//!         <version>.json
//!         <version>.pkg
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Res, XoloError};
use crate::types::{Requirement, Title, Uninstall, Version};

/// Filename prefix the self-service icon is addressed by (spec §4.1
/// `titles/<title>/self-service-icon.<ext>`) — the extension varies with
/// the uploaded image, so lookups scan the title directory for a file
/// whose name starts with this prefix rather than assuming one.
const ICON_FILE_PREFIX: &str = "self-service-icon.";

fn list_subdirs(dir: &Path) -> Res<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn list_json_stems(dir: &Path) -> Res<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stripped) = name.strip_suffix(".json") {
            names.push(stripped.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn titles_dir(&self) -> PathBuf {
        self.root.join("titles")
    }

    pub fn title_dir(&self, title: &str) -> PathBuf {
        self.titles_dir().join(title)
    }

    pub fn title_file(&self, title: &str) -> PathBuf {
        self.title_dir(title).join(format!("{title}.json"))
    }

    pub fn versions_dir(&self, title: &str) -> PathBuf {
        self.title_dir(title).join("versions")
    }

    pub fn version_file(&self, title: &str, version: &str) -> PathBuf {
        self.versions_dir(title).join(format!("{version}.json"))
    }

    pub fn package_file(&self, title: &str, version: &str) -> PathBuf {
        self.versions_dir(title).join(format!("{version}.pkg"))
    }

    pub fn version_script_file(&self, title: &str) -> PathBuf {
        self.title_dir(title).join("version-script")
    }

    pub fn uninstall_script_file(&self, title: &str) -> PathBuf {
        self.title_dir(title).join("uninstall-script")
    }

    /// The literal path an icon with extension `ext` would live at (spec
    /// §4.1 `self-service-icon.<ext>`). Use [`Store::locate_icon`] to find
    /// the actual file, since the extension isn't known ahead of lookup.
    pub fn icon_file(&self, title: &str, ext: &str) -> PathBuf {
        self.title_dir(title).join(format!("{ICON_FILE_PREFIX}{ext}"))
    }

    pub fn changelog_file(&self, title: &str) -> PathBuf {
        self.title_dir(title).join("changelog.jsonl")
    }

    pub fn changelog_backup_file(&self, title: &str) -> PathBuf {
        self.title_dir(title).join("changelog.jsonl.bak")
    }

    pub(crate) fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// Writes `contents` to `path` via a sibling temp file plus rename, so
    /// readers never observe a partially-written file.
    async fn write_atomic(path: &Path, contents: &[u8]) -> Res<()> {
        let parent = path.parent().ok_or_else(|| {
            XoloError::Server(format!("path {} has no parent directory", path.display()))
        })?;
        async_fs::create_dir_all(parent).await?;
        let tmp_name = format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
            uuid::Uuid::new_v4()
        );
        let tmp_path = parent.join(tmp_name);
        async_fs::write(&tmp_path, contents).await?;
        async_fs::rename(&tmp_path, path).await.map_err(|e| {
            XoloError::Server(format!("failed to finalize write to {}: {e}", path.display()))
        })
    }

    /// Every title directory name under `titles/`, sorted for deterministic
    /// output. Directory listing is done synchronously via `spawn_blocking`
    /// — `async_fs`'s stream-based `read_dir` would pull in `futures-lite`
    /// for a handful of local syscalls the teacher's stack doesn't already
    /// depend on.
    pub async fn list_titles(&self) -> Res<Vec<String>> {
        let dir = self.titles_dir();
        tokio::task::spawn_blocking(move || list_subdirs(&dir))
            .await
            .map_err(|e| XoloError::Server(format!("list_titles task panicked: {e}")))?
    }

    pub async fn title_exists(&self, title: &str) -> bool {
        async_fs::metadata(self.title_file(title)).await.is_ok()
    }

    pub async fn load_title(&self, title: &str) -> Res<Title> {
        let path = self.title_file(title);
        let json = async_fs::read_to_string(&path)
            .await
            .map_err(|_| XoloError::NotFound(format!("title '{title}' does not exist")))?;
        serde_json::from_str(&json).map_err(|e| {
            XoloError::Server(format!("title '{title}' is corrupt on disk: {e}"))
        })
    }

    pub async fn save_title(&self, title: &Title) -> Res<()> {
        let path = self.title_file(&title.title);
        let json = serde_json::to_vec_pretty(title)?;
        Self::write_atomic(&path, &json).await?;
        self.sync_title_scripts(title).await?;
        debug!(title = %title.title, "saved title");
        Ok(())
    }

    /// Writes `contents` to `path`, or removes `path` if `contents` is
    /// `None` — used to keep `version-script`/`uninstall-script` mirrored
    /// to whichever `Requirement`/`Uninstall` variant is currently
    /// configured (spec §4.1).
    async fn write_or_remove(path: &Path, contents: Option<&str>) -> Res<()> {
        match contents {
            Some(text) => Self::write_atomic(path, text.as_bytes()).await,
            None => {
                if async_fs::metadata(path).await.is_ok() {
                    async_fs::remove_file(path).await?;
                }
                Ok(())
            }
        }
    }

    /// Mirrors a title's `version_script`/`uninstall_script` content onto
    /// their literal on-disk files (spec §4.1 `titles/<title>/version-script`,
    /// `titles/<title>/uninstall-script`). The title's JSON document remains
    /// the source of truth; these files exist so collaborators that expect a
    /// plain script file (e.g. the out-of-scope packaging tooling) can read
    /// one directly instead of parsing JSON.
    pub async fn sync_title_scripts(&self, title: &Title) -> Res<()> {
        let version_script = match &title.requirement {
            Requirement::Script { version_script } => Some(version_script.as_str()),
            Requirement::App { .. } => None,
        };
        Self::write_or_remove(&self.version_script_file(&title.title), version_script).await?;

        let uninstall_script = match &title.uninstall {
            Some(Uninstall::Script { uninstall_script }) => Some(uninstall_script.as_str()),
            _ => None,
        };
        Self::write_or_remove(&self.uninstall_script_file(&title.title), uninstall_script).await
    }

    /// Reads the `version-script` file written by [`Store::sync_title_scripts`].
    pub async fn read_version_script(&self, title: &str) -> Res<String> {
        async_fs::read_to_string(self.version_script_file(title))
            .await
            .map_err(|_| XoloError::NotFound(format!("title '{title}' has no version-script file")))
    }

    /// Reads the `uninstall-script` file written by [`Store::sync_title_scripts`].
    pub async fn read_uninstall_script(&self, title: &str) -> Res<String> {
        async_fs::read_to_string(self.uninstall_script_file(title))
            .await
            .map_err(|_| XoloError::NotFound(format!("title '{title}' has no uninstall-script file")))
    }

    /// Removes a title's entire directory, after moving its changelog to
    /// `archive/<title>-<timestamp>.jsonl` so history survives deletion
    /// (spec §4.6 `Title.delete` step "finalize and archive the changelog").
    pub async fn delete_title(&self, title: &str) -> Res<()> {
        let changelog = self.changelog_file(title);
        if async_fs::metadata(&changelog).await.is_ok() {
            let archive_dir = self.archive_dir();
            async_fs::create_dir_all(&archive_dir).await?;
            let dest = archive_dir.join(format!(
                "{title}-{}.jsonl",
                chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
            ));
            if let Err(e) = async_fs::rename(&changelog, &dest).await {
                warn!(title = %title, error = %e, "failed to archive changelog before delete");
            }
        }
        let dir = self.title_dir(title);
        if async_fs::metadata(&dir).await.is_ok() {
            async_fs::remove_dir_all(&dir).await?;
        }
        debug!(title = %title, "deleted title directory");
        Ok(())
    }

    pub async fn list_versions(&self, title: &str) -> Res<Vec<String>> {
        let dir = self.versions_dir(title);
        tokio::task::spawn_blocking(move || list_json_stems(&dir))
            .await
            .map_err(|e| XoloError::Server(format!("list_versions task panicked: {e}")))?
    }

    pub async fn load_version(&self, title: &str, version: &str) -> Res<Version> {
        let path = self.version_file(title, version);
        let json = async_fs::read_to_string(&path).await.map_err(|_| {
            XoloError::NotFound(format!("version '{title}' '{version}' does not exist"))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            XoloError::Server(format!("version '{title}' '{version}' is corrupt on disk: {e}"))
        })
    }

    pub async fn save_version(&self, version: &Version) -> Res<()> {
        let path = self.version_file(&version.title, &version.version);
        let json = serde_json::to_vec_pretty(version)?;
        Self::write_atomic(&path, &json).await?;
        debug!(title = %version.title, version = %version.version, "saved version");
        Ok(())
    }

    pub async fn delete_version(&self, title: &str, version: &str) -> Res<()> {
        let path = self.version_file(title, version);
        if async_fs::metadata(&path).await.is_ok() {
            async_fs::remove_file(&path).await?;
        }
        let pkg = self.package_file(title, version);
        if async_fs::metadata(&pkg).await.is_ok() {
            async_fs::remove_file(&pkg).await?;
        }
        debug!(title = %title, version = %version, "deleted version");
        Ok(())
    }

    pub async fn version_exists(&self, title: &str, version: &str) -> bool {
        async_fs::metadata(self.version_file(title, version))
            .await
            .is_ok()
    }

    /// Finds the title's self-service icon by filename prefix (spec §4.1),
    /// since the extension varies with the uploaded image and isn't known
    /// ahead of lookup.
    pub async fn locate_icon(&self, title: &str) -> Res<PathBuf> {
        let dir = self.title_dir(title);
        let found = tokio::task::spawn_blocking(move || -> Res<Option<PathBuf>> {
            if !dir.exists() {
                return Ok(None);
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(ICON_FILE_PREFIX) {
                    return Ok(Some(entry.path()));
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| XoloError::Server(format!("locate_icon task panicked: {e}")))??;
        found.ok_or_else(|| XoloError::NotFound(format!("title '{title}' has no stored icon")))
    }

    /// Persists `bytes` as `self-service-icon.<ext>`, replacing any
    /// previously-stored icon under a different extension (spec §4.1).
    pub async fn save_icon(&self, title: &str, ext: &str, bytes: &[u8]) -> Res<()> {
        if let Ok(existing) = self.locate_icon(title).await {
            if existing != self.icon_file(title, ext) {
                async_fs::remove_file(&existing).await.ok();
            }
        }
        Self::write_atomic(&self.icon_file(title, ext), bytes).await
    }

    pub async fn load_icon(&self, title: &str) -> Res<Vec<u8>> {
        let path = self.locate_icon(title).await?;
        async_fs::read(&path)
            .await
            .map_err(|e| XoloError::Server(format!("failed to read stored icon for '{title}': {e}")))
    }

    pub async fn save_package(&self, title: &str, version: &str, bytes: &[u8]) -> Res<()> {
        Self::write_atomic(&self.package_file(title, version), bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExpirationPolicy, Requirement, TitleExternalIds};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_title(name: &str) -> Title {
        Title {
            title: name.into(),
            display_name: name.into(),
            publisher: "Acme".into(),
            requirement: Requirement::Script {
                version_script: "#!/bin/sh\necho 1".into(),
            },
            self_service: false,
            self_service_category: None,
            self_service_icon_id: None,
            description: None,
            pilot_groups: vec![],
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

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let title = sample_title("firefox");
        store.save_title(&title).await.unwrap();
        let loaded = store.load_title("firefox").await.unwrap();
        assert_eq!(loaded, title);
    }

    #[tokio::test]
    async fn load_missing_title_is_not_found() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let err = store.load_title("nope").await.unwrap_err();
        assert!(matches!(err, XoloError::NotFound(_)));
    }

    #[tokio::test]
    async fn saving_a_script_title_writes_the_version_script_file() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_title(&sample_title("firefox")).await.unwrap();

        let contents = store.read_version_script("firefox").await.unwrap();
        assert_eq!(contents, "#!/bin/sh\necho 1");
        assert!(store.read_uninstall_script("firefox").await.is_err());
    }

    #[tokio::test]
    async fn switching_requirement_kind_removes_the_stale_script_file() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_title(&sample_title("firefox")).await.unwrap();

        let mut app_based = sample_title("firefox");
        app_based.requirement = Requirement::App {
            app_name: "Firefox.app".into(),
            app_bundle_id: "org.mozilla.firefox".into(),
        };
        store.save_title(&app_based).await.unwrap();

        assert!(store.read_version_script("firefox").await.is_err());
        assert!(!store.version_script_file("firefox").exists());
    }

    #[tokio::test]
    async fn icon_round_trips_by_prefix_regardless_of_extension() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_title(&sample_title("firefox")).await.unwrap();

        store.save_icon("firefox", "png", b"fake-png-bytes").await.unwrap();
        assert_eq!(store.load_icon("firefox").await.unwrap(), b"fake-png-bytes");

        // Re-uploading under a different extension replaces the old file
        // rather than leaving both around.
        store.save_icon("firefox", "jpg", b"fake-jpg-bytes").await.unwrap();
        assert_eq!(store.load_icon("firefox").await.unwrap(), b"fake-jpg-bytes");
        assert!(!store.icon_file("firefox", "png").exists());
    }

    #[tokio::test]
    async fn list_titles_is_sorted() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_title(&sample_title("zeta")).await.unwrap();
        store.save_title(&sample_title("alpha")).await.unwrap();
        assert_eq!(store.list_titles().await.unwrap(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn delete_title_archives_changelog() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_title(&sample_title("firefox")).await.unwrap();
        async_fs::write(store.changelog_file("firefox"), b"{}\n")
            .await
            .unwrap();

        store.delete_title("firefox").await.unwrap();

        assert!(!store.title_exists("firefox").await);
        let archived: Vec<_> = std::fs::read_dir(store.archive_dir()).unwrap().collect();
        assert!(!archived.is_empty());
    }
}
