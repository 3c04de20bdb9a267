//! Append-only per-title journal (spec §4.10).
//!
//! Every mutation that reaches [`crate::title`]/[`crate::version`] writes
//! through here. A write first copies the current file to its backup path
//! (so a concurrent crash mid-append never loses the prior, valid file),
//! then appends the new newline-delimited JSON record. The per-title lock
//! that guards this is [`crate::lock::LockManager::changelog_write`]; this
//! module never acquires it twice in the same call (Design Note §9).

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::Res;
use crate::store::Store;
use crate::types::ChangelogEntry;

pub struct Changelog<'a> {
    store: &'a Store,
    title: String,
}

impl<'a> Changelog<'a> {
    pub fn new(store: &'a Store, title: impl Into<String>) -> Self {
        Changelog {
            store,
            title: title.into(),
        }
    }

    /// Appends one record. Caller must hold the changelog write lock for
    /// `self.title` for the duration of this call.
    pub async fn append(&self, entry: &ChangelogEntry) -> Res<()> {
        let path = self.store.changelog_file(&self.title);
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        self.backup(&path).await;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(title = %self.title, "appended changelog entry");
        Ok(())
    }

    /// Appends the title's final "deleted" record and renames the file into
    /// the archive directory, returning the archive path. Caller must hold
    /// the changelog write lock.
    pub async fn finalize_and_archive(&self, entry: &ChangelogEntry) -> Res<std::path::PathBuf> {
        self.append(entry).await?;
        let path = self.store.changelog_file(&self.title);
        let archive_dir = self.store.archive_dir();
        async_fs::create_dir_all(&archive_dir).await?;
        let dest = archive_dir.join(format!(
            "{}-{}.jsonl",
            self.title,
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        ));
        async_fs::rename(&path, &dest).await?;
        debug!(title = %self.title, dest = %dest.display(), "archived changelog on title delete");
        Ok(dest)
    }

    /// Caller must hold the changelog read (or write) lock.
    pub async fn read_all(&self) -> Res<Vec<ChangelogEntry>> {
        let path = self.store.changelog_file(&self.title);
        if async_fs::metadata(&path).await.is_err() {
            return Ok(Vec::new());
        }
        let file = tokio::fs::File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    async fn backup(&self, path: &Path) {
        if async_fs::metadata(path).await.is_ok() {
            let backup = self.store.changelog_backup_file(&self.title);
            let _ = async_fs::copy(path, &backup).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn entry(msg: &str) -> ChangelogEntry {
        ChangelogEntry {
            time: Utc::now(),
            admin: "admin".into(),
            host: "test-host".into(),
            version: None,
            message: Some(msg.into()),
            attrib: None,
            old: None,
            new: None,
        }
    }

    #[tokio::test]
    async fn append_then_read_all_preserves_order() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let log = Changelog::new(&store, "firefox");
        log.append(&entry("Title Created")).await.unwrap();
        log.append(&entry("Version 1.0.0 created")).await.unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.as_deref(), Some("Title Created"));
        assert_eq!(entries[1].message.as_deref(), Some("Version 1.0.0 created"));
    }

    #[tokio::test]
    async fn backup_file_exists_after_second_write() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let log = Changelog::new(&store, "firefox");
        log.append(&entry("one")).await.unwrap();
        log.append(&entry("two")).await.unwrap();
        assert!(async_fs::metadata(store.changelog_backup_file("firefox"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn finalize_and_archive_moves_the_file() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let log = Changelog::new(&store, "firefox");
        log.append(&entry("Title Created")).await.unwrap();

        let archived = log.finalize_and_archive(&entry("Title Deleted")).await.unwrap();
        assert!(async_fs::metadata(&archived).await.is_ok());
        assert!(async_fs::metadata(store.changelog_file("firefox")).await.is_err());
    }
}
