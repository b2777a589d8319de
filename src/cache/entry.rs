// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache entries and their advisory locks.
//!
//! Entry metadata is only mutated through an [`EntryGuard`], which owns the
//! `fs2` lock on the entry's `.lock` file and releases it on drop. Taking the
//! guard consumes the entry, so the same entry cannot be locked twice from
//! one code path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{now_millis, CacheError};

/// Persisted metadata for one cached file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryInfo {
    /// Location the file was fetched for.
    pub location: String,
    /// Version the file was fetched for.
    pub version: Option<String>,
    /// Length the server reported, in bytes.
    pub remote_content_length: Option<u64>,
    /// Server last-modified, epoch milliseconds.
    pub last_modified: Option<i64>,
    /// When this copy was last confirmed or rewritten, epoch milliseconds.
    pub last_updated: Option<i64>,
    /// Descriptor that asked for this file.
    pub origin_path: Option<String>,
    /// Waiting for a sweep.
    pub delete: bool,
}

/// Handle on one cache file and its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    path: PathBuf,
    info: EntryInfo,
}

impl CacheEntry {
    /// Open the entry for `path`. Never fails: missing or unreadable metadata
    /// yields a fresh record that is created on the first [`EntryGuard::store`].
    pub fn open(path: impl Into<PathBuf>, location: &str, version: Option<&str>) -> Self {
        let path = path.into();
        let info = match read_info(&info_path(&path)) {
            Ok(Some(info)) => info,
            Ok(None) => EntryInfo::default(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring unreadable cache metadata"
                );
                EntryInfo::default()
            }
        };
        let mut entry = Self { path, info };
        entry.stamp_identity(location, version);
        entry
    }

    fn stamp_identity(&mut self, location: &str, version: Option<&str>) {
        if self.info.location.is_empty() {
            self.info.location = location.to_string();
            self.info.version = version.map(str::to_string);
        }
    }

    /// The cache file this entry describes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &EntryInfo {
        &self.info
    }

    pub fn info_path(&self) -> PathBuf {
        info_path(&self.path)
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    /// Size of the cache file on disk, if it exists.
    pub fn file_len(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// Not marked for delete and the file is present.
    pub fn is_cached(&self) -> bool {
        !self.info.delete && self.path.is_file()
    }

    /// Whether the cached copy is at least as new as `remote_last_modified`.
    ///
    /// The recorded time is the later of the stored server last-modified and
    /// the local last-updated stamp. An unknown remote time trusts any cached
    /// copy; an unknown recorded time trusts none.
    pub fn is_current(&self, remote_last_modified: Option<i64>) -> bool {
        if !self.is_cached() {
            return false;
        }
        let recorded = match (self.info.last_modified, self.info.last_updated) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return false,
        };
        match remote_last_modified {
            None => true,
            Some(remote) => recorded >= remote,
        }
    }

    /// Take the exclusive lock, blocking the current thread until it is free.
    pub fn lock_blocking(self) -> Result<EntryGuard, CacheError> {
        loop {
            let file = self.open_lock_file()?;
            file.lock_exclusive().map_err(|e| CacheError::Lock {
                path: self.lock_path(),
                reason: e.to_string(),
            })?;
            if self.holds_live_lock(&file) {
                return EntryGuard::acquired(self, file);
            }
            tracing::debug!(path = %self.path.display(), "lock file swept while waiting; retrying");
        }
    }

    /// Take the exclusive lock without blocking a runtime thread.
    pub async fn lock(self) -> Result<EntryGuard, CacheError> {
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || self.lock_blocking())
            .await
            .map_err(|e| CacheError::Lock {
                path: lock_path,
                reason: e.to_string(),
            })?
    }

    /// Take the lock only if it is free right now.
    pub fn try_lock(self) -> Result<Option<EntryGuard>, CacheError> {
        loop {
            let file = self.open_lock_file()?;
            match file.try_lock_exclusive() {
                Ok(()) if self.holds_live_lock(&file) => {
                    return EntryGuard::acquired(self, file).map(Some)
                }
                Ok(()) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    return Err(CacheError::Lock {
                        path: self.lock_path(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Run `f` with the entry locked. The lock is released when `f` returns
    /// or unwinds.
    pub fn with_lock<R>(self, f: impl FnOnce(&mut EntryGuard) -> R) -> Result<R, CacheError> {
        let mut guard = self.lock_blocking()?;
        Ok(f(&mut guard))
    }

    /// Whether `file` is still the lock file on disk. A sweep unlinks the
    /// lock of a superseded generation while holding it; anyone who opened
    /// the old inode before that must start over.
    #[cfg(unix)]
    fn holds_live_lock(&self, file: &File) -> bool {
        use std::os::unix::fs::MetadataExt;

        match (file.metadata(), fs::metadata(self.lock_path())) {
            (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
            _ => false,
        }
    }

    /// Open files cannot be unlinked here, so a held lock is always live.
    #[cfg(not(unix))]
    fn holds_live_lock(&self, _file: &File) -> bool {
        true
    }

    fn open_lock_file(&self) -> Result<File, CacheError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CacheError::io(&lock_path, e))
    }
}

/// A locked cache entry. The lock is released on drop.
#[derive(Debug)]
pub struct EntryGuard {
    entry: CacheEntry,
    file: File,
}

impl EntryGuard {
    fn acquired(mut entry: CacheEntry, file: File) -> Result<Self, CacheError> {
        // Another holder may have rewritten the metadata while we waited.
        let (location, version) = (entry.info.location.clone(), entry.info.version.clone());
        match read_info(&entry.info_path()) {
            Ok(info) => {
                // Missing metadata means the record was swept; start afresh.
                entry.info = info.unwrap_or_default();
                entry.stamp_identity(&location, version.as_deref());
            }
            Err(e) => {
                tracing::warn!(
                    path = %entry.path.display(),
                    error = %e,
                    "cache metadata unreadable; it will be rewritten"
                );
            }
        }
        tracing::trace!(path = %entry.path.display(), "cache entry locked");
        Ok(Self { entry, file })
    }

    pub fn set_remote_content_length(&mut self, length: Option<u64>) {
        self.entry.info.remote_content_length = length;
    }

    pub fn set_last_modified(&mut self, millis: Option<i64>) {
        self.entry.info.last_modified = millis;
    }

    pub fn set_last_updated(&mut self, millis: i64) {
        self.entry.info.last_updated = Some(millis);
    }

    pub fn touch(&mut self) {
        self.set_last_updated(now_millis());
    }

    pub fn set_origin_path(&mut self, origin: Option<String>) {
        if origin.is_some() {
            self.entry.info.origin_path = origin;
        }
    }

    /// Flag the entry for a later sweep. Nothing is deleted here.
    pub fn mark_for_delete(&mut self) {
        self.entry.info.delete = true;
    }

    /// Persist the metadata: write a temp file, sync it, rename over the old
    /// record.
    pub fn store(&self) -> Result<(), CacheError> {
        let path = self.entry.info_path();
        let temp = sibling(&path, "tmp");
        let json = serde_json::to_string_pretty(&self.entry.info).map_err(|e| CacheError::Metadata {
            path: path.clone(),
            source: e,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        {
            let mut file = File::create(&temp).map_err(|e| CacheError::io(&temp, e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| CacheError::io(&temp, e))?;
            file.sync_all().map_err(|e| CacheError::io(&temp, e))?;
        }
        fs::rename(&temp, &path).map_err(|e| CacheError::io(&path, e))
    }

    /// Release the lock and hand back the entry as last seen.
    pub fn unlock(self) -> CacheEntry {
        self.entry.clone()
    }
}

impl Deref for EntryGuard {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                path = %self.entry.lock_path().display(),
                error = %e,
                "failed to release cache lock"
            );
        }
    }
}

fn info_path(path: &Path) -> PathBuf {
    sibling(path, "info")
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

fn read_info(path: &Path) -> Result<Option<EntryInfo>, CacheError> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CacheError::Metadata {
                path: path.to_path_buf(),
                source: e,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOCATION: &str = "https://example.com/app.jar";

    fn cached_entry(dir: &TempDir) -> CacheEntry {
        let path = dir.path().join("0").join("app.jar");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"jar").unwrap();
        CacheEntry::open(path, LOCATION, Some("1.0"))
    }

    #[test]
    fn test_store_and_reopen_round_trip() {
        let dir = TempDir::new().unwrap();
        let entry = cached_entry(&dir);
        let path = entry.path().to_path_buf();

        let mut guard = entry.lock_blocking().unwrap();
        guard.set_remote_content_length(Some(3));
        guard.set_last_modified(Some(1_000));
        guard.set_origin_path(Some("/apps/app.jnlp".into()));
        guard.store().unwrap();
        drop(guard);

        let reopened = CacheEntry::open(&path, LOCATION, Some("1.0"));
        assert_eq!(reopened.info().remote_content_length, Some(3));
        assert_eq!(reopened.info().last_modified, Some(1_000));
        assert_eq!(reopened.info().origin_path.as_deref(), Some("/apps/app.jnlp"));
        assert_eq!(reopened.info().version.as_deref(), Some("1.0"));
        assert!(!sibling(&reopened.info_path(), "tmp").exists());
    }

    #[test]
    fn test_is_current_rules() {
        let dir = TempDir::new().unwrap();
        let mut entry = cached_entry(&dir);

        assert!(!entry.is_current(None), "no recorded time");

        entry.info.last_modified = Some(1_000);
        assert!(entry.is_current(None));
        assert!(entry.is_current(Some(1_000)));
        assert!(!entry.is_current(Some(1_001)));

        entry.info.last_updated = Some(5_000);
        assert!(entry.is_current(Some(4_999)));

        entry.info.delete = true;
        assert!(!entry.is_current(Some(0)));
    }

    #[test]
    fn test_is_current_is_monotone() {
        let dir = TempDir::new().unwrap();
        let mut entry = cached_entry(&dir);
        entry.info.last_updated = Some(10_000);

        // Walking the remote time downwards never turns a fresh copy stale.
        let mut seen_current = false;
        for remote in (0..=20_000).rev().step_by(500) {
            let current = entry.is_current(Some(remote));
            assert!(current || !seen_current, "flipped back at {remote}");
            assert_eq!(current, remote <= 10_000);
            seen_current |= current;
        }
    }

    #[test]
    fn test_missing_file_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let entry = CacheEntry::open(dir.path().join("0").join("missing.jar"), LOCATION, None);
        assert!(!entry.is_cached());
        assert!(!entry.is_current(None));
    }

    #[test]
    fn test_try_lock_sees_holder() {
        let dir = TempDir::new().unwrap();
        let entry = cached_entry(&dir);

        let guard = entry.clone().lock_blocking().unwrap();
        assert!(entry.clone().try_lock().unwrap().is_none());
        drop(guard);
        assert!(entry.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_lock_reloads_metadata() {
        let dir = TempDir::new().unwrap();
        let stale = cached_entry(&dir);
        let fresh = CacheEntry::open(stale.path(), LOCATION, Some("1.0"));

        fresh
            .with_lock(|guard| {
                guard.set_last_modified(Some(42));
                guard.store()
            })
            .unwrap()
            .unwrap();

        assert_eq!(stale.info().last_modified, None);
        let guard = stale.lock_blocking().unwrap();
        assert_eq!(guard.info().last_modified, Some(42));
    }

    #[test]
    fn test_corrupt_metadata_opens_fresh() {
        let dir = TempDir::new().unwrap();
        let entry = cached_entry(&dir);
        fs::write(entry.info_path(), b"{ not json").unwrap();

        let reopened = CacheEntry::open(entry.path(), LOCATION, None);
        assert_eq!(reopened.info().location, LOCATION);

        let guard = reopened.lock_blocking().unwrap();
        guard.store().unwrap();
        drop(guard);
        let repaired = CacheEntry::open(entry.path(), LOCATION, None);
        assert_eq!(repaired.info().location, LOCATION);
    }

    #[test]
    fn test_lock_after_metadata_removed_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let entry = cached_entry(&dir);
        entry
            .clone()
            .with_lock(|guard| {
                guard.mark_for_delete();
                guard.store()
            })
            .unwrap()
            .unwrap();

        let marked = CacheEntry::open(entry.path(), LOCATION, Some("1.0"));
        assert!(marked.info().delete);
        fs::remove_file(marked.info_path()).unwrap();

        let guard = marked.lock_blocking().unwrap();
        assert!(!guard.info().delete);
        assert_eq!(guard.info().location, LOCATION);
        assert_eq!(guard.info().version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_waiter_relocks_after_lock_file_unlinked() {
        let dir = TempDir::new().unwrap();
        let entry = cached_entry(&dir);
        let lock_path = entry.lock_path();

        let holder = entry.clone().lock_blocking().unwrap();
        let waiter = {
            let entry = entry.clone();
            std::thread::spawn(move || entry.lock_blocking().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(100));

        fs::remove_file(&lock_path).unwrap();
        drop(holder);

        let guard = waiter.join().unwrap();
        assert!(lock_path.exists(), "waiter must lock a file that is still linked");
        assert!(entry.clone().try_lock().unwrap().is_none());
        drop(guard);
        assert!(entry.try_lock().unwrap().is_some());
    }
}
