// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mapping from (location, version) to cache files, generation allocation
//! and the sweep of superseded copies.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use super::{CacheEntry, CacheError, EntryGuard};
use crate::resource::Version;

/// Name used when a location has no usable last path segment.
const FALLBACK_FILE_NAME: &str = "index";

/// Result of a [`CacheStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files: usize,
    pub bytes: u64,
    /// Entries marked for delete that were still locked by someone.
    pub skipped: usize,
}

/// A cache directory. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.rescache/cache`, falling back to a relative directory when the
    /// home directory is unknown.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".rescache").join("cache"))
            .unwrap_or_else(|| PathBuf::from(".rescache/cache"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every generation of (location, version).
    pub fn key_dir(&self, location: &Url, version: Option<&Version>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(location.as_str().as_bytes());
        hasher.update(b"\n");
        if let Some(version) = version {
            hasher.update(version.as_str().as_bytes());
        }
        self.root.join(hex::encode(hasher.finalize()))
    }

    /// Current cache file for (location, version): the newest generation not
    /// marked for delete, or the path a new copy would take. Pure lookup, no
    /// network and no writes.
    pub fn cache_file(&self, location: &Url, version: Option<&Version>) -> PathBuf {
        let key_dir = self.key_dir(location, version);
        let name = file_name(location);
        let generations = generations(&key_dir);

        for generation in generations.iter().rev() {
            let path = key_dir.join(generation.to_string()).join(&name);
            let entry = CacheEntry::open(&path, location.as_str(), version.map(Version::as_str));
            if !entry.info().delete {
                return path;
            }
        }
        let next = generations.last().map_or(0, |g| g + 1);
        key_dir.join(next.to_string()).join(name)
    }

    pub fn open(&self, location: &Url, version: Option<&Version>) -> CacheEntry {
        self.open_at(self.cache_file(location, version), location, version)
    }

    /// Lock the current cache file for (location, version).
    ///
    /// While we wait for the lock another holder may mark the generation for
    /// delete and allocate a newer one. In that case the stale lock is dropped
    /// and the lookup starts over, so the returned guard always names the
    /// generation [`cache_file`](Self::cache_file) would hand out now.
    pub async fn lock_current(
        &self,
        location: &Url,
        version: Option<&Version>,
    ) -> Result<EntryGuard, CacheError> {
        loop {
            let guard = self.open(location, version).lock().await?;
            if !guard.info().delete && self.cache_file(location, version) == guard.path() {
                return Ok(guard);
            }
            tracing::debug!(
                path = %guard.path().display(),
                "cache generation superseded while waiting for its lock; looking again"
            );
        }
    }

    /// Open the entry at a path previously handed out by this store.
    pub fn open_at(
        &self,
        path: impl Into<PathBuf>,
        location: &Url,
        version: Option<&Version>,
    ) -> CacheEntry {
        CacheEntry::open(path, location.as_str(), version.map(Version::as_str))
    }

    /// Allocate a fresh generation for (location, version) and return the
    /// cache file path inside it. Concurrent allocators never share a
    /// generation: the directory is created with `create_dir`, which fails for
    /// the loser.
    pub fn make_new_cache_file(
        &self,
        location: &Url,
        version: Option<&Version>,
    ) -> Result<PathBuf, CacheError> {
        let key_dir = self.key_dir(location, version);
        fs::create_dir_all(&key_dir).map_err(|e| CacheError::io(&key_dir, e))?;

        let mut generation = generations(&key_dir).last().map_or(0, |g| g + 1);
        loop {
            let dir = key_dir.join(generation.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => {
                    tracing::debug!(location = %location, generation, "allocated cache generation");
                    return Ok(dir.join(file_name(location)));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => generation += 1,
                Err(e) => return Err(CacheError::io(&dir, e)),
            }
        }
    }

    /// Every entry with metadata on disk, including ones marked for delete.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        for key_dir in read_dirs(&self.root)? {
            for generation_dir in read_dirs(&key_dir)? {
                let listing = fs::read_dir(&generation_dir)
                    .map_err(|e| CacheError::io(&generation_dir, e))?;
                for item in listing {
                    let item = item.map_err(|e| CacheError::io(&generation_dir, e))?;
                    let path = item.path();
                    if path.extension().is_some_and(|ext| ext == "info") {
                        let file = path.with_extension("");
                        entries.push(CacheEntry::open(file, "", None));
                    }
                }
            }
        }
        entries.sort_by(|a, b| {
            a.info()
                .location
                .cmp(&b.info().location)
                .then(a.path().cmp(b.path()))
        });
        Ok(entries)
    }

    /// Delete every entry marked for delete whose lock is free right now.
    pub fn sweep(&self) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        for entry in self.entries()? {
            if !entry.info().delete {
                continue;
            }
            let Some(guard) = entry.try_lock()? else {
                report.skipped += 1;
                continue;
            };
            if !guard.info().delete {
                continue;
            }

            let path = guard.path().to_path_buf();
            let size = guard.file_len().unwrap_or(0);
            remove_if_exists(&path)?;
            remove_if_exists(&guard.info_path())?;
            // Unlinked while still held; waiters on the old inode notice and
            // reopen.
            remove_if_exists(&guard.lock_path())?;
            drop(guard);

            report.files += 1;
            report.bytes += size;
            tracing::debug!(path = %path.display(), size, "swept cache file");

            // Empty generation and key directories go too; anything else left
            // behind belongs to a live writer.
            if let Some(generation_dir) = path.parent() {
                if fs::remove_dir(generation_dir).is_ok() {
                    if let Some(key_dir) = generation_dir.parent() {
                        let _ = fs::remove_dir(key_dir);
                    }
                }
            }
        }
        tracing::info!(
            files = report.files,
            bytes = report.bytes,
            skipped = report.skipped,
            "cache sweep finished"
        );
        Ok(report)
    }
}

/// File name for a location: its last non-empty path segment, with anything
/// outside `[A-Za-z0-9._-]` replaced.
pub(crate) fn file_name(location: &Url) -> String {
    let segment = location
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or(FALLBACK_FILE_NAME);
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

/// Numeric generation directories under `key_dir`, ascending.
fn generations(key_dir: &Path) -> Vec<u64> {
    let Ok(listing) = fs::read_dir(key_dir) else {
        return Vec::new();
    };
    let mut generations: Vec<u64> = listing
        .filter_map(Result::ok)
        .filter(|item| item.path().is_dir())
        .filter_map(|item| item.file_name().to_str()?.parse().ok())
        .collect();
    generations.sort_unstable();
    generations
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for item in listing {
        let path = item.map_err(|e| CacheError::io(dir, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}
