// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remembered trust decisions, persisted as JSON.
//!
//! Readers take a shared lock and writers an exclusive lock on a sibling
//! `.lock` file, so several processes can share one store. Writes go to a
//! temp file that is synced and renamed over the store while the exclusive
//! lock is held.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredAction {
    Always,
    Never,
}

/// What a remembered decision applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustScope {
    /// One artifact URL.
    Artifact(String),
    /// Everything served from one origin (`scheme://host:port`).
    Origin(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedAction {
    pub action: StoredAction,
    pub scope: TrustScope,
    pub remembered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: Vec<RememberedAction>,
    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
}

/// One decision store on disk.
#[derive(Debug, Clone)]
pub struct ActionStore {
    path: PathBuf,
}

impl ActionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Stored action for an artifact. An artifact-scoped entry wins over an
    /// origin-scoped one; among equals the most recent wins.
    pub fn lookup(&self, artifact: &str, origin: &str) -> Result<Option<StoredAction>> {
        let entries = self.load()?;
        let newest = |wanted: &TrustScope| {
            entries
                .iter()
                .filter(|e| &e.scope == wanted)
                .max_by_key(|e| e.remembered_at)
                .map(|e| e.action)
        };
        Ok(newest(&TrustScope::Artifact(artifact.to_string()))
            .or_else(|| newest(&TrustScope::Origin(origin.to_string()))))
    }

    /// Record `action` for `scope`, replacing any earlier decision for it.
    pub fn remember(&self, action: StoredAction, scope: TrustScope) -> Result<()> {
        self.update(|entries| {
            entries.retain(|e| e.scope != scope);
            entries.push(RememberedAction {
                action,
                scope,
                remembered_at: Utc::now(),
            });
        })
    }

    /// Load every remembered decision under a shared lock.
    pub fn load(&self) -> Result<Vec<RememberedAction>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read trust store: {}", self.path.display()))?;
        let file: StoreFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse trust store: {}", self.path.display()))?;
        Ok(file.entries)
    }

    /// Read-modify-write under the exclusive lock.
    pub fn update(&self, f: impl FnOnce(&mut Vec<RememberedAction>)) -> Result<()> {
        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_exclusive_lock_with_timeout(&lock_file, &self.lock_path(), LOCK_TIMEOUT)?;

        let mut file = match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse trust store: {}", self.path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read trust store: {}", self.path.display()))
            }
        };
        f(&mut file.entries);
        file.last_saved = Some(Utc::now());

        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&file)?;
        {
            let mut temp = File::create(&temp_path)
                .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
            temp.write_all(content.as_bytes())?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace trust store: {}", self.path.display()))?;

        // Lock is released when lock_file is dropped
        Ok(())
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| {
                format!("Failed to create directory for lock file: {}", parent.display())
            })?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))
}

fn acquire_exclusive_lock_with_timeout(file: &File, path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {} after {:?}. \
                         Another instance may be writing trust decisions.",
                        path.display(),
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to acquire exclusive lock on {}", path.display())
                });
            }
        }
    }
}

fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing trust decisions.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on trust store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ARTIFACT: &str = "https://example.com/app.jar";
    const ORIGIN: &str = "https://example.com:443";

    #[test]
    fn test_empty_store_has_no_decision() {
        let dir = TempDir::new().unwrap();
        let store = ActionStore::new(dir.path().join("trust.json"));
        assert_eq!(store.lookup(ARTIFACT, ORIGIN).unwrap(), None);
    }

    #[test]
    fn test_artifact_scope_beats_origin_scope() {
        let dir = TempDir::new().unwrap();
        let store = ActionStore::new(dir.path().join("trust.json"));
        store.remember(StoredAction::Never, TrustScope::Origin(ORIGIN.into())).unwrap();
        assert_eq!(store.lookup(ARTIFACT, ORIGIN).unwrap(), Some(StoredAction::Never));

        store.remember(StoredAction::Always, TrustScope::Artifact(ARTIFACT.into())).unwrap();
        assert_eq!(store.lookup(ARTIFACT, ORIGIN).unwrap(), Some(StoredAction::Always));
        assert_eq!(
            store.lookup("https://example.com/other.jar", ORIGIN).unwrap(),
            Some(StoredAction::Never)
        );
    }

    #[test]
    fn test_remember_replaces_same_scope() {
        let dir = TempDir::new().unwrap();
        let store = ActionStore::new(dir.path().join("trust.json"));
        store.remember(StoredAction::Never, TrustScope::Artifact(ARTIFACT.into())).unwrap();
        store.remember(StoredAction::Always, TrustScope::Artifact(ARTIFACT.into())).unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, StoredAction::Always);
        assert!(!dir.path().join("trust.tmp").exists());
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.json");

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = ActionStore::new(&path);
                thread::spawn(move || {
                    store
                        .remember(
                            StoredAction::Always,
                            TrustScope::Artifact(format!("https://h/{i}.jar")),
                        )
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ActionStore::new(&path).load().unwrap().len(), 10);
    }
}
