// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk cache of fetched resources.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<sha256(location \n version)>/<generation>/<file-name>
//!                                                  <file-name>.info   JSON metadata
//!                                                  <file-name>.lock   advisory lock
//! ```
//!
//! A superseded copy is never deleted in place. Its entry is marked for
//! delete, a fresh generation directory is allocated for the new copy, and a
//! later [`CacheStore::sweep`] reclaims the old one once nobody holds its lock.

mod entry;
mod store;

pub use entry::{CacheEntry, EntryGuard, EntryInfo};
pub use store::{CacheStore, SweepReport};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache metadata in {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to lock {}: {reason}", path.display())]
    Lock { path: PathBuf, reason: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
