// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streams an accepted URL into the cache.
//!
//! The destination entry stays locked for the whole transfer, so a second
//! fetcher of the same (location, version) waits, then finds the entry
//! current and skips. Bytes always land in a `.part` sibling first and are
//! renamed into place, so the cache file is either the old copy or the whole
//! new one.
//!
//! Encoded payloads take a detour through a staging entry of their own:
//! download the compressed bytes there, decode into the destination, mark the
//! staging entry for delete.

mod decode;

pub use decode::{gunzip, unpack, DecodeError, Encoding, Unpack200Command, Unpacker};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::cache::{CacheStore, EntryGuard};
use crate::error::FetchError;
use crate::events::{ProgressThrottle, PROGRESS_INTERVAL};
use crate::resource::{Resource, UpdatePolicy};
use crate::transport::{Transport, TransportError};

pub struct TransferPipeline {
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    unpacker: Arc<dyn Unpacker>,
}

impl TransferPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: CacheStore,
        unpacker: Arc<dyn Unpacker>,
    ) -> Self {
        Self {
            transport,
            cache,
            unpacker,
        }
    }

    /// Bring the resource's cache file up to date with its resolved URL.
    pub async fn download(&self, resource: &Resource) -> Result<PathBuf, FetchError> {
        let location = resource.location().clone();
        let version = resource.cache_version();
        let state = resource.snapshot();
        let url = state.download_location.clone().unwrap_or_else(|| location.clone());
        let mut dest = state
            .local_file
            .clone()
            .unwrap_or_else(|| self.cache.cache_file(&location, version.as_ref()));

        let mut guard = self.cache.open_at(&dest, &location, version.as_ref()).lock().await?;
        if guard.info().delete {
            // Superseded since the connect phase bound it; never write into a
            // generation waiting for a sweep.
            drop(guard);
            guard = self.cache.lock_current(&location, version.as_ref()).await?;
            tracing::debug!(
                location = %location,
                from = %dest.display(),
                to = %guard.path().display(),
                "cache file superseded; rebinding"
            );
            dest = guard.path().to_path_buf();
        }

        if resource.update_policy() != UpdatePolicy::Force
            && guard.is_current(state.remote_last_modified)
        {
            let len = guard.file_len().unwrap_or(0);
            tracing::info!(
                location = %location,
                path = %dest.display(),
                "cache is current; skipping transfer"
            );
            resource.set_transferred(len);
            resource.emit_progress();
            persist(&mut guard, state.size, state.remote_last_modified)?;
            return Ok(dest);
        }

        let connection = self.transport.open(&url).await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        if !connection.meta.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: connection.meta.status,
            });
        }

        let size = state.size.or(connection.meta.content_length);
        let last_modified = state.remote_last_modified.or(connection.meta.last_modified);
        resource.update(
            |s| {
                s.size = size;
                s.local_file = Some(dest.clone());
            },
            &[],
        );

        let encoding =
            Encoding::detect(connection.meta.content_encoding.as_deref(), &connection.url);
        tracing::info!(location = %location, %url, ?encoding, "downloading");

        match encoding {
            Encoding::Identity => {
                write_stream(resource, &url, connection.body, &dest).await?;
            }
            Encoding::Gzip | Encoding::PackGzip => {
                let staging_url = staging_location(&location, &url, encoding);
                let mut staging = self.cache.lock_current(&staging_url, version.as_ref()).await?;
                let staged = staging.path().to_path_buf();
                write_stream(resource, &url, connection.body, &staged).await?;
                staging.touch();
                staging.store()?;

                self.decode(encoding, &staged, &dest).await?;

                staging.mark_for_delete();
                staging.store()?;
                staging.unlock();
            }
        }

        persist(&mut guard, size, last_modified)?;
        resource.emit_progress();
        tracing::info!(
            location = %location,
            path = %dest.display(),
            bytes = resource.transferred(),
            "download complete"
        );
        Ok(dest)
    }

    async fn decode(
        &self,
        encoding: Encoding,
        staged: &Path,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let part = part_path(dest);
        let (src, out, unpacker) = (staged.to_path_buf(), part.clone(), self.unpacker.clone());
        let result = tokio::task::spawn_blocking(move || match encoding {
            Encoding::PackGzip => unpack(&src, &out, unpacker.as_ref()),
            _ => gunzip(&src, &out).map(|_| ()),
        })
        .await
        .map_err(|e| FetchError::Worker {
            reason: format!("decoder task failed: {e}"),
        })?;

        if let Err(source) = result {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(FetchError::Decode {
                path: dest.to_path_buf(),
                source,
            });
        }
        if let Err(e) = tokio::fs::rename(&part, dest).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(FetchError::transfer(dest, e));
        }
        Ok(())
    }
}

/// Record what the server said about the copy now on disk.
fn persist(
    guard: &mut EntryGuard,
    size: Option<u64>,
    last_modified: Option<i64>,
) -> Result<(), FetchError> {
    if size.is_some() {
        guard.set_remote_content_length(size);
    }
    if last_modified.is_some() {
        guard.set_last_modified(last_modified);
    }
    guard.touch();
    guard.store()?;
    Ok(())
}

/// Key for the staged, still-encoded copy: the download URL, or the location
/// plus the encoding's suffix when the two coincide.
fn staging_location(location: &Url, download: &Url, encoding: Encoding) -> Url {
    if download != location {
        return download.clone();
    }
    let mut staging = location.clone();
    staging.set_path(&format!("{}{}", location.path(), encoding.suffix()));
    staging
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream `body` into `dest` through a `.part` file, counting every chunk.
/// The `.part` file is removed whenever the copy does not reach `dest`.
async fn write_stream(
    resource: &Resource,
    url: &Url,
    body: futures_util::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>,
    dest: &Path,
) -> Result<u64, FetchError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::transfer(parent, e))?;
    }
    let part = part_path(dest);
    let result = match stream_into(resource, url, body, &part).await {
        Ok(written) => tokio::fs::rename(&part, dest)
            .await
            .map(|()| written)
            .map_err(|e| FetchError::transfer(dest, e)),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

async fn stream_into(
    resource: &Resource,
    url: &Url,
    mut body: futures_util::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>,
    part: &Path,
) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| FetchError::transfer(part, e))?;

    let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            source: TransportError::Io(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::transfer(part, e))?;
        written += chunk.len() as u64;
        resource.add_transferred(chunk.len() as u64);
        if throttle.ready() {
            resource.emit_progress();
        }
    }
    file.flush().await.map_err(|e| FetchError::transfer(part, e))?;
    file.sync_all().await.map_err(|e| FetchError::transfer(part, e))?;
    Ok(written)
}
