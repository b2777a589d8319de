// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The task that drives one resource through connect and download.

use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::FetchPolicy;
use crate::error::FetchError;
use crate::resolver::{Resolver, UrlRequestResult};
use crate::resource::{FetchMode, Resource, Status, Transition, UpdatePolicy, Version};
use crate::transfer::TransferPipeline;
use crate::transport::{HttpMethod, Transport};

/// Everything a worker needs, shared by all workers of one tracker.
pub(crate) struct WorkerContext {
    pub(crate) policy: FetchPolicy,
    pub(crate) cache: CacheStore,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Resolver,
    pub(crate) pipeline: TransferPipeline,
}

/// Run the requested phases. A phase whose start transition is rejected
/// (already running, done, or failed) is skipped, so starting a worker twice
/// is harmless. Waiters are woken after each phase whatever its outcome.
pub(crate) async fn run(ctx: Arc<WorkerContext>, resource: Arc<Resource>, mode: FetchMode) {
    if resource.change_status(&Transition::BEGIN_CONNECT) {
        if let Err(e) = connect(&ctx, &resource).await {
            resource.fail(e);
        }
        resource.notify_all();
    }

    if !mode.downloads() {
        return;
    }

    // Another worker may own the connect phase; download only once it is done.
    let status = resource.wait_until(Status::is_connected).await;
    if status.contains(Status::ERROR) {
        return;
    }
    if resource.change_status(&Transition::BEGIN_DOWNLOAD) {
        match ctx.pipeline.download(&resource).await {
            Ok(path) => {
                resource.update(|s| s.local_file = Some(path), &[Transition::DOWNLOAD_COMPLETE]);
            }
            Err(e) => {
                resource.fail(e);
            }
        }
        resource.notify_all();
    }
}

async fn connect(ctx: &WorkerContext, resource: &Resource) -> Result<(), FetchError> {
    if ctx.policy.offline || !resource.is_connectable() {
        tracing::debug!(
            location = %resource.location(),
            offline = ctx.policy.offline,
            "not connecting; using cache"
        );
        return satisfy_from_cache(ctx, resource, FetchError::OfflineUnavailable {
            location: resource.location().to_string(),
        })
        .await;
    }

    if resource.update_policy() == UpdatePolicy::Never
        && ctx
            .cache
            .open(resource.location(), resource.cache_version().as_ref())
            .is_cached()
    {
        tracing::debug!(
            location = %resource.location(),
            "update policy is never; using cached copy"
        );
        return satisfy_from_cache(ctx, resource, FetchError::OfflineUnavailable {
            location: resource.location().to_string(),
        })
        .await;
    }

    match ctx.resolver.find_best_url(resource).await? {
        Some(result) => initialize_from_url(ctx, resource, result).await,
        None => {
            tracing::info!(location = %resource.location(), "unresolvable; falling back to cache");
            satisfy_from_cache(ctx, resource, FetchError::ResolutionFailed {
                location: resource.location().to_string(),
            })
            .await
        }
    }
}

/// Connect without the network: a cached copy completes both phases at once,
/// otherwise the resource fails with `missing`.
async fn satisfy_from_cache(
    ctx: &WorkerContext,
    resource: &Resource,
    missing: FetchError,
) -> Result<(), FetchError> {
    let version = resource.cache_version();
    let guard = ctx.cache.lock_current(resource.location(), version.as_ref()).await?;
    if !guard.is_cached() {
        return Err(missing);
    }

    let path = guard.path().to_path_buf();
    let info = guard.info().clone();
    let len = guard.file_len();
    drop(guard);

    resource.update(
        |s| {
            s.local_file = Some(path);
            s.size = info.remote_content_length.or(len);
            s.remote_last_modified = info.last_modified;
        },
        &[Transition::OFFLINE_HIT],
    );
    resource.set_transferred(len.unwrap_or(0));
    tracing::info!(location = %resource.location(), "served from cache");
    Ok(())
}

/// Bind the resource to its cache file for the accepted URL. A stale cached
/// copy is marked for delete and replaced by a fresh generation; a current one
/// finishes the download phase here.
async fn initialize_from_url(
    ctx: &WorkerContext,
    resource: &Resource,
    mut result: UrlRequestResult,
) -> Result<(), FetchError> {
    if result.length.is_none() || result.last_modified.is_none() {
        fill_from_live_connection(ctx, &mut result).await;
    }
    if let Some(version) = result.version_id.as_deref().and_then(Version::parse) {
        resource.update(|s| s.download_version = Some(version), &[]);
    }

    let location = resource.location();
    let version = resource.cache_version();
    let mut guard = ctx.cache.lock_current(location, version.as_ref()).await?;

    let current = resource.update_policy() != UpdatePolicy::Force
        && guard.is_current(result.last_modified);
    if !current && guard.is_cached() {
        tracing::debug!(
            location = %location,
            path = %guard.path().display(),
            "cached copy is stale; superseding"
        );
        guard.mark_for_delete();
        guard.store()?;
        let fresh = ctx.cache.make_new_cache_file(location, version.as_ref())?;
        let fresh = ctx.cache.open_at(fresh, location, version.as_ref()).lock().await?;
        // Old lock goes only once the new one is held.
        drop(std::mem::replace(&mut guard, fresh));
    }

    if current {
        guard.touch();
    }
    guard.set_origin_path(resource.origin_hint().map(str::to_string));
    guard.store()?;

    let path = guard.path().to_path_buf();
    let len = guard.file_len();
    drop(guard);

    let transitions: &[Transition] = if current {
        &[Transition::CONNECT_SUCCEEDED, Transition::UP_TO_DATE]
    } else {
        &[Transition::CONNECT_SUCCEEDED]
    };
    resource.update(
        |s| {
            s.download_location = Some(result.url);
            s.local_file = Some(path);
            s.size = result.length;
            s.remote_last_modified = result.last_modified;
        },
        transitions,
    );
    if current {
        resource.set_transferred(len.unwrap_or(0));
        tracing::info!(location = %location, "cached copy is current");
    }
    Ok(())
}

/// A HEAD answer may lack length or last-modified; ask with GET instead.
async fn fill_from_live_connection(ctx: &WorkerContext, result: &mut UrlRequestResult) {
    if result.method != HttpMethod::Head {
        return;
    }
    match ctx.transport.probe(&result.url, HttpMethod::Get).await {
        Ok(meta) if meta.is_success() => {
            result.length = result.length.or(meta.content_length);
            result.last_modified = result.last_modified.or(meta.last_modified);
            result.content_encoding = result.content_encoding.take().or(meta.content_encoding);
        }
        Ok(meta) => {
            tracing::debug!(url = %result.url, status = meta.status, "live metadata unavailable");
        }
        Err(e) => {
            tracing::debug!(url = %result.url, error = %e, "live metadata unavailable");
        }
    }
}
