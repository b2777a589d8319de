// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One cacheable artifact and its fetch lifecycle.
//!
//! A [`Resource`] is written only by the worker fetching it. Observers read
//! status and progress concurrently: status and the other shared fields sit
//! behind one monitor, the transferred-byte counter is a lone atomic so it can
//! be bumped per chunk without taking the monitor.
//!
//! Every accepted status change wakes three kinds of observer:
//! - synchronous callers blocked in [`Resource::wait_blocking`] (Condvar)
//! - async callers awaiting [`Resource::wait`] (watch channel)
//! - event subscribers ([`FetchEvent::StatusChanged`])

mod status;
mod types;

pub use status::{Status, Transition};
pub use types::{DownloadOptions, FetchMode, ResourceRequest, UpdatePolicy, Version};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use url::Url;

use crate::error::FetchError;
use crate::events::FetchEvent;
use crate::locks::{resilient_lock, resilient_wait_timeout};

/// Identity of a resource: two requests with the same key share one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub location: Url,
    pub version: Option<Version>,
}

/// Mutable fields guarded by the resource monitor.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    pub status: Status,
    /// URL the resolver accepted.
    pub download_location: Option<Url>,
    /// Version the server reported serving, when it differs from the request.
    pub download_version: Option<Version>,
    /// Cache file assigned to this resource.
    pub local_file: Option<PathBuf>,
    /// Remote length in bytes, when known.
    pub size: Option<u64>,
    /// Remote last-modified, epoch milliseconds.
    pub remote_last_modified: Option<i64>,
    /// Cause of the `ERROR` flag.
    pub error: Option<Arc<FetchError>>,
}

#[derive(Debug)]
pub struct Resource {
    location: Url,
    request_version: Option<Version>,
    options: DownloadOptions,
    update_policy: UpdatePolicy,
    origin_hint: Option<String>,
    state: Mutex<ResourceState>,
    done: Condvar,
    status_tx: watch::Sender<Status>,
    transferred: AtomicU64,
    events: broadcast::Sender<FetchEvent>,
}

impl Resource {
    pub fn new(request: ResourceRequest, events: broadcast::Sender<FetchEvent>) -> Self {
        let (status_tx, _) = watch::channel(Status::INITIAL);
        Self {
            location: request.location,
            request_version: request.version,
            options: request.options,
            update_policy: request.update_policy,
            origin_hint: request.origin_hint,
            state: Mutex::new(ResourceState::default()),
            done: Condvar::new(),
            status_tx,
            transferred: AtomicU64::new(0),
            events,
        }
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn request_version(&self) -> Option<&Version> {
        self.request_version.as_ref()
    }

    pub fn options(&self) -> DownloadOptions {
        self.options
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    pub fn origin_hint(&self) -> Option<&str> {
        self.origin_hint.as_deref()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            location: self.location.clone(),
            version: self.request_version.clone(),
        }
    }

    /// Version the cache entry is keyed under: the served version when the
    /// server reported one, otherwise the requested one.
    pub fn cache_version(&self) -> Option<Version> {
        resilient_lock(&self.state)
            .download_version
            .clone()
            .or_else(|| self.request_version.clone())
    }

    /// Only http(s) resources can be resolved over the network.
    pub fn is_connectable(&self) -> bool {
        matches!(self.location.scheme(), "http" | "https")
    }

    pub fn status(&self) -> Status {
        resilient_lock(&self.state).status
    }

    pub fn snapshot(&self) -> ResourceState {
        resilient_lock(&self.state).clone()
    }

    pub fn local_file(&self) -> Option<PathBuf> {
        resilient_lock(&self.state).local_file.clone()
    }

    pub fn download_location(&self) -> Option<Url> {
        resilient_lock(&self.state).download_location.clone()
    }

    pub fn size(&self) -> Option<u64> {
        resilient_lock(&self.state).size
    }

    pub fn error(&self) -> Option<Arc<FetchError>> {
        resilient_lock(&self.state).error.clone()
    }

    /// Apply one guarded transition. Returns whether it was accepted.
    pub fn change_status(&self, transition: &Transition) -> bool {
        self.update(|_| {}, std::slice::from_ref(transition))
    }

    /// Mutate fields and apply transitions under one monitor acquisition.
    /// Rejected transitions are skipped. Returns whether any status change
    /// was accepted.
    pub fn update<F>(&self, mutate: F, transitions: &[Transition]) -> bool
    where
        F: FnOnce(&mut ResourceState),
    {
        let (old, new) = {
            let mut state = resilient_lock(&self.state);
            mutate(&mut state);
            let old = state.status;
            for transition in transitions {
                if let Some(next) = transition.apply(state.status) {
                    state.status = next;
                }
            }
            (old, state.status)
        };
        if old == new {
            return false;
        }
        tracing::debug!(location = %self.location, %old, %new, "status changed");
        self.publish_status(new);
        let _ = self.events.send(FetchEvent::StatusChanged {
            location: self.location.clone(),
            old,
            new,
        });
        true
    }

    /// Record a fatal error and move to `ERROR`.
    pub fn fail(&self, error: FetchError) -> Arc<FetchError> {
        let error = Arc::new(error);
        tracing::error!(location = %self.location, error = %error, "fetch failed");
        let stored = error.clone();
        self.update(
            move |state| {
                state.error.get_or_insert(stored);
            },
            &[Transition::FAILED],
        );
        self.error().unwrap_or(error)
    }

    /// Wake every waiter so it re-checks the current status.
    pub fn notify_all(&self) {
        let status = self.status();
        self.publish_status(status);
    }

    fn publish_status(&self, status: Status) {
        self.status_tx.send_replace(status);
        self.done.notify_all();
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Count newly written bytes; returns the running total.
    pub fn add_transferred(&self, bytes: u64) -> u64 {
        self.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Raise the counter to `bytes`. The counter never decreases.
    pub fn set_transferred(&self, bytes: u64) {
        self.transferred.fetch_max(bytes, Ordering::AcqRel);
    }

    pub fn emit_progress(&self) {
        let _ = self.events.send(FetchEvent::Progress {
            location: self.location.clone(),
            transferred: self.transferred(),
            total: self.size(),
        });
    }

    /// Wait until the resource reaches `DOWNLOADED` or `ERROR`.
    pub async fn wait(&self) -> Status {
        self.wait_until(Status::is_terminal).await
    }

    /// Wait until `done` holds for the current status.
    pub async fn wait_until<P>(&self, done: P) -> Status
    where
        P: Fn(Status) -> bool,
    {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = self.status();
            if done(status) {
                return status;
            }
            // The sender lives as long as `self`, so this cannot close.
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Block the calling thread until the resource is terminal or `timeout`
    /// elapses (`None` waits forever). Returns the last observed status.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Status {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = resilient_lock(&self.state);
        loop {
            if state.status.is_terminal() {
                return state.status;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return state.status;
                    }
                    deadline - now
                }
                None => Duration::from_secs(1),
            };
            let (next, _) = resilient_wait_timeout(&self.done, state, slice);
            state = next;
        }
    }
}
