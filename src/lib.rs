// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! rescache - versioned resource cache and fetch engine
//!
//! Resolve, download, decode, persist. Offline when it has to be.
//!
//! A fetch moves through: **candidate URLs** -> **probe** -> **cache check**
//! -> **transfer / decode** -> **metadata persist** -> **wake waiters**.
//!
//! # Core Modules
//!
//! - [`resource`] - Resource entity and its status state machine
//! - [`cache`] - On-disk cache entries, advisory locks, generations and sweep
//! - [`resolver`] - Candidate URL construction and probing
//! - [`transport`] - HTTP transport seam (`reqwest`, raw-socket fallback)
//! - [`transfer`] - Streaming download and gzip / pack200 decoding
//! - [`tracker`] - Per-resource workers and waiting
//! - [`trust`] - Trust policy and user-decision collaborator
//! - [`events`] - Status and progress events
//! - [`config`] - Fetch policy, transport settings, persisted CLI settings
//! - [`error`] - Error taxonomy and report formatting

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod locks;
pub mod resolver;
pub mod resource;
pub mod tracker;
pub mod transfer;
pub mod transport;
pub mod trust;

pub use cache::{CacheEntry, CacheError, CacheStore, SweepReport};
pub use config::{FetchPolicy, Settings, TransportConfig};
pub use error::{format_error, FetchError};
pub use events::FetchEvent;
pub use resolver::{Resolver, UrlRequestResult};
pub use resource::{
    DownloadOptions, FetchMode, Resource, ResourceRequest, Status, Transition, UpdatePolicy,
    Version,
};
pub use tracker::{ResourceTracker, TrackerBuilder};
pub use transfer::{DecodeError, Encoding, TransferPipeline, Unpack200Command, Unpacker};
pub use transport::{ReqwestTransport, Transport, TransportError};
pub use trust::{
    ArtifactDescriptor, Headless, RememberScope, SecurityLevel, TrustPolicy, UntrustedDecision,
    UserDecisions,
};
