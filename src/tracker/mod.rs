// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Entry point for callers: hands out resources and runs their workers.
//!
//! ```no_run
//! # async fn demo() -> Result<(), rescache::FetchError> {
//! use rescache::{ResourceRequest, ResourceTracker};
//!
//! let tracker = ResourceTracker::builder().build()?;
//! let path = tracker
//!     .fetch(ResourceRequest::parse("https://example.com/lib/app.jar")?)
//!     .await?;
//! println!("cached at {}", path.display());
//! # Ok(())
//! # }
//! ```

mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::CacheStore;
use crate::config::{FetchPolicy, TransportConfig};
use crate::error::FetchError;
use crate::events::{self, FetchEvent};
use crate::locks::resilient_lock;
use crate::resolver::Resolver;
use crate::resource::{FetchMode, Resource, ResourceKey, ResourceRequest, Status};
use crate::transfer::{TransferPipeline, Unpack200Command, Unpacker};
use crate::transport::{ReqwestTransport, Transport};
use crate::trust::{ArtifactDescriptor, Headless, SecurityLevel, TrustPolicy, UserDecisions};

use worker::WorkerContext;

/// Builder for [`ResourceTracker`]. Every collaborator has a default: the
/// `reqwest` transport, `~/.rescache/cache`, `unpack200` from `PATH`, and
/// headless decisions that decline.
#[derive(Default)]
pub struct TrackerBuilder {
    cache: Option<CacheStore>,
    policy: FetchPolicy,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    decisions: Option<Arc<dyn UserDecisions>>,
    unpacker: Option<Arc<dyn Unpacker>>,
    trust: Option<TrustPolicy>,
}

impl TrackerBuilder {
    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_root(self, root: impl Into<PathBuf>) -> Self {
        self.cache(CacheStore::new(root))
    }

    pub fn policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn decisions(mut self, decisions: Arc<dyn UserDecisions>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    pub fn unpacker(mut self, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpacker = Some(unpacker);
        self
    }

    pub fn trust_policy(mut self, trust: TrustPolicy) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn build(self) -> Result<ResourceTracker, FetchError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.transport_config).map_err(
                |source| FetchError::Transport {
                    url: String::new(),
                    source,
                },
            )?),
        };
        let cache = self.cache.unwrap_or_else(|| CacheStore::new(CacheStore::default_root()));
        let decisions = self.decisions.unwrap_or_else(|| Arc::new(Headless::default()));
        let unpacker = self
            .unpacker
            .unwrap_or_else(|| Arc::new(Unpack200Command::default()));

        let ctx = WorkerContext {
            policy: self.policy,
            cache: cache.clone(),
            transport: transport.clone(),
            resolver: Resolver::new(transport.clone(), self.policy, decisions.clone()),
            pipeline: TransferPipeline::new(transport, cache, unpacker),
        };
        let (events, _) = events::channel();

        Ok(ResourceTracker {
            ctx: Arc::new(ctx),
            decisions,
            trust: self.trust.unwrap_or_else(|| TrustPolicy::new(SecurityLevel::default())),
            events,
            resources: Mutex::new(HashMap::new()),
        })
    }
}

/// Owns the shared collaborators and every live resource. Requests for the
/// same (location, version) share one [`Resource`] until it fails.
pub struct ResourceTracker {
    ctx: Arc<WorkerContext>,
    decisions: Arc<dyn UserDecisions>,
    trust: TrustPolicy,
    events: broadcast::Sender<FetchEvent>,
    resources: Mutex<HashMap<ResourceKey, Arc<Resource>>>,
}

impl ResourceTracker {
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::default()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.ctx.cache
    }

    pub fn policy(&self) -> FetchPolicy {
        self.ctx.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        self.events.subscribe()
    }

    /// The resource for `request`, created on first use. A resource that
    /// failed is replaced so the request can be retried.
    pub fn add_resource(&self, request: ResourceRequest) -> Arc<Resource> {
        let key = ResourceKey {
            location: request.location.clone(),
            version: request.version.clone(),
        };
        let mut resources = resilient_lock(&self.resources);
        if let Some(existing) = resources.get(&key) {
            if !existing.status().contains(Status::ERROR) {
                return existing.clone();
            }
        }
        let resource = Arc::new(Resource::new(request, self.events.clone()));
        resources.insert(key, resource.clone());
        resource
    }

    /// Resources added so far.
    pub fn resources(&self) -> Vec<Arc<Resource>> {
        resilient_lock(&self.resources).values().cloned().collect()
    }

    /// Spawn a worker for `resource`. Must be called inside a Tokio runtime.
    pub fn start(&self, resource: &Arc<Resource>, mode: FetchMode) {
        let ctx = self.ctx.clone();
        let resource = resource.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(worker::run(ctx, resource.clone(), mode));
            if let Err(e) = task.await {
                resource.fail(FetchError::Worker { reason: e.to_string() });
                resource.notify_all();
            }
        });
    }

    /// Fetch `request` and return its cache file.
    pub async fn fetch(&self, request: ResourceRequest) -> Result<PathBuf, FetchError> {
        let resource = self.add_resource(request);
        self.start(&resource, FetchMode::Full);
        let status = resource.wait().await;
        completed_path(&resource, status)
    }

    /// Resolve `request` without downloading. The returned resource carries
    /// the accepted URL and remote metadata.
    pub async fn connect(&self, request: ResourceRequest) -> Result<Arc<Resource>, FetchError> {
        let resource = self.add_resource(request);
        self.start(&resource, FetchMode::ConnectOnly);
        let status = resource.wait_until(Status::is_connected).await;
        if status.contains(Status::ERROR) {
            return Err(failure(&resource));
        }
        Ok(resource)
    }

    /// Wait until every resource is terminal. Returns `false` on timeout.
    pub async fn wait_for_all(
        &self,
        resources: &[Arc<Resource>],
        timeout: Option<Duration>,
    ) -> bool {
        let all = futures_util::future::join_all(resources.iter().map(|r| r.wait()));
        match timeout {
            Some(limit) => tokio::time::timeout(limit, all).await.is_ok(),
            None => {
                all.await;
                true
            }
        }
    }

    /// Ask whether untrusted content from `artifact` may be used.
    pub async fn confirm_untrusted(&self, artifact: ArtifactDescriptor) -> Result<(), FetchError> {
        let trust = self.trust.clone();
        let decisions = self.decisions.clone();
        tokio::task::spawn_blocking(move || trust.confirm_untrusted(&artifact, decisions.as_ref()))
            .await
            .map_err(|e| FetchError::Worker {
                reason: format!("trust prompt failed: {e}"),
            })?
    }
}

fn failure(resource: &Resource) -> FetchError {
    match resource.error() {
        Some(cause) => FetchError::ResourceFailed {
            location: resource.location().to_string(),
            cause,
        },
        None => FetchError::Worker {
            reason: format!("{} failed without a recorded cause", resource.location()),
        },
    }
}

fn completed_path(resource: &Resource, status: Status) -> Result<PathBuf, FetchError> {
    if status.contains(Status::ERROR) {
        return Err(failure(resource));
    }
    resource.local_file().ok_or_else(|| FetchError::Worker {
        reason: format!("{} finished without a cache file", resource.location()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use crate::transport::ResponseMeta;
    use crate::trust::{RememberScope, UntrustedDecision};
    use std::fs;
    use tempfile::TempDir;
    use url::Url;

    const APP: &str = "https://example.com/app.jar";

    fn tracker(dir: &TempDir, transport: Arc<ScriptedTransport>) -> ResourceTracker {
        ResourceTracker::builder()
            .cache_root(dir.path())
            .transport(transport)
            .build()
            .unwrap()
    }

    fn ok(length: u64) -> ResponseMeta {
        ResponseMeta {
            content_length: Some(length),
            last_modified: Some(1_000),
            ..ResponseMeta::new(200)
        }
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_shares_resource() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_both(APP, ok(5)).body(APP, ok(5), b"hello".to_vec());
        let tracker = tracker(&dir, transport.clone());

        let path = tracker.fetch(ResourceRequest::parse(APP).unwrap()).await.unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        let again = tracker.fetch(ResourceRequest::parse(APP).unwrap()).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(tracker.resources().len(), 1);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_failed_resource_is_replaced() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let tracker = tracker(&dir, transport.clone());

        let err = tracker.fetch(ResourceRequest::parse(APP).unwrap()).await.unwrap_err();
        assert!(matches!(err.root(), FetchError::ResolutionFailed { .. }));

        transport.probe_both(APP, ok(2)).body(APP, ok(2), b"ok".to_vec());
        let path = tracker.fetch(ResourceRequest::parse(APP).unwrap()).await.unwrap();
        assert_eq!(fs::read(path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_both(APP, ok(3)).body(APP, ok(3), b"abc".to_vec());
        let tracker = tracker(&dir, transport);
        let mut rx = tracker.subscribe();

        tracker.fetch(ResourceRequest::parse(APP).unwrap()).await.unwrap();

        let mut saw_done = false;
        let mut saw_progress = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                FetchEvent::StatusChanged { new, .. } => {
                    saw_done |= new.contains(Status::DOWNLOADED)
                }
                FetchEvent::Progress { transferred, .. } => saw_progress |= transferred == 3,
            }
        }
        assert!(saw_done);
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn test_wait_for_all_and_timeout() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let other = "https://example.com/other.jar";
        transport
            .probe_both(APP, ok(1))
            .body(APP, ok(1), b"a".to_vec())
            .probe_both(other, ok(1))
            .body(other, ok(1), b"b".to_vec());
        let tracker = tracker(&dir, transport);

        let a = tracker.add_resource(ResourceRequest::parse(APP).unwrap());
        let b = tracker.add_resource(ResourceRequest::parse(other).unwrap());
        let idle =
            tracker.add_resource(ResourceRequest::parse("https://example.com/idle.jar").unwrap());

        tracker.start(&a, FetchMode::Full);
        tracker.start(&b, FetchMode::Full);
        assert!(tracker.wait_for_all(&[a.clone(), b.clone()], Some(Duration::from_secs(5))).await);
        assert!(!tracker.wait_for_all(&[idle], Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn test_connect_reports_metadata() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_both(APP, ok(42));
        let tracker = tracker(&dir, transport.clone());

        let resource = tracker.connect(ResourceRequest::parse(APP).unwrap()).await.unwrap();
        assert_eq!(resource.size(), Some(42));
        assert_eq!(resource.download_location(), Some(Url::parse(APP).unwrap()));
        assert_eq!(transport.opens(), 0);
    }

    struct AllowOnce;

    impl UserDecisions for AllowOnce {
        fn auth_challenge(&self, _artifact: &ArtifactDescriptor) -> bool {
            false
        }

        fn untrusted_content(&self, _artifact: &ArtifactDescriptor) -> UntrustedDecision {
            UntrustedDecision {
                allow: true,
                remember: RememberScope::Once,
            }
        }
    }

    #[tokio::test]
    async fn test_confirm_untrusted_uses_injected_policy() {
        let dir = TempDir::new().unwrap();
        let artifact = ArtifactDescriptor::new(Url::parse(APP).unwrap());

        let asking = ResourceTracker::builder()
            .cache_root(dir.path())
            .transport(Arc::new(ScriptedTransport::new()))
            .decisions(Arc::new(AllowOnce))
            .build()
            .unwrap();
        assert!(asking.confirm_untrusted(artifact.clone()).await.is_ok());

        let denying = ResourceTracker::builder()
            .cache_root(dir.path())
            .transport(Arc::new(ScriptedTransport::new()))
            .decisions(Arc::new(AllowOnce))
            .trust_policy(TrustPolicy::new(SecurityLevel::DenyAll))
            .build()
            .unwrap();
        assert!(matches!(
            denying.confirm_untrusted(artifact).await,
            Err(FetchError::UntrustedDenied { .. })
        ));
    }
}
