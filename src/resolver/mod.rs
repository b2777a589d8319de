// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Picks the best reachable URL for a resource.
//!
//! Every candidate is probed with HEAD, then every candidate with GET. The
//! first 2xx answer wins and nothing after it is probed. Redirect targets are
//! appended to the candidate list. A network error on one candidate is logged
//! and skipped; only running out of candidates is a resolution failure.

mod candidates;

pub use candidates::{candidates, PACK_SUFFIX, VERSION_MARKER, VERSION_QUERY};

use std::sync::Arc;

use url::Url;

use crate::config::FetchPolicy;
use crate::error::FetchError;
use crate::resource::Resource;
use crate::transport::{HttpMethod, ResponseMeta, Transport, NETWORK_AUTHENTICATION_REQUIRED};
use crate::trust::{ArtifactDescriptor, UserDecisions};

/// Outcome of probing one URL with one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRequestResult {
    pub url: Url,
    pub method: HttpMethod,
    pub status: u16,
    /// Resolved `Location` of a redirect.
    pub redirect: Option<Url>,
    pub length: Option<u64>,
    /// Epoch milliseconds.
    pub last_modified: Option<i64>,
    pub content_encoding: Option<String>,
    pub version_id: Option<String>,
}

impl UrlRequestResult {
    fn from_meta(url: Url, method: HttpMethod, meta: ResponseMeta) -> Self {
        let redirect = meta.location.as_deref().and_then(|target| url.join(target).ok());
        Self {
            url,
            method,
            status: meta.status,
            redirect,
            length: meta.content_length,
            last_modified: meta.last_modified,
            content_encoding: meta.content_encoding,
            version_id: meta.version_id,
        }
    }
}

pub struct Resolver {
    transport: Arc<dyn Transport>,
    policy: FetchPolicy,
    decisions: Arc<dyn UserDecisions>,
}

impl Resolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: FetchPolicy,
        decisions: Arc<dyn UserDecisions>,
    ) -> Self {
        Self {
            transport,
            policy,
            decisions,
        }
    }

    /// Best URL for `resource`, `Ok(None)` when nothing answered with 2xx.
    ///
    /// Errors are fatal: a declined authentication challenge or a redirect
    /// while redirects are disabled.
    pub async fn find_best_url(
        &self,
        resource: &Resource,
    ) -> Result<Option<UrlRequestResult>, FetchError> {
        let mut urls = candidates(
            resource.location(),
            resource.request_version(),
            resource.options(),
        );
        tracing::debug!(location = %resource.location(), candidates = urls.len(), "resolving");

        for method in HttpMethod::PROBE_ORDER {
            let mut index = 0;
            while index < urls.len() {
                let url = urls[index].clone();
                index += 1;

                let Some(meta) = self.probe_with_auth(resource, &url, method).await? else {
                    continue;
                };

                if meta.is_redirect() {
                    let result = UrlRequestResult::from_meta(url.clone(), method, meta);
                    if !self.policy.allow_redirects {
                        return Err(FetchError::RedirectDisallowed {
                            url: url.to_string(),
                            status: result.status,
                            target: result.redirect.map(String::from).unwrap_or_default(),
                        });
                    }
                    match result.redirect {
                        Some(target) => {
                            tracing::debug!(
                                %url,
                                %target,
                                status = result.status,
                                "following redirect"
                            );
                            if !urls.contains(&target) {
                                urls.push(target);
                            }
                        }
                        None => {
                            tracing::warn!(
                                %url,
                                status = result.status,
                                "redirect without usable Location; skipping"
                            );
                        }
                    }
                    continue;
                }

                if !meta.is_success() {
                    tracing::debug!(%url, %method, status = meta.status, "candidate rejected");
                    continue;
                }

                tracing::info!(location = %resource.location(), %url, %method, "resolved");
                return Ok(Some(UrlRequestResult::from_meta(url, method, meta)));
            }
        }

        tracing::warn!(location = %resource.location(), "no candidate URL answered");
        Ok(None)
    }

    /// Probe once, repeating while the network demands authentication and the
    /// user agrees. `None` means the candidate is unusable.
    async fn probe_with_auth(
        &self,
        resource: &Resource,
        url: &Url,
        method: HttpMethod,
    ) -> Result<Option<ResponseMeta>, FetchError> {
        loop {
            let meta = match self.transport.probe(url, method).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(
                        %url,
                        %method,
                        error = %e,
                        "probe failed; trying next candidate"
                    );
                    return Ok(None);
                }
            };
            if meta.status != NETWORK_AUTHENTICATION_REQUIRED {
                return Ok(Some(meta));
            }
            if self.policy.skip_auth_challenge {
                tracing::debug!(%url, "authentication challenge skipped by policy");
                return Ok(None);
            }
            if !self.ask_auth_challenge(resource).await {
                return Err(FetchError::AuthDeclined {
                    location: resource.location().to_string(),
                });
            }
            tracing::info!(%url, "authentication challenge accepted; retrying");
        }
    }

    async fn ask_auth_challenge(&self, resource: &Resource) -> bool {
        let decisions = self.decisions.clone();
        let artifact = ArtifactDescriptor::for_resource(resource);
        tokio::task::spawn_blocking(move || decisions.auth_challenge(&artifact))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "authentication prompt panicked; treating as declined");
                false
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::resource::{DownloadOptions, ResourceRequest, Version};
    use crate::transport::mock::{Call, ScriptedTransport};
    use crate::trust::{Headless, UntrustedDecision};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const APP: &str = "https://example.com/app.jar";

    fn resource(request: ResourceRequest) -> Resource {
        let (tx, _) = events::channel();
        Resource::new(request, tx)
    }

    fn ok(length: u64) -> ResponseMeta {
        ResponseMeta {
            content_length: Some(length),
            last_modified: Some(1_000),
            ..ResponseMeta::new(200)
        }
    }

    fn redirect(to: &str) -> ResponseMeta {
        ResponseMeta {
            location: Some(to.to_string()),
            ..ResponseMeta::new(302)
        }
    }

    fn resolver(transport: Arc<ScriptedTransport>, policy: FetchPolicy) -> Resolver {
        Resolver::new(transport, policy, Arc::new(Headless { proceed: true }))
    }

    fn redirects_allowed() -> FetchPolicy {
        FetchPolicy {
            allow_redirects: true,
            ..FetchPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_head_preferred_over_get() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_both(APP, ok(10));
        let resolver = resolver(transport.clone(), FetchPolicy::default());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.method, HttpMethod::Head);
        assert_eq!(result.length, Some(10));
        assert_eq!(transport.calls(), [Call::Probe(HttpMethod::Head, APP.into())]);
    }

    #[tokio::test]
    async fn test_404_then_redirect_then_success() {
        let pack = "https://example.com/app.jar.pack.gz";
        let moved = "https://mirror.example.com/app.jar";
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_reply(HttpMethod::Head, pack, ResponseMeta::new(404))
            .probe_reply(HttpMethod::Head, APP, redirect(moved))
            .probe_reply(HttpMethod::Head, moved, ok(7));
        let resolver = resolver(transport.clone(), redirects_allowed());

        let request = ResourceRequest::parse(APP).unwrap().options(DownloadOptions {
            use_pack: true,
            use_version: false,
        });
        let result = resolver.find_best_url(&resource(request)).await.unwrap().unwrap();

        assert_eq!(result.url.as_str(), moved);
        assert_eq!(result.method, HttpMethod::Head);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_get_used_when_head_fails_everywhere() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_reply(HttpMethod::Head, APP, ResponseMeta::new(405))
            .probe_reply(HttpMethod::Get, APP, ok(3));
        let resolver = resolver(transport, FetchPolicy::default());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn test_redirect_disallowed_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_reply(HttpMethod::Head, APP, redirect("/elsewhere.jar"));
        let resolver = resolver(transport, FetchPolicy::default());

        let err = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap_err();
        match err {
            FetchError::RedirectDisallowed { status, target, .. } => {
                assert_eq!(status, 302);
                assert_eq!(target, "https://example.com/elsewhere.jar");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_skipped() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_reply(HttpMethod::Head, APP, ResponseMeta::new(301))
            .probe_reply(HttpMethod::Get, APP, ok(1));
        let resolver = resolver(transport, redirects_allowed());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn test_redirect_loop_terminates() {
        let other = "https://example.com/other.jar";
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_both(APP, redirect(other))
            .probe_both(other, redirect(APP));
        let resolver = resolver(transport, redirects_allowed());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_network_errors_are_skipped() {
        let versioned = "https://example.com/app.jar?version-id=1.0";
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_error(HttpMethod::Head, versioned, "connection refused")
            .probe_reply(HttpMethod::Head, APP, ok(2));
        let resolver = resolver(transport, FetchPolicy::default());

        let request = ResourceRequest::parse(APP).unwrap().version(Version::parse("1.0"));
        let result = resolver.find_best_url(&resource(request)).await.unwrap().unwrap();
        assert_eq!(result.url.as_str(), APP);
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_an_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let resolver = resolver(transport.clone(), FetchPolicy::default());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(transport.calls().len(), 2);
    }

    struct CountingAuth {
        proceed: bool,
        asked: AtomicUsize,
    }

    impl UserDecisions for CountingAuth {
        fn auth_challenge(&self, _artifact: &ArtifactDescriptor) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.proceed
        }

        fn untrusted_content(&self, _artifact: &ArtifactDescriptor) -> UntrustedDecision {
            unreachable!("resolver never asks about untrusted content")
        }
    }

    #[tokio::test]
    async fn test_auth_challenge_accepted_retries_same_candidate() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .probe_reply(HttpMethod::Head, APP, ResponseMeta::new(511))
            .probe_reply(HttpMethod::Head, APP, ok(4));
        let auth = Arc::new(CountingAuth {
            proceed: true,
            asked: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(transport.clone(), FetchPolicy::default(), auth.clone());

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.url.as_str(), APP);
        assert_eq!(auth.asked.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.calls(),
            [Call::Probe(HttpMethod::Head, APP.into()), Call::Probe(HttpMethod::Head, APP.into())]
        );
    }

    #[tokio::test]
    async fn test_auth_challenge_declined_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_reply(HttpMethod::Head, APP, ResponseMeta::new(511));
        let auth = Arc::new(CountingAuth {
            proceed: false,
            asked: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(transport, FetchPolicy::default(), auth);

        let err = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AuthDeclined { .. }));
    }

    #[tokio::test]
    async fn test_skipped_auth_challenge_moves_on() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.probe_both(APP, ResponseMeta::new(511));
        let policy = FetchPolicy {
            skip_auth_challenge: true,
            ..FetchPolicy::default()
        };
        let resolver = resolver(transport, policy);

        let result = resolver
            .find_best_url(&resource(ResourceRequest::parse(APP).unwrap()))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
