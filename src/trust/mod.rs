// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trust decisions for untrusted content and authentication challenges.
//!
//! The fetch engine never prompts anyone itself. It asks a [`UserDecisions`]
//! collaborator (an interactive prompt in the CLI, [`Headless`] elsewhere),
//! and [`TrustPolicy`] decides when that question is needed at all.

mod store;

pub use store::{ActionStore, RememberedAction, StoredAction, TrustScope};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;
use crate::resource::Resource;

/// What the user is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub location: Url,
    /// `scheme://host:port`.
    pub origin: String,
    pub title: Option<String>,
}

impl ArtifactDescriptor {
    pub fn new(location: Url) -> Self {
        let origin = origin_of(&location);
        Self {
            location,
            origin,
            title: None,
        }
    }

    pub fn for_resource(resource: &Resource) -> Self {
        let mut descriptor = Self::new(resource.location().clone());
        descriptor.title = resource.origin_hint().map(str::to_string);
        descriptor
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

fn origin_of(url: &Url) -> String {
    match (url.host_str(), url.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
        (Some(host), None) => format!("{}://{}", url.scheme(), host),
        _ => url.scheme().to_string(),
    }
}

/// How long an answer to the untrusted-content question is remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberScope {
    Once,
    Artifact,
    Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntrustedDecision {
    pub allow: bool,
    pub remember: RememberScope,
}

/// Questions only a person can answer. Calls block the asking worker.
pub trait UserDecisions: Send + Sync {
    /// The network answered HTTP 511 for `artifact`. Proceed and retry?
    fn auth_challenge(&self, artifact: &ArtifactDescriptor) -> bool;

    /// May untrusted content from `artifact` be used?
    fn untrusted_content(&self, artifact: &ArtifactDescriptor) -> UntrustedDecision;
}

/// Fixed answers for non-interactive use.
#[derive(Debug, Clone, Copy, Default)]
pub struct Headless {
    pub proceed: bool,
}

impl UserDecisions for Headless {
    fn auth_challenge(&self, _artifact: &ArtifactDescriptor) -> bool {
        self.proceed
    }

    fn untrusted_content(&self, _artifact: &ArtifactDescriptor) -> UntrustedDecision {
        UntrustedDecision {
            allow: self.proceed,
            remember: RememberScope::Once,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    AllowUntrusted,
    #[default]
    AskUntrusted,
    DenyUntrusted,
    DenyAll,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::AllowUntrusted => "allow_untrusted",
            SecurityLevel::AskUntrusted => "ask_untrusted",
            SecurityLevel::DenyUntrusted => "deny_untrusted",
            SecurityLevel::DenyAll => "deny_all",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "allow_untrusted" => Ok(SecurityLevel::AllowUntrusted),
            "ask_untrusted" => Ok(SecurityLevel::AskUntrusted),
            "deny_untrusted" => Ok(SecurityLevel::DenyUntrusted),
            "deny_all" => Ok(SecurityLevel::DenyAll),
            other => Err(format!("unknown security level `{other}`")),
        }
    }
}

/// Security level plus the remembered-decision stores, passed explicitly to
/// whoever needs a trust answer.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    level: SecurityLevel,
    user: Option<ActionStore>,
    global: Option<ActionStore>,
}

impl TrustPolicy {
    pub fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            user: None,
            global: None,
        }
    }

    pub fn with_user_store(mut self, store: ActionStore) -> Self {
        self.user = Some(store);
        self
    }

    pub fn with_global_store(mut self, store: ActionStore) -> Self {
        self.global = Some(store);
        self
    }

    /// Remembered action: the user's store first, then the global one.
    /// Unreadable stores count as having no answer.
    pub fn stored_action(&self, artifact: &ArtifactDescriptor) -> Option<StoredAction> {
        [self.user.as_ref(), self.global.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|store| {
                store
                    .lookup(artifact.location.as_str(), &artifact.origin)
                    .unwrap_or_else(|e| {
                        tracing::warn!(
                            store = %store.path().display(),
                            error = %e,
                            "ignoring unreadable trust store"
                        );
                        None
                    })
            })
    }

    /// Decide whether untrusted content from `artifact` may be used, asking
    /// `decisions` only when neither the level nor a stored action settles it.
    pub fn confirm_untrusted(
        &self,
        artifact: &ArtifactDescriptor,
        decisions: &dyn UserDecisions,
    ) -> Result<(), FetchError> {
        let denied = |reason| FetchError::UntrustedDenied {
            location: artifact.location.to_string(),
            reason,
        };

        match self.level {
            SecurityLevel::DenyAll | SecurityLevel::DenyUntrusted => {
                return Err(denied("security level forbids untrusted content"))
            }
            SecurityLevel::AllowUntrusted => return Ok(()),
            SecurityLevel::AskUntrusted => {}
        }

        match self.stored_action(artifact) {
            Some(StoredAction::Always) => return Ok(()),
            Some(StoredAction::Never) => return Err(denied("a remembered decision refuses it")),
            None => {}
        }

        let decision = decisions.untrusted_content(artifact);
        let action = if decision.allow {
            StoredAction::Always
        } else {
            StoredAction::Never
        };
        let scope = match decision.remember {
            RememberScope::Once => None,
            RememberScope::Artifact => Some(TrustScope::Artifact(artifact.location.to_string())),
            RememberScope::Origin => Some(TrustScope::Origin(artifact.origin.clone())),
        };
        if let (Some(scope), Some(store)) = (scope, self.user.as_ref()) {
            if let Err(e) = store.remember(action, scope) {
                tracing::warn!(error = %e, "failed to remember trust decision");
            }
        }

        if decision.allow {
            Ok(())
        } else {
            Err(denied("declined by user"))
        }
    }
}
