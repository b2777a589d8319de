// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the fetch engine, and the formatting used when a fetch
//! failure is shown to a person.
//!
//! Only [`FetchError::ResolutionFailed`] is recoverable: it sends the worker to
//! the offline path. Everything else puts the resource into `ERROR` and wakes
//! its waiters.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheError;
use crate::transfer::DecodeError;
use crate::transport::TransportError;

/// Issues URL shown under every formatted error.
pub const ISSUES_URL: &str = "https://github.com/rescache/rescache/issues";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no reachable URL for {location}")]
    ResolutionFailed { location: String },

    #[error("authentication challenge for {location} was declined")]
    AuthDeclined { location: String },

    #[error("{url} is being redirected ({status}) to {target}; redirects are disabled")]
    RedirectDisallowed {
        url: String,
        status: u16,
        target: String,
    },

    #[error("transfer from {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("server answered HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed to write {}: {source}", path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("{location} is not cached and cannot be downloaded (offline)")]
    OfflineUnavailable { location: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("untrusted content at {location} refused: {reason}")]
    UntrustedDenied {
        location: String,
        reason: &'static str,
    },

    #[error("invalid location `{input}`: {reason}")]
    InvalidLocation { input: String, reason: String },

    #[error("fetch of {location} failed")]
    ResourceFailed {
        location: String,
        #[source]
        cause: Arc<FetchError>,
    },

    #[error("fetch worker failed: {reason}")]
    Worker { reason: String },
}

impl FetchError {
    pub fn invalid_location(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn transfer(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Transfer {
            path: path.into(),
            source,
        }
    }

    /// Whether this error ends the fetch. A resolution failure does not: the
    /// worker falls back to whatever the cache holds.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ResolutionFailed { .. })
    }

    /// Follow [`FetchError::ResourceFailed`] wrappers down to the error that
    /// actually stopped the worker.
    pub fn root(&self) -> &FetchError {
        match self {
            Self::ResourceFailed { cause, .. } => cause.root(),
            other => other,
        }
    }

    /// Human-facing report with likely causes and fixes.
    pub fn report(&self) -> String {
        let root = self.root();
        let builder = ErrorBuilder::new(self.to_string());
        let builder = if std::ptr::eq(root, self) {
            builder
        } else {
            builder.cause(root.to_string())
        };
        match root {
            Self::OfflineUnavailable { .. } => builder
                .cause("Offline mode is on, or the server could not be reached")
                .fix("Retry without --offline once the network is available")
                .fix("Check what is cached: rescache cache list"),
            Self::RedirectDisallowed { .. } => builder
                .cause("The server moved the resource and redirects are disabled")
                .fix("Allow redirects: rescache fetch --allow-redirects <url>"),
            Self::AuthDeclined { .. } => builder
                .cause("The network asked for authentication (HTTP 511)")
                .fix("Log in to the network, then fetch again"),
            Self::Decode { .. } => builder
                .cause("The server sent a corrupt compressed payload")
                .cause("The unpack200 tool is missing or failed")
                .fix("Set \"unpack200\" in the config file to a working unpack200 binary"),
            Self::Cache(_) => builder
                .cause("The cache directory is not writable, or its metadata is damaged")
                .fix("Inspect the cache: rescache cache path")
                .fix("Remove entries marked for deletion: rescache cache clean"),
            Self::UntrustedDenied { .. } => builder
                .cause("The security level or a remembered decision refuses this content")
                .fix("Review security_level in: rescache config show"),
            _ => builder,
        }
        .build()
    }
}

/// Formats an error message with title, causes, fixes, and help link.
///
/// ```
/// use rescache::error::format_error;
///
/// let error = format_error(
///     "Failed to fetch https://example.com/app.jar",
///     &["Server unreachable"],
///     &["Retry later"],
/// );
/// assert!(error.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n\n", title));

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(&format!("Need help? {}", ISSUES_URL));

    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}
