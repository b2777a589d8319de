// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request-side value types: what to fetch and how.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;

/// Opaque version string. Empty versions are normalised to `None` by
/// [`Version::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn parse(version: &str) -> Option<Self> {
        let trimmed = version.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which URL variants the resolver should try before the plain location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Try `.pack.gz` variants.
    pub use_pack: bool,
    /// Try `__V<version>` filename variants.
    pub use_version: bool,
}

impl DownloadOptions {
    pub const NONE: DownloadOptions = DownloadOptions {
        use_pack: false,
        use_version: false,
    };
}

/// How a cached copy is weighed against the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Re-check freshness against the server's last-modified time.
    #[default]
    Always,
    /// Use any cached copy without going online.
    Never,
    /// Treat every cached copy as stale.
    Force,
}

/// Which phases a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Resolve only; the resource stops at `CONNECTED`.
    ConnectOnly,
    /// Resolve then download.
    Full,
}

impl FetchMode {
    pub fn downloads(self) -> bool {
        matches!(self, FetchMode::Full)
    }
}

/// Everything that identifies one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub location: Url,
    pub version: Option<Version>,
    pub options: DownloadOptions,
    pub update_policy: UpdatePolicy,
    /// Path of the descriptor that asked for this resource, remembered in the
    /// cache entry.
    pub origin_hint: Option<String>,
}

impl ResourceRequest {
    pub fn new(location: Url) -> Self {
        Self {
            location,
            version: None,
            options: DownloadOptions::default(),
            update_policy: UpdatePolicy::default(),
            origin_hint: None,
        }
    }

    /// Parse a location string. Only absolute URLs are accepted.
    pub fn parse(location: &str) -> Result<Self, FetchError> {
        let url = Url::parse(location)
            .map_err(|e| FetchError::invalid_location(location, e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(FetchError::invalid_location(location, "not a hierarchical URL"));
        }
        Ok(Self::new(url))
    }

    pub fn version(mut self, version: Option<Version>) -> Self {
        self.version = version;
        self
    }

    pub fn options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    pub fn origin_hint(mut self, hint: impl Into<String>) -> Self {
        self.origin_hint = Some(hint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_trims_and_rejects_empty() {
        assert_eq!(Version::parse(" 1.2 "), Some(Version::new("1.2")));
        assert_eq!(Version::parse("   "), None);
    }

    #[test]
    fn test_request_builder() {
        let request = ResourceRequest::parse("https://example.com/lib/app.jar")
            .unwrap()
            .version(Version::parse("2.0"))
            .options(DownloadOptions {
                use_pack: true,
                use_version: false,
            })
            .update_policy(UpdatePolicy::Force);

        assert_eq!(request.location.path(), "/lib/app.jar");
        assert_eq!(request.version.as_ref().map(Version::as_str), Some("2.0"));
        assert!(request.options.use_pack);
        assert_eq!(request.update_policy, UpdatePolicy::Force);
    }

    #[test]
    fn test_parse_rejects_relative_and_opaque() {
        assert!(matches!(
            ResourceRequest::parse("lib/app.jar"),
            Err(FetchError::InvalidLocation { .. })
        ));
        assert!(ResourceRequest::parse("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_update_policy_serde() {
        let json = serde_json::to_string(&UpdatePolicy::Never).unwrap();
        assert_eq!(json, "\"never\"");
    }
}
