// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration.
//!
//! The library never reads configuration on its own. [`FetchPolicy`] and
//! [`TransportConfig`] are handed to the tracker by the caller; [`Settings`]
//! is the CLI's persisted file (`~/.rescache/config.json`) that produces them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::trust::SecurityLevel;

/// Administrative switches consulted by every fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPolicy {
    /// Never touch the network; serve from the cache or fail.
    pub offline: bool,
    /// Follow 301/302/303/307/308 answers during resolution.
    pub allow_redirects: bool,
    /// Proceed through HTTP 511 without asking.
    pub skip_auth_challenge: bool,
}

/// Settings for [`crate::transport::ReqwestTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Honor `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY`.
    pub use_system_proxy: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            read_timeout: Duration::from_secs(default_read_timeout_secs()),
            use_system_proxy: true,
        }
    }
}

/// Persisted CLI settings. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Cache root; defaults to `~/.rescache/cache`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub allow_redirects: bool,
    #[serde(default)]
    pub skip_auth_challenge: bool,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// `unpack200` binary; looked up on `PATH` when unset.
    #[serde(default)]
    pub unpack200: Option<PathBuf>,
    /// Administrator-managed trust decisions, consulted after the user's.
    #[serde(default)]
    pub global_trust_file: Option<PathBuf>,
}

fn default_user_agent() -> String {
    format!("rescache/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            offline: false,
            allow_redirects: false,
            skip_auth_challenge: false,
            security_level: SecurityLevel::default(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            unpack200: None,
            global_trust_file: None,
        }
    }
}

impl Settings {
    /// `~/.rescache`.
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".rescache"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from the default path; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            offline: self.offline,
            allow_redirects: self.allow_redirects,
            skip_auth_challenge: self.skip_auth_challenge,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            use_system_proxy: true,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(CacheStore::default_root)
    }

    /// The user's remembered trust decisions.
    pub fn user_trust_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("trust.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "offline": true, "read_timeout_secs": 5 }"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(settings.offline);
        assert_eq!(settings.read_timeout_secs, 5);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.security_level, SecurityLevel::AskUntrusted);
        assert_eq!(settings.transport_config().read_timeout, Duration::from_secs(5));
        assert!(settings.fetch_policy().offline);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = Settings {
            allow_redirects: true,
            cache_dir: Some(dir.path().join("cache")),
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_garbage_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
