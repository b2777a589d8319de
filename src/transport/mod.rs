// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport seam.
//!
//! The resolver and transfer pipeline only see [`Transport`]: a header probe
//! and a streaming GET. Redirects are never followed here and bodies are never
//! decoded here; both are decisions of the layers above.

mod http;
#[cfg(test)]
pub(crate) mod mock;
mod raw;

pub use http::ReqwestTransport;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures_util::stream::BoxStream;
use thiserror::Error;
use url::Url;

/// Encodings the client can undo itself, offered on every request.
pub const ACCEPT_ENCODING: &str = "pack200-gzip, gzip";

/// Network authentication required; asks the user before retrying.
pub const NETWORK_AUTHENTICATION_REQUIRED: u16 = 511;

/// Response header carrying the version actually served.
pub const VERSION_ID_HEADER: &str = "x-java-jnlp-version-id";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported URL scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("invalid redirect target `{target}`: {reason}")]
    InvalidRedirect { target: String, reason: String },

    #[error("timed out talking to {url}")]
    Timeout { url: String },
}

/// Probe methods, in the order the resolver tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Head,
    Get,
}

impl HttpMethod {
    pub const PROBE_ORDER: [HttpMethod; 2] = [HttpMethod::Head, HttpMethod::Get];

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Head => "HEAD",
            HttpMethod::Get => "GET",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status line and the headers the fetch engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    /// Raw `Location` header.
    pub location: Option<String>,
    pub content_length: Option<u64>,
    /// `Last-Modified`, epoch milliseconds.
    pub last_modified: Option<i64>,
    /// `Content-Encoding`, lower-cased.
    pub content_encoding: Option<String>,
    pub version_id: Option<String>,
}

impl ResponseMeta {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Build from header name/value pairs. Unknown headers are ignored and
    /// unparseable values are treated as absent.
    pub fn from_headers<'a, I>(status: u16, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut meta = Self::new(status);
        for (name, value) in headers {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "location" if !value.is_empty() => meta.location = Some(value.to_string()),
                "content-length" => meta.content_length = value.parse().ok(),
                "last-modified" => meta.last_modified = parse_http_date(value),
                "content-encoding" if !value.is_empty() => {
                    meta.content_encoding = Some(value.to_ascii_lowercase())
                }
                VERSION_ID_HEADER if !value.is_empty() => meta.version_id = Some(value.to_string()),
                _ => {}
            }
        }
        meta
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// HTTP dates (`Wed, 21 Oct 2015 07:28:00 GMT`) to epoch milliseconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// An open response: metadata plus the raw body stream.
pub struct Connection {
    pub url: Url,
    pub meta: ResponseMeta,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `method` to `url` with [`ACCEPT_ENCODING`] and return the
    /// response metadata. The body, if any, is discarded.
    async fn probe(&self, url: &Url, method: HttpMethod) -> Result<ResponseMeta, TransportError>;

    /// Send a GET to `url` with [`ACCEPT_ENCODING`] and stream the raw body.
    async fn open(&self, url: &Url) -> Result<Connection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_from_headers() {
        let meta = ResponseMeta::from_headers(
            200,
            [
                ("Content-Length", " 1234 "),
                ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
                ("Content-Encoding", "Pack200-GZIP"),
                ("X-Java-JNLP-Version-Id", "1.2"),
                ("X-Other", "ignored"),
            ],
        );
        assert_eq!(meta.content_length, Some(1234));
        assert_eq!(meta.last_modified, Some(1_445_412_480_000));
        assert_eq!(meta.content_encoding.as_deref(), Some("pack200-gzip"));
        assert_eq!(meta.version_id.as_deref(), Some("1.2"));
        assert!(meta.is_success());
    }

    #[test]
    fn test_bad_values_are_absent() {
        let meta = ResponseMeta::from_headers(
            302,
            [("content-length", "lots"), ("last-modified", "yesterday")],
        );
        assert_eq!(meta.content_length, None);
        assert_eq!(meta.last_modified, None);
        assert!(meta.is_redirect());
        assert!(!meta.is_success());
    }

    #[test]
    fn test_redirect_codes() {
        for code in [301, 302, 303, 307, 308] {
            assert!(ResponseMeta::new(code).is_redirect());
        }
        for code in [300, 304, 305, 200, 404] {
            assert!(!ResponseMeta::new(code).is_redirect());
        }
    }
}
