// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Last-resort HTTP/1.0 reader for servers whose responses the regular
//! client rejects.
//!
//! Sends one request with `Connection: close`, reads until EOF and splits the
//! bytes at the first blank line. Header lines that do not parse are skipped.
//! No chunked decoding and no keep-alive.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use super::{HttpMethod, ResponseMeta, TransportError, ACCEPT_ENCODING};
use crate::config::TransportConfig;

/// Status assumed when the status line is unreadable.
const DEFAULT_STATUS: u16 = 200;

pub(super) async fn request(
    url: &Url,
    method: HttpMethod,
    config: &TransportConfig,
) -> Result<(ResponseMeta, Bytes), TransportError> {
    if url.scheme() != "http" {
        return Err(TransportError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    let host = url.host_str().ok_or_else(|| TransportError::MalformedResponse {
        url: url.to_string(),
        reason: "URL has no host".into(),
    })?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout { url: url.to_string() })??;

    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let head = format!(
        "{method} {target} HTTP/1.0\r\nHost: {host_header}\r\nUser-Agent: {}\r\n\
         Accept-Encoding: {ACCEPT_ENCODING}\r\nConnection: close\r\n\r\n",
        config.user_agent
    );
    stream.write_all(head.as_bytes()).await?;

    let mut raw = Vec::new();
    tokio::time::timeout(config.read_timeout, stream.read_to_end(&mut raw))
        .await
        .map_err(|_| TransportError::Timeout { url: url.to_string() })??;

    let (meta, body) = parse_response(&raw);
    tracing::debug!(url = %url, status = meta.status, bytes = body.len(), "raw socket response");
    Ok((meta, Bytes::copy_from_slice(body)))
}

/// Split a raw response into metadata and body.
pub(super) fn parse_response(raw: &[u8]) -> (ResponseMeta, &[u8]) {
    let (head, body) = split_head(raw);
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();

    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(DEFAULT_STATUS);

    let headers: Vec<(&str, &str)> = lines.filter_map(|line| line.split_once(':')).collect();
    let meta = ResponseMeta::from_headers(status, headers);

    let body = match meta.content_length {
        Some(len) if (len as usize) < body.len() => &body[..len as usize],
        _ => body,
    };
    (meta, body)
}

fn split_head(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(at) = find(raw, b"\r\n\r\n") {
        return (&raw[..at], &raw[at + 4..]);
    }
    if let Some(at) = find(raw, b"\n\n") {
        return (&raw[..at], &raw[at + 2..]);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_broken_header_lines() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nthis line has no colon\r\n\
            Last-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\n\r\nhello trailing";
        let (meta, body) = parse_response(raw);
        assert_eq!(meta.status, 200);
        assert_eq!(meta.content_length, Some(5));
        assert!(meta.last_modified.is_some());
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_parse_bare_newlines_and_bad_status() {
        let raw = b"garbage\nContent-Encoding: gzip\n\n\x1f\x8b";
        let (meta, body) = parse_response(raw);
        assert_eq!(meta.status, DEFAULT_STATUS);
        assert_eq!(meta.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(body, b"\x1f\x8b");
    }

    #[test]
    fn test_parse_without_blank_line_has_empty_body() {
        let (meta, body) = parse_response(b"HTTP/1.0 404 Not Found\r\n");
        assert_eq!(meta.status, 404);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_https() {
        let url = Url::parse("https://example.com/a.jar").unwrap();
        let result = request(&url, HttpMethod::Get, &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::UnsupportedScheme { .. })));
    }
}
