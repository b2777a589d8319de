// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `reqwest`-backed transport.

use std::error::Error as StdError;
use std::io;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT_ENCODING as ACCEPT_ENCODING_HEADER};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use url::Url;

use super::{raw, Connection, HttpMethod, ResponseMeta, Transport, TransportError, ACCEPT_ENCODING};
use crate::config::TransportConfig;

/// HTTP(S) transport over a shared `reqwest` client. Redirects are returned
/// to the caller and bodies are passed through undecoded.
///
/// Servers whose responses hyper refuses to parse are retried once through a
/// raw HTTP/1.0 socket read (plain `http` only).
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    async fn send(
        &self,
        url: &Url,
        method: HttpMethod,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = match method {
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Get => Method::GET,
        };
        self.client
            .request(method, url.clone())
            .header(ACCEPT_ENCODING_HEADER, ACCEPT_ENCODING)
            .send()
            .await
    }

    fn should_fall_back(url: &Url, error: &reqwest::Error) -> bool {
        url.scheme() == "http" && is_malformed(error)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn probe(&self, url: &Url, method: HttpMethod) -> Result<ResponseMeta, TransportError> {
        match self.send(url, method).await {
            Ok(response) => Ok(meta_of(response.status().as_u16(), response.headers())),
            Err(e) if Self::should_fall_back(url, &e) => {
                tracing::debug!(
                    url = %url,
                    error = %e,
                    "malformed response; retrying probe over raw socket"
                );
                let (meta, _) = raw::request(url, method, &self.config).await?;
                Ok(meta)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, url: &Url) -> Result<Connection, TransportError> {
        match self.send(url, HttpMethod::Get).await {
            Ok(response) => {
                let meta = meta_of(response.status().as_u16(), response.headers());
                let body = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(io::Error::other))
                    .boxed();
                Ok(Connection {
                    url: url.clone(),
                    meta,
                    body,
                })
            }
            Err(e) if Self::should_fall_back(url, &e) => {
                tracing::warn!(
                    url = %url,
                    error = %e,
                    "malformed response; reading body over raw socket"
                );
                let (meta, body) = raw::request(url, HttpMethod::Get, &self.config).await?;
                Ok(Connection {
                    url: url.clone(),
                    meta,
                    body: futures_util::stream::once(async move { Ok(body) }).boxed(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn meta_of(status: u16, headers: &HeaderMap) -> ResponseMeta {
    ResponseMeta::from_headers(
        status,
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
    )
}

/// Whether hyper rejected the response itself (bad status line or headers),
/// as opposed to a connection or timeout failure.
fn is_malformed(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(err) = source {
        if let Some(hyper_error) = err.downcast_ref::<hyper::Error>() {
            return hyper_error.is_parse() || hyper_error.is_parse_status();
        }
        source = err.source();
    }
    false
}
