// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted in-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use url::Url;

use super::{Connection, HttpMethod, ResponseMeta, Transport, TransportError};
use crate::locks::resilient_lock;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Probe(HttpMethod, String),
    Open(String),
}

type ProbeScript = VecDeque<Result<ResponseMeta, String>>;

/// Probes answer from per-(method, url) queues; the last scripted answer
/// repeats once a queue runs dry, and unscripted URLs answer 404. Bodies are
/// served in small chunks so progress accounting gets exercised.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    probes: Mutex<HashMap<(HttpMethod, String), ProbeScript>>,
    bodies: Mutex<HashMap<String, (ResponseMeta, Vec<u8>)>>,
    calls: Mutex<Vec<Call>>,
}

pub const CHUNK: usize = 4;

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_reply(&self, method: HttpMethod, url: &str, meta: ResponseMeta) -> &Self {
        self.push(method, url, Ok(meta))
    }

    pub fn probe_error(&self, method: HttpMethod, url: &str, message: &str) -> &Self {
        self.push(method, url, Err(message.to_string()))
    }

    /// Answer both probe methods with `meta`.
    pub fn probe_both(&self, url: &str, meta: ResponseMeta) -> &Self {
        self.probe_reply(HttpMethod::Head, url, meta.clone());
        self.probe_reply(HttpMethod::Get, url, meta)
    }

    pub fn body(&self, url: &str, meta: ResponseMeta, body: impl Into<Vec<u8>>) -> &Self {
        resilient_lock(&self.bodies).insert(url.to_string(), (meta, body.into()));
        self
    }

    fn push(&self, method: HttpMethod, url: &str, reply: Result<ResponseMeta, String>) -> &Self {
        resilient_lock(&self.probes)
            .entry((method, url.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        resilient_lock(&self.calls).clone()
    }

    pub fn opens(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Open(_))).count()
    }

    pub fn is_untouched(&self) -> bool {
        resilient_lock(&self.calls).is_empty()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, url: &Url, method: HttpMethod) -> Result<ResponseMeta, TransportError> {
        resilient_lock(&self.calls).push(Call::Probe(method, url.to_string()));
        let reply = {
            let mut probes = resilient_lock(&self.probes);
            match probes.get_mut(&(method, url.to_string())) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Ok(meta)) => Ok(meta),
            Some(Err(message)) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                message,
            ))),
            None => Ok(ResponseMeta::new(404)),
        }
    }

    async fn open(&self, url: &Url) -> Result<Connection, TransportError> {
        resilient_lock(&self.calls).push(Call::Open(url.to_string()));
        let (meta, body) = resilient_lock(&self.bodies)
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| {
                TransportError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no body scripted for {url}"),
                ))
            })?;
        let chunks: Vec<io::Result<Bytes>> = body
            .chunks(CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Connection {
            url: url.clone(),
            meta,
            body: futures_util::stream::iter(chunks).boxed(),
        })
    }
}
