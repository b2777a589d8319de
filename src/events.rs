// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress and status events broadcast to observers.
//!
//! Observers never influence a fetch: a lagging or absent subscriber only
//! loses events.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use url::Url;

use crate::resource::Status;

/// Default capacity of the tracker's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Minimum spacing between progress events of one transfer.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    StatusChanged {
        location: Url,
        old: Status,
        new: Status,
    },
    Progress {
        location: Url,
        transferred: u64,
        /// Remote length when known.
        total: Option<u64>,
    },
}

impl FetchEvent {
    pub fn location(&self) -> &Url {
        match self {
            FetchEvent::StatusChanged { location, .. } | FetchEvent::Progress { location, .. } => {
                location
            }
        }
    }
}

pub fn channel() -> (broadcast::Sender<FetchEvent>, broadcast::Receiver<FetchEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Rate limiter for progress events.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    last: Option<Instant>,
    interval: Duration,
}

impl ProgressThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            last: None,
            interval,
        }
    }

    /// True when enough time has passed since the last emitted event.
    pub(crate) fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
