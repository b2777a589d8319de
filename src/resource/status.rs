// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource status flags and the guarded transitions between them.
//!
//! Connect and download are independent sub-lifecycles, so status is a flag
//! set rather than a single enum. A [`Transition`] only applies when the
//! current set holds every required flag and none of the forbidden ones;
//! otherwise it is a no-op, which makes replayed requests from a retried
//! worker harmless.

use std::fmt;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Status: u8 {
        /// Connect phase has not started.
        const PRECONNECT = 1 << 0;
        const CONNECTING = 1 << 1;
        const CONNECTED = 1 << 2;
        /// Download phase has not started.
        const PREDOWNLOAD = 1 << 3;
        const DOWNLOADING = 1 << 4;
        const DOWNLOADED = 1 << 5;
        const ERROR = 1 << 6;
    }
}

impl Status {
    /// Freshly created resource.
    pub const INITIAL: Status = Status::PRECONNECT;

    /// `DOWNLOADED` or `ERROR`: no further transitions will wake a waiter.
    pub fn is_terminal(self) -> bool {
        self.intersects(Status::DOWNLOADED | Status::ERROR)
    }

    /// Connect phase finished, successfully or not.
    pub fn is_connected(self) -> bool {
        self.intersects(Status::CONNECTED | Status::ERROR)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::INITIAL
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// A conditional edit of a status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub required: Status,
    pub forbidden: Status,
    pub remove: Status,
    pub add: Status,
}

impl Transition {
    pub const fn new(required: Status, forbidden: Status, remove: Status, add: Status) -> Self {
        Self {
            required,
            forbidden,
            remove,
            add,
        }
    }

    /// New status set, or `None` when the guard rejects the transition.
    pub fn apply(&self, current: Status) -> Option<Status> {
        if !current.contains(self.required) || current.intersects(self.forbidden) {
            return None;
        }
        Some(current.difference(self.remove).union(self.add))
    }

    pub const BEGIN_CONNECT: Transition = Transition::new(
        Status::PRECONNECT,
        Status::ERROR.union(Status::CONNECTING).union(Status::CONNECTED),
        Status::empty(),
        Status::CONNECTING,
    );

    pub const CONNECT_SUCCEEDED: Transition = Transition::new(
        Status::CONNECTING,
        Status::empty(),
        Status::PRECONNECT.union(Status::CONNECTING),
        Status::CONNECTED.union(Status::PREDOWNLOAD),
    );

    /// Cached copy is current; the download phase has nothing to do.
    pub const UP_TO_DATE: Transition = Transition::new(
        Status::PREDOWNLOAD,
        Status::empty(),
        Status::PREDOWNLOAD.union(Status::DOWNLOADING),
        Status::DOWNLOADED,
    );

    /// Served from the local cache without resolving.
    pub const OFFLINE_HIT: Transition = Transition::new(
        Status::CONNECTING,
        Status::empty(),
        Status::PRECONNECT
            .union(Status::CONNECTING)
            .union(Status::PREDOWNLOAD)
            .union(Status::DOWNLOADING),
        Status::CONNECTED.union(Status::DOWNLOADED),
    );

    pub const BEGIN_DOWNLOAD: Transition = Transition::new(
        Status::PREDOWNLOAD,
        Status::ERROR.union(Status::DOWNLOADING).union(Status::DOWNLOADED),
        Status::empty(),
        Status::DOWNLOADING,
    );

    pub const DOWNLOAD_COMPLETE: Transition = Transition::new(
        Status::DOWNLOADING,
        Status::empty(),
        Status::PREDOWNLOAD.union(Status::DOWNLOADING),
        Status::DOWNLOADED,
    );

    pub const FAILED: Transition = Transition::new(
        Status::empty(),
        Status::ERROR,
        Status::CONNECTING.union(Status::DOWNLOADING),
        Status::ERROR,
    );
}
