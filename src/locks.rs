// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A fetch worker that panics while holding a resource monitor must not take
//! every progress observer down with it. These helpers log the poisoning and
//! recover the guard; the resource state they protect is always left in a
//! readable (if possibly stale) shape by the worker.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use rescache::locks::resilient_lock;
//!
//! let lock = Mutex::new(42);
//! *resilient_lock(&lock) = 100;
//! assert_eq!(*resilient_lock(&lock), 100);
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "rescache::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned during acquisition; recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Wait on a condition variable for at most `timeout`, recovering from
/// poisoning the same way [`resilient_lock`] does.
///
/// Returns the re-acquired guard and whether the wait timed out.
pub fn resilient_wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, result)) => (guard, result.timed_out()),
        Err(poisoned) => {
            tracing::error!(
                target: "rescache::locks",
                event = "LOCK_POISONED_CONDVAR",
                "Mutex was poisoned while waiting on a condition; recovering."
            );
            let (guard, result) = poisoned.into_inner();
            (guard, result.timed_out())
        }
    }
}
