//! Cooperative shutdown coordination between a server, its accept loop, and
//! the connections it creates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::warn;

#[derive(Debug, Default)]
struct Inner {
    signaled: AtomicBool,
    pending: Mutex<usize>,
    drained: Condvar,
}

/// Shared shutdown signal plus an outstanding-work counter.
///
/// Cloning is cheap and every clone observes the same state. The signal is
/// latched: once [signal](Self::signal) has been called,
/// [is_signaled](Self::is_signaled) returns `true` forever.
///
/// Only work registered by the crate itself delays
/// [await_drain](Self::await_drain). A [crate::Server] tracks its accept loop
/// and nothing else, so connection threads are never waited on. Holders of a
/// coordinator can observe the outstanding work but cannot release it:
///
/// ```compile_fail
/// let coordinator = tcp_server::ShutdownCoordinator::new();
/// coordinator.untrack();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    /// Creates a coordinator that has not been signaled and tracks no work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches the shutdown signal.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// coordinator was already signaled. Safe to call any number of times.
    pub fn signal(&self) -> bool {
        self.inner
            .signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` once shutdown has been signaled.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    /// Registers one unit of outstanding work. The returned guard releases it
    /// when dropped.
    pub(crate) fn track(&self) -> WorkGuard {
        *self.lock_pending() += 1;

        WorkGuard {
            coordinator: self.clone(),
        }
    }

    // Only `WorkGuard` releases work, once per `track`. Releasing with nothing
    // outstanding is ignored.
    fn untrack(&self) {
        let mut pending = self.lock_pending();

        match *pending {
            0 => {
                warn!("untrack called with no outstanding work -- ignoring");
            }
            1 => {
                *pending = 0;
                self.inner.drained.notify_all();
            }
            _ => *pending -= 1,
        }
    }

    /// Returns the amount of outstanding tracked work.
    pub fn pending(&self) -> usize {
        *self.lock_pending()
    }

    /// Blocks the calling thread until no tracked work remains.
    pub fn await_drain(&self) {
        let mut pending = self.lock_pending();

        while *pending > 0 {
            pending = self
                .inner
                .drained
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks the calling thread until no tracked work remains or `timeout`
    /// elapses.
    ///
    /// Returns `true` if all tracked work was released in time. A timeout too
    /// large to express as a deadline waits without limit.
    pub fn await_drain_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.await_drain();
            return true;
        };
        let mut pending = self.lock_pending();

        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            pending = self
                .inner
                .drained
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }

    // The counter is a plain integer, so a poisoned lock still holds a
    // consistent value.
    fn lock_pending(&self) -> MutexGuard<'_, usize> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outstanding work registered through [ShutdownCoordinator::track].
///
/// Dropping the guard (including during a panic unwind) untracks the work.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the tracked work"]
pub(crate) struct WorkGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.coordinator.untrack();
    }
}
