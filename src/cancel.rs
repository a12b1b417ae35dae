//! Cancellation primitive (component C7).
//!
//! `cancel` must be idempotent, atomic with respect to a pending
//! blocking I/O on the same endpoint, and cause that I/O to terminate
//! with [`crate::error::IiodError::Cancelled`]. Once fired, the token
//! stays latched: subsequent operations on the same endpoint fail fast
//! until the device is closed and reopened (spec 4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A cancellation latch shared between the thread that calls `cancel`
/// and whichever thread is blocked doing I/O on the associated
/// endpoint.
///
/// The socket transport registers a [`mio::Waker`] here so that firing
/// the token wakes a thread blocked in `mio::Poll::poll`, matching the
/// `(fd, cancel_event)` multiplexed wait described in spec 4.7. The USB
/// transport doesn't need the waker (it aborts the in-flight `libusb`
/// transfer directly) but shares the same latch semantics.
pub struct CancelToken {
    cancelled: AtomicBool,
    // One entry per poller that wants to be woken on cancellation. The
    // reader and writer threads each register their own waker, since
    // they each own an independent `mio::Poll` over their half of the
    // socket (see `crate::net::transport`).
    wakers: Mutex<Vec<mio::Waker>>,
}

impl CancelToken {
    /// Creates a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        CancelToken {
            cancelled: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a waker a blocking poll loop should be woken with.
    /// Multiple wakers may be registered (one per poller).
    pub fn register_waker(&self, waker: mio::Waker) {
        self.wakers.lock().unwrap().push(waker);
    }

    /// Fires the token. Idempotent: calling this more than once, or
    /// concurrently with an in-flight cancellation, has the same
    /// observable effect as calling it exactly once.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for waker in self.wakers.lock().unwrap().iter() {
            // Best-effort: if the poller has already exited there's
            // nothing to wake, and that's fine.
            let _ = waker.wake();
        }
    }

    /// Whether the token has ever been fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
