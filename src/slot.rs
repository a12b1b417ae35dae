//! Request slot (component C4): per-operation state carrying the
//! client id, buffers, completion flags, and cleanup callbacks.
//!
//! Ownership of the slot is always via `Arc<RequestSlot>`, replacing
//! the spec's intrusive `r_next`/`w_next` pointers with a queue of
//! reference-counted handles (the modernization the spec's design notes
//! call for). `r_done`/`w_done` and the pending I/O records live behind
//! the slot's own mutex, which plays the role of the per-direction
//! section of the responder's `rlock`/`wlock` for *this* slot; the
//! responder's queues use a separate, coarser lock to track membership
//! (see [`crate::responder::Responder`]).

use std::sync::{Arc, Condvar, Mutex};

use crate::codec::CommandHeader;
use crate::error::{IiodError, Result};

/// A cleanup callback, fired exactly once per direction per enqueue
/// cycle, after that direction's `done` flag has been set.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// The ordered send buffers for one write cycle (spec §3's vectored
/// `(pointer, size)` descriptor list, realized as owned, borrow-free
/// segments so the frame can be assembled on whichever thread dequeues
/// it). Capped and non-empty per [`crate::codec::validate_buffer_count`].
pub(crate) struct PendingSend {
    pub header: CommandHeader,
    pub buffers: Vec<Vec<u8>>,
}

/// The ordered capacities of the read side's buffer vector for one read
/// cycle. The reader loop fills one owned `Vec<u8>` per entry, capping
/// the final buffer so oversized trailing capacity is left untouched
/// (spec 4.1).
pub(crate) struct PendingRecv {
    pub buffer_sizes: Vec<usize>,
}

#[derive(Default)]
struct SlotInner {
    r_done: bool,
    w_done: bool,
    cancelled: bool,
    pending_send: Option<PendingSend>,
    pending_recv: Option<PendingRecv>,
    write_result: Option<Result<i32>>,
    read_result: Option<Result<(i32, Vec<Vec<u8>>)>>,
    write_cleanup: Option<Cleanup>,
    read_cleanup: Option<Cleanup>,
}

/// Per-operation state: the client id, the two I/O records (send/recv),
/// completion flags, and the one-shot wake primitive a blocking caller
/// waits on.
pub struct RequestSlot {
    /// Correlates this slot's outstanding command(s) to their response(s).
    pub client_id: u16,
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl RequestSlot {
    /// Allocates a fresh, idle slot for the given client id.
    pub fn new(client_id: u16) -> Arc<Self> {
        Arc::new(RequestSlot {
            client_id,
            inner: Mutex::new(SlotInner::default()),
            cond: Condvar::new(),
        })
    }

    /// Sets up the write-side record (`send_command_async`, spec 4.4).
    /// Starting a new cycle clears any earlier cancellation, matching
    /// `arm_recv`.
    pub(crate) fn arm_send(&self, header: CommandHeader, buffers: Vec<Vec<u8>>, cleanup: Option<Cleanup>) {
        let mut g = self.inner.lock().unwrap();
        g.w_done = false;
        g.cancelled = false;
        g.write_result = None;
        g.pending_send = Some(PendingSend { header, buffers });
        g.write_cleanup = cleanup;
    }

    /// Sets up the read-side record (`get_response_async`, spec 4.4).
    pub(crate) fn arm_recv(&self, buffer_sizes: Vec<usize>, cleanup: Option<Cleanup>) {
        let mut g = self.inner.lock().unwrap();
        g.r_done = false;
        g.cancelled = false;
        g.read_result = None;
        g.pending_recv = Some(PendingRecv { buffer_sizes });
        g.read_cleanup = cleanup;
    }

    /// Consumed once by the writer loop when it dequeues this slot.
    pub(crate) fn take_pending_send(&self) -> Option<PendingSend> {
        self.inner.lock().unwrap().pending_send.take()
    }

    /// Consumed once by the reader loop when it matches an inbound
    /// RESPONSE to this slot.
    pub(crate) fn take_pending_recv(&self) -> Option<PendingRecv> {
        self.inner.lock().unwrap().pending_recv.take()
    }

    /// Called by the writer loop once the frame has been sent (or the
    /// send has failed). Fires the write cleanup, if any, after
    /// `w_done` is set.
    pub(crate) fn complete_write(&self, result: Result<i32>) {
        let cleanup = {
            let mut g = self.inner.lock().unwrap();
            g.write_result = Some(result);
            g.w_done = true;
            g.write_cleanup.take()
        };
        self.cond.notify_all();
        if let Some(cb) = cleanup {
            cb();
        }
    }

    /// Called by the reader loop once a matching RESPONSE has been
    /// fully processed (payload copied in, or an error determined).
    pub(crate) fn complete_read(&self, result: Result<(i32, Vec<Vec<u8>>)>) {
        let cleanup = {
            let mut g = self.inner.lock().unwrap();
            g.read_result = Some(result);
            g.r_done = true;
            g.read_cleanup.take()
        };
        self.cond.notify_all();
        if let Some(cb) = cleanup {
            cb();
        }
    }

    /// Marks this slot cancelled and wakes any thread blocked in
    /// [`RequestSlot::wait_for_write`]/[`RequestSlot::wait_for_read`].
    /// Idempotent. Called by [`crate::responder::Responder::cancel_slot`]
    /// after the slot has been unlinked from both queues (spec 4.4, 4.7,
    /// 5): a waiter that wakes because of this sees no `done` flag set
    /// and returns [`IiodError::Cancelled`] instead of blocking forever.
    pub(crate) fn cancel(&self) {
        self.inner.lock().unwrap().cancelled = true;
        self.cond.notify_all();
    }

    /// Blocks until `w_done` is set, then returns the write result. A
    /// slot cancelled before the writer touches it (or while this call
    /// is blocked) wakes with [`IiodError::Cancelled`] rather than
    /// hanging; a write that completes before or concurrently with
    /// cancellation still reports its real result.
    pub fn wait_for_write(&self) -> Result<i32> {
        let mut g = self.inner.lock().unwrap();
        while !g.w_done && !g.cancelled {
            g = self.cond.wait(g).unwrap();
        }
        if g.w_done {
            g.write_result.take().unwrap_or(Err(IiodError::Cancelled))
        } else {
            Err(IiodError::Cancelled)
        }
    }

    /// Blocks until `r_done` is set, then returns the read result. Same
    /// cancellation behavior as [`RequestSlot::wait_for_write`].
    pub fn wait_for_read(&self) -> Result<(i32, Vec<Vec<u8>>)> {
        let mut g = self.inner.lock().unwrap();
        while !g.r_done && !g.cancelled {
            g = self.cond.wait(g).unwrap();
        }
        if g.r_done {
            g.read_result.take().unwrap_or(Err(IiodError::Cancelled))
        } else {
            Err(IiodError::Cancelled)
        }
    }

    /// Whether the read side has completed its current cycle.
    pub fn r_done(&self) -> bool {
        self.inner.lock().unwrap().r_done
    }

    /// Whether the write side has completed its current cycle.
    pub fn w_done(&self) -> bool {
        self.inner.lock().unwrap().w_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Opcode;
    use std::time::Duration;

    #[test]
    fn write_then_wait_returns_result() {
        let slot = RequestSlot::new(3);
        slot.arm_send(
            CommandHeader::command(3, Opcode::ReadAttr, 0, 5),
            vec![vec![1, 2, 3]],
            None,
        );
        assert!(!slot.w_done());
        slot.complete_write(Ok(3));
        assert!(slot.w_done());
        assert_eq!(slot.wait_for_write().unwrap(), 3);
    }

    #[test]
    fn cleanup_fires_exactly_once_after_done() {
        let slot = RequestSlot::new(1);
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        slot.arm_recv(
            vec![8],
            Some(Box::new(move || {
                *fired2.lock().unwrap() += 1;
            })),
        );
        slot.complete_read(Ok((8, vec![vec![0; 8]])));
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn cancel_wakes_a_blocked_reader_with_no_completion() {
        let slot = RequestSlot::new(9);
        slot.arm_recv(vec![4], None);

        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.wait_for_read())
        };

        std::thread::sleep(Duration::from_millis(20));
        slot.cancel();

        assert!(matches!(waiter.join().unwrap(), Err(IiodError::Cancelled)));
    }

    #[test]
    fn cancel_wakes_a_blocked_writer_with_no_completion() {
        let slot = RequestSlot::new(2);
        slot.arm_send(CommandHeader::command(2, Opcode::Close, 0, 0), vec![], None);

        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.wait_for_write())
        };

        std::thread::sleep(Duration::from_millis(20));
        slot.cancel();

        assert!(matches!(waiter.join().unwrap(), Err(IiodError::Cancelled)));
    }

    #[test]
    fn cancel_after_completion_does_not_override_the_real_result() {
        let slot = RequestSlot::new(5);
        slot.arm_recv(vec![4], None);
        slot.complete_read(Ok((4, vec![vec![1, 2, 3, 4]])));
        slot.cancel();

        let (code, bufs) = slot.wait_for_read().unwrap();
        assert_eq!(code, 4);
        assert_eq!(bufs, vec![vec![1, 2, 3, 4]]);
    }
}
