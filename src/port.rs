//! The abstract duplex byte-stream carrier (component C1).
//!
//! Transports (TCP, USB) implement [`Port`]; the responder and codec
//! never see a socket or a USB handle directly.

use crate::error::Result;

/// A duplex byte-stream carrier with an explicit discard primitive.
///
/// `discard` exists because the reader loop sometimes needs to drop a
/// run of bytes it has no buffer for (an orphaned RESPONSE payload, or
/// the overflow past a caller's declared buffer size) without copying
/// them anywhere.
pub trait Port: Send {
    /// Reads up to `buf.len()` bytes, returning the number read. A
    /// return of `0` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes as many of `buf`'s bytes as the transport will accept in
    /// one call, returning the number written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Discards exactly `len` bytes from the read side of the stream.
    fn discard(&mut self, len: usize) -> Result<()> {
        let mut remaining = len;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(scratch.len());
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(crate::error::IiodError::EndOfStream);
            }
            remaining -= n;
        }
        Ok(())
    }

    /// Produces an independent handle onto the same underlying duplex
    /// stream, so the responder's reader and writer threads can each
    /// own a half without contending on a shared lock. For a socket
    /// this is a `try_clone`-style fd duplication; for a USB couple it
    /// is a cheap handle clone, since the IN and OUT endpoints are
    /// already addressed independently.
    fn try_clone(&self) -> Result<Box<dyn Port>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// An in-memory duplex pipe pair, used to drive the responder in
    /// tests without a live iiod server.
    ///
    /// `LoopbackPort::pair()` returns two ends; bytes written to one
    /// end are readable from the other.
    pub struct LoopbackPort {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl LoopbackPort {
        pub fn pair() -> (LoopbackPort, LoopbackPort) {
            let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
            let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
            let closed = Arc::new(Mutex::new(false));
            (
                LoopbackPort {
                    inbound: b_to_a.clone(),
                    outbound: a_to_b.clone(),
                    closed: closed.clone(),
                },
                LoopbackPort {
                    inbound: a_to_b,
                    outbound: b_to_a,
                    closed,
                },
            )
        }

        pub fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    impl Port for LoopbackPort {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            loop {
                {
                    let mut q = self.inbound.lock().unwrap();
                    if !q.is_empty() {
                        let n = buf.len().min(q.len());
                        for slot in buf.iter_mut().take(n) {
                            *slot = q.pop_front().unwrap();
                        }
                        return Ok(n);
                    }
                }
                if *self.closed.lock().unwrap() {
                    return Ok(0);
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let mut q = self.outbound.lock().unwrap();
            q.extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn try_clone(&self) -> Result<Box<dyn Port>> {
            Ok(Box::new(LoopbackPort {
                inbound: self.inbound.clone(),
                outbound: self.outbound.clone(),
                closed: self.closed.clone(),
            }))
        }
    }
}
