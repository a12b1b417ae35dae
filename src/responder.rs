//! Responder core (component C5): the reader and writer threads, their
//! queues, and the async/blocking request primitives built on top of
//! them (spec 4.2–4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::codec::{self, validate_buffer_count, CommandHeader, Opcode};
use crate::error::{IiodError, Result};
use crate::port::Port;
use crate::registry::ClientIdRegistry;
use crate::slot::{Cleanup, RequestSlot};

/// A sink for payload bytes belonging to an inbound non-RESPONSE
/// command, handed to [`InboundCommandHandler::handle`].
pub trait CommandDataReader {
    /// Reads up to `buf.len()` command-payload bytes.
    fn command_data_read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Discards `len` command-payload bytes without copying them.
    fn discard(&mut self, len: usize) -> Result<()>;
}

struct PortCommandReader<'a>(&'a mut dyn Port);

impl CommandDataReader for PortCommandReader<'_> {
    fn command_data_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf)
    }

    fn discard(&mut self, len: usize) -> Result<()> {
        self.0.discard(len)
    }
}

/// Handles inbound frames whose opcode is not `RESPONSE` (spec 4.2 step
/// 2). The iiod client never initiates such frames itself, but the
/// reader loop is a collaborator seam so that a caller who needs to
/// react to server-pushed notifications can plug in their own handler.
pub trait InboundCommandHandler: Send + Sync {
    /// Handles one inbound command header, consuming its payload (if
    /// any) via `reader` before returning.
    fn handle(&self, header: CommandHeader, reader: &mut dyn CommandDataReader) -> Result<()>;
}

/// The default handler: every inbound non-RESPONSE command is treated
/// as a protocol violation, after draining its declared payload so the
/// stream stays framed.
pub struct RejectInboundCommands;

impl InboundCommandHandler for RejectInboundCommands {
    fn handle(&self, header: CommandHeader, reader: &mut dyn CommandDataReader) -> Result<()> {
        if header.code > 0 {
            let _ = reader.discard(header.code as usize);
        }
        Err(IiodError::ProtocolViolation(format!(
            "unexpected inbound command {:?}",
            header.op
        )))
    }
}

/// The per-link multiplexer: owns one reader and one writer thread, the
/// readers/writers queues, and the client-id registry.
pub struct Responder {
    registry: ClientIdRegistry,
    readers: Mutex<VecDeque<Arc<RequestSlot>>>,
    writers: Mutex<VecDeque<Arc<RequestSlot>>>,
    wcond: Condvar,
    stop: Arc<AtomicBool>,
    cancel: Arc<CancelToken>,
    handler: Arc<dyn InboundCommandHandler>,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Responder {
    /// Spawns a responder over `port`, which is split via
    /// [`Port::try_clone`] into an independent reader half and writer
    /// half. `cancel` is fired by [`Responder::shutdown`] so that a
    /// transport-level cancellable wait blocked in the reader thread
    /// can be woken.
    pub fn spawn(
        port: Box<dyn Port>,
        handler: Arc<dyn InboundCommandHandler>,
        cancel: Arc<CancelToken>,
    ) -> Result<Arc<Self>> {
        let reader_port = port.try_clone()?;
        let writer_port = port;

        let responder = Arc::new(Responder {
            registry: ClientIdRegistry::new(),
            readers: Mutex::new(VecDeque::new()),
            writers: Mutex::new(VecDeque::new()),
            wcond: Condvar::new(),
            stop: Arc::new(AtomicBool::new(false)),
            cancel,
            handler,
            threads: Mutex::new(None),
        });

        let reader_handle = {
            let responder = responder.clone();
            let mut port = reader_port;
            thread::Builder::new()
                .name("iiod-reader".into())
                .spawn(move || responder.reader_loop(&mut *port))
                .expect("failed to spawn iiod reader thread")
        };

        let writer_handle = {
            let responder = responder.clone();
            let mut port = writer_port;
            thread::Builder::new()
                .name("iiod-writer".into())
                .spawn(move || responder.writer_loop(&mut *port))
                .expect("failed to spawn iiod writer thread")
        };

        *responder.threads.lock().unwrap() = Some((reader_handle, writer_handle));
        Ok(responder)
    }

    /// Allocates a fresh slot with a newly-issued client id (spec 4.5).
    pub fn new_slot(&self) -> Arc<RequestSlot> {
        RequestSlot::new(self.registry.alloc())
    }

    /// Appends `slot` to the writers queue with a vectored send armed on
    /// it (spec §3's ordered, ≤32-entry buffer descriptor list), and
    /// wakes the writer thread. Returns immediately (spec 4.4). Rejects
    /// an over-cap or empty buffer vector before touching the queue.
    pub fn send_command_async_vectored(
        &self,
        slot: &Arc<RequestSlot>,
        op: Opcode,
        dev: u8,
        code: i32,
        buffers: Vec<Vec<u8>>,
        cleanup: Option<Cleanup>,
    ) -> Result<()> {
        validate_buffer_count(buffers.len(), false)?;
        slot.arm_send(CommandHeader::command(slot.client_id, op, dev, code), buffers, cleanup);
        self.writers.lock().unwrap().push_back(slot.clone());
        self.wcond.notify_all();
        Ok(())
    }

    /// Single-buffer convenience over [`Responder::send_command_async_vectored`].
    pub fn send_command_async(
        &self,
        slot: &Arc<RequestSlot>,
        op: Opcode,
        dev: u8,
        code: i32,
        payload: Vec<u8>,
        cleanup: Option<Cleanup>,
    ) {
        self.send_command_async_vectored(slot, op, dev, code, vec![payload], cleanup)
            .expect("a single-element buffer vector never violates the cap");
    }

    /// Appends `slot` to the readers queue with a vectored recv armed on
    /// it: `buffer_sizes` gives the capacity of each descriptor in
    /// order, and an inbound RESPONSE is split across them (spec §3).
    /// Returns immediately (spec 4.4). An empty vector is allowed (no
    /// payload is expected).
    pub fn get_response_async_vectored(
        &self,
        slot: &Arc<RequestSlot>,
        buffer_sizes: Vec<usize>,
        cleanup: Option<Cleanup>,
    ) -> Result<()> {
        validate_buffer_count(buffer_sizes.len(), true)?;
        slot.arm_recv(buffer_sizes, cleanup);
        self.readers.lock().unwrap().push_back(slot.clone());
        Ok(())
    }

    /// Single-buffer convenience over [`Responder::get_response_async_vectored`].
    pub fn get_response_async(&self, slot: &Arc<RequestSlot>, max_bytes: usize, cleanup: Option<Cleanup>) {
        self.get_response_async_vectored(slot, vec![max_bytes], cleanup)
            .expect("a single-element buffer vector never violates the cap");
    }

    /// `send_command_async` + wait-for-write.
    pub fn send_command(
        &self,
        slot: &Arc<RequestSlot>,
        op: Opcode,
        dev: u8,
        code: i32,
        payload: Vec<u8>,
    ) -> Result<i32> {
        self.send_command_async(slot, op, dev, code, payload, None);
        slot.wait_for_write()
    }

    /// `get_response_async_vectored` + wait-for-read.
    pub fn get_response_vectored(&self, slot: &Arc<RequestSlot>, buffer_sizes: Vec<usize>) -> Result<(i32, Vec<Vec<u8>>)> {
        self.get_response_async_vectored(slot, buffer_sizes, None)?;
        slot.wait_for_read()
    }

    /// `get_response_async` + wait-for-read.
    pub fn get_response(&self, slot: &Arc<RequestSlot>, max_bytes: usize) -> Result<(i32, Vec<u8>)> {
        let (code, mut bufs) = self.get_response_vectored(slot, vec![max_bytes])?;
        Ok((code, bufs.pop().unwrap_or_default()))
    }

    /// `get_response_async_vectored` + `send_command_async_vectored` +
    /// wait-for-read; on send failure, cancels the slot and returns the
    /// send error (spec 4.4). Both buffer vectors are validated before
    /// either queue is touched, so a rejected call never leaves the slot
    /// half-enqueued.
    #[allow(clippy::too_many_arguments)]
    pub fn exec_command_vectored(
        &self,
        slot: &Arc<RequestSlot>,
        op: Opcode,
        dev: u8,
        code: i32,
        send_buffers: Vec<Vec<u8>>,
        recv_buffer_sizes: Vec<usize>,
    ) -> Result<(i32, Vec<Vec<u8>>)> {
        validate_buffer_count(send_buffers.len(), false)?;
        validate_buffer_count(recv_buffer_sizes.len(), true)?;

        self.get_response_async_vectored(slot, recv_buffer_sizes, None)
            .expect("validated above");
        self.send_command_async_vectored(slot, op, dev, code, send_buffers, None)
            .expect("validated above");

        if let Err(e) = slot.wait_for_write() {
            self.cancel_slot(slot);
            return Err(e);
        }

        slot.wait_for_read()
    }

    /// Single-buffer convenience over [`Responder::exec_command_vectored`].
    #[allow(clippy::too_many_arguments)]
    pub fn exec_command(
        &self,
        slot: &Arc<RequestSlot>,
        op: Opcode,
        dev: u8,
        code: i32,
        payload: Vec<u8>,
        max_bytes: usize,
    ) -> Result<(i32, Vec<u8>)> {
        let (code, mut bufs) = self.exec_command_vectored(slot, op, dev, code, vec![payload], vec![max_bytes])?;
        Ok((code, bufs.pop().unwrap_or_default()))
    }

    /// Waits for the slot's current read to complete, then atomically
    /// re-queues a new vectored read request for zero-gap pipelining
    /// (spec 4.4): the readers-queue lock is held across both the
    /// re-arm and the re-enqueue, so the reader thread can never
    /// observe the slot as absent from the queue while a response for
    /// it is still outstanding on the wire.
    pub fn get_and_request_response_vectored(
        &self,
        slot: &Arc<RequestSlot>,
        next_buffer_sizes: Vec<usize>,
    ) -> Result<(i32, Vec<Vec<u8>>)> {
        validate_buffer_count(next_buffer_sizes.len(), true)?;
        let result = slot.wait_for_read();
        let mut readers = self.readers.lock().unwrap();
        slot.arm_recv(next_buffer_sizes, None);
        readers.push_back(slot.clone());
        drop(readers);
        result
    }

    /// Single-buffer convenience over [`Responder::get_and_request_response_vectored`].
    pub fn get_and_request_response(&self, slot: &Arc<RequestSlot>, next_max_bytes: usize) -> Result<(i32, Vec<u8>)> {
        let (code, mut bufs) = self.get_and_request_response_vectored(slot, vec![next_max_bytes])?;
        Ok((code, bufs.pop().unwrap_or_default()))
    }

    /// Removes `slot` from both queues under their respective locks,
    /// then marks it cancelled so a thread already blocked in
    /// [`RequestSlot::wait_for_write`]/[`RequestSlot::wait_for_read`]
    /// wakes instead of hanging forever. Idempotent. Any response I/O
    /// already in flight for this slot still completes on the wire, but
    /// its result will not be delivered (spec 4.4, 4.7, 5).
    pub fn cancel_slot(&self, slot: &Arc<RequestSlot>) {
        // Writer list first, then reader list: two distinct locks,
        // never held at once, matching the "never hold rlock and wlock
        // simultaneously" rule. A prior revision of this routine took
        // the reader lock twice by mistake; each list is now guarded by
        // its own lock.
        self.writers.lock().unwrap().retain(|s| !Arc::ptr_eq(s, slot));
        self.readers.lock().unwrap().retain(|s| !Arc::ptr_eq(s, slot));
        slot.cancel();
    }

    /// Requests that both worker threads stop, firing the shared
    /// cancellation token so a transport-level blocked read wakes up.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.wcond.notify_all();
    }

    /// Joins the reader and writer threads. Safe to call more than
    /// once; subsequent calls are no-ops.
    pub fn join(&self) {
        if let Some((reader, writer)) = self.threads.lock().unwrap().take() {
            let _ = reader.join();
            let _ = writer.join();
        }
    }

    /// Convenience combining [`Responder::shutdown`] and [`Responder::join`].
    pub fn close(&self) {
        self.shutdown();
        self.join();
    }

    fn reader_loop(&self, port: &mut dyn Port) {
        loop {
            match codec::read_header(port) {
                Ok(None) => {
                    log::debug!("iiod responder: end of stream, stopping");
                    break;
                }
                Err(e) => {
                    log::warn!("iiod responder: fatal read error: {e}");
                    break;
                }
                Ok(Some(header)) => {
                    if header.op != Opcode::Response {
                        let mut reader = PortCommandReader(port);
                        if let Err(e) = self.handler.handle(header, &mut reader) {
                            log::warn!("iiod responder: inbound command handler failed: {e}");
                        }
                        continue;
                    }

                    self.dispatch_response(port, header);
                }
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        self.wcond.notify_all();
    }

    fn dispatch_response(&self, port: &mut dyn Port, header: CommandHeader) {
        let slot = {
            let mut readers = self.readers.lock().unwrap();
            let pos = readers.iter().position(|s| s.client_id == header.client_id);
            pos.map(|i| readers.remove(i).unwrap())
        };

        let Some(slot) = slot else {
            if header.code > 0 {
                if let Err(e) = port.discard(header.code as usize) {
                    log::warn!("iiod responder: failed discarding orphan payload: {e}");
                }
            }
            log::trace!(
                "iiod responder: dropped orphan response for client {}",
                header.client_id
            );
            return;
        };

        let buffer_sizes = slot.take_pending_recv().map(|p| p.buffer_sizes).unwrap_or_default();
        let total_capacity: usize = buffer_sizes.iter().sum();

        let result = if header.code > 0 {
            let want = total_capacity.min(header.code as usize);
            let mut buffers: Vec<Vec<u8>> = buffer_sizes.iter().map(|&n| vec![0u8; n]).collect();
            let read_result = {
                let refs: Vec<&mut [u8]> = buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
                let mut bufvec = codec::ReadBufVec::new(refs).expect("buffer count already validated by caller");
                codec::rw_all(port, &mut bufvec, want, false)
            };
            match read_result {
                Ok(_) => {
                    let overflow = header.code as usize - want;
                    if overflow > 0 {
                        if let Err(e) = port.discard(overflow) {
                            log::warn!("iiod responder: failed discarding response overflow: {e}");
                        }
                    }
                    Ok((header.code, buffers))
                }
                Err(e) => Err(e),
            }
        } else if header.code < 0 {
            Err(IiodError::from_wire_code(header.code))
        } else {
            Ok((0, Vec::new()))
        };

        slot.complete_read(result);
    }

    fn writer_loop(&self, port: &mut dyn Port) {
        loop {
            let slot = {
                let mut writers = self.writers.lock().unwrap();
                loop {
                    if let Some(slot) = writers.pop_front() {
                        break Some(slot);
                    }
                    if self.stop.load(Ordering::SeqCst) {
                        break None;
                    }
                    writers = self.wcond.wait(writers).unwrap();
                }
            };

            let Some(slot) = slot else {
                break;
            };

            let Some(pending) = slot.take_pending_send() else {
                continue;
            };

            let refs: Vec<&[u8]> = pending.buffers.iter().map(|b| b.as_slice()).collect();
            let result = codec::write_frame(port, &pending.header, &refs).map(|n| n as i32);
            if let Err(e) = &result {
                log::warn!(
                    "iiod responder: frame send failed for client {}: {e}",
                    slot.client_id
                );
            }
            slot.complete_write(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::test_support::LoopbackPort;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn spawn_pair() -> (Arc<Responder>, LoopbackPort) {
        let (client_port, server_port) = LoopbackPort::pair();
        let responder = Responder::spawn(
            Box::new(client_port),
            Arc::new(RejectInboundCommands),
            Arc::new(CancelToken::new()),
        )
        .unwrap();
        (responder, server_port)
    }

    fn server_send_response(server: &mut LoopbackPort, client_id: u16, payload: &[u8]) {
        let header = CommandHeader::response(client_id, payload.len() as i32);
        crate::codec::write_frame(server, &header, &[payload]).unwrap();
    }

    #[test_log::test]
    fn single_attribute_read_scenario() {
        let (responder, mut server) = spawn_pair();
        let slot = responder.new_slot();

        let payload = b"in_voltage0_raw".to_vec();
        let handle = {
            let responder = responder.clone();
            let slot = slot.clone();
            std::thread::spawn(move || {
                responder.exec_command(&slot, Opcode::ReadAttr, 0, payload.len() as i32, payload, 64)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        server_send_response(&mut server, slot.client_id, b"1234\n");

        let (code, buf) = handle.join().unwrap().unwrap();
        assert_eq!(code, 5);
        assert_eq!(buf, b"1234\n");

        responder.close();
    }

    #[test]
    fn interleaved_client_ids_each_get_own_payload() {
        let (responder, mut server) = spawn_pair();
        let slot_a = responder.new_slot();
        let slot_b = responder.new_slot();

        let long_payload = vec![b'a'; 64];
        let short_payload = vec![b'b'; 4];

        responder.get_response_async(&slot_a, 64, None);
        responder.get_response_async(&slot_b, 4, None);

        // Server replies to B first, then A.
        server_send_response(&mut server, slot_b.client_id, &short_payload);
        server_send_response(&mut server, slot_a.client_id, &long_payload);

        let (code_b, buf_b) = slot_b.wait_for_read().unwrap();
        assert_eq!(code_b, 4);
        assert_eq!(buf_b, vec![short_payload]);

        let (code_a, buf_a) = slot_a.wait_for_read().unwrap();
        assert_eq!(code_a, 64);
        assert_eq!(buf_a, vec![long_payload]);

        responder.close();
    }

    #[test]
    fn orphan_response_is_discarded_without_signalling_anyone() {
        let (responder, mut server) = spawn_pair();
        let slot = responder.new_slot();
        responder.get_response_async(&slot, 16, None);
        responder.cancel_slot(&slot);

        server_send_response(&mut server, slot.client_id, &vec![0u8; 16]);

        // Send a second, live request and confirm the stream is still
        // framed correctly afterwards.
        let slot2 = responder.new_slot();
        responder.get_response_async(&slot2, 4, None);
        std::thread::sleep(Duration::from_millis(20));
        server_send_response(&mut server, slot2.client_id, b"ok!!");

        let (code, buf) = slot2.wait_for_read().unwrap();
        assert_eq!(code, 4);
        assert_eq!(buf, b"ok!!");
        assert!(!slot.r_done());

        responder.close();
    }

    #[test_log::test]
    fn negative_code_response_wakes_waiter_with_error() {
        let (responder, mut server) = spawn_pair();
        let slot = responder.new_slot();
        responder.get_response_async(&slot, 16, None);

        let header = CommandHeader::response(slot.client_id, -32); // -EPIPE
        crate::codec::write_frame(&mut server, &header, &[]).unwrap();

        let err = slot.wait_for_read().unwrap_err();
        assert_matches!(err, IiodError::BrokenPipe);

        responder.close();
    }

    #[test]
    fn cancel_wakes_a_caller_blocked_in_exec_command() {
        let (responder, _server) = spawn_pair();
        let slot = responder.new_slot();

        // Arm a read with nothing ever going to answer it, then cancel
        // from another thread while the caller is blocked.
        responder.get_response_async(&slot, 16, None);
        let slot_for_waiter = slot.clone();
        let waiter = std::thread::spawn(move || slot_for_waiter.wait_for_read());

        std::thread::sleep(Duration::from_millis(20));
        responder.cancel_slot(&slot);

        assert_matches!(waiter.join().unwrap(), Err(IiodError::Cancelled));
        responder.close();
    }

    #[test]
    fn get_and_request_response_chains_without_dropping_bytes() {
        let (responder, mut server) = spawn_pair();
        let slot = responder.new_slot();
        responder.get_response_async(&slot, 4, None);

        // The server answers the first and second reads back-to-back,
        // with no delay between them, so the re-arm in
        // get_and_request_response races the reader thread's next
        // dispatch.
        server_send_response(&mut server, slot.client_id, b"aaaa");
        server_send_response(&mut server, slot.client_id, b"bbbb");

        let (code1, buf1) = slot.wait_for_read().unwrap();
        assert_eq!(code1, 4);
        assert_eq!(buf1, b"aaaa");

        let (code2, buf2) = responder.get_and_request_response(&slot, 4).unwrap();
        assert_eq!(code2, 4);
        assert_eq!(buf2, b"bbbb");

        responder.close();
    }

    #[test]
    fn vectored_send_rejects_over_cap_buffers() {
        let (responder, _server) = spawn_pair();
        let slot = responder.new_slot();
        let buffers: Vec<Vec<u8>> = (0..40).map(|_| vec![0u8]).collect();
        assert_matches!(
            responder.send_command_async_vectored(&slot, Opcode::WriteBuf, 0, 40, buffers, None),
            Err(IiodError::InvalidArgument(_))
        );
        responder.close();
    }

    #[test]
    fn vectored_recv_rejects_over_cap_buffers() {
        let (responder, _server) = spawn_pair();
        let slot = responder.new_slot();
        let sizes = vec![4usize; 40];
        assert_matches!(
            responder.get_response_async_vectored(&slot, sizes, None),
            Err(IiodError::InvalidArgument(_))
        );
        responder.close();
    }

    #[test]
    fn vectored_send_rejects_empty_buffer_vector() {
        let (responder, _server) = spawn_pair();
        let slot = responder.new_slot();
        assert_matches!(
            responder.send_command_async_vectored(&slot, Opcode::WriteBuf, 0, 0, Vec::new(), None),
            Err(IiodError::InvalidArgument(_))
        );
        responder.close();
    }

    #[test]
    fn exec_command_vectored_splits_response_across_buffers() {
        let (responder, mut server) = spawn_pair();
        let slot = responder.new_slot();

        let handle = {
            let responder = responder.clone();
            let slot = slot.clone();
            std::thread::spawn(move || {
                responder.exec_command_vectored(&slot, Opcode::ReadBuf, 0, 0, vec![Vec::new()], vec![3, 3])
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        server_send_response(&mut server, slot.client_id, b"abcdef");

        let (code, bufs) = handle.join().unwrap().unwrap();
        assert_eq!(code, 6);
        assert_eq!(bufs, vec![b"abc".to_vec(), b"def".to_vec()]);

        responder.close();
    }
}
