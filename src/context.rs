//! A thin device-control facade over [`Responder`] (spec 4.8 plus the
//! opcode set from section 3).
//!
//! The higher-level IIO object/attribute catalogue is explicitly out of
//! scope; `dev`/`channel` stay opaque indices here, exactly as the core
//! treats them. This module exists so a caller doesn't have to hand-roll
//! `exec_command` calls for every opcode.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::Opcode;
use crate::error::{IiodError, Result};
use crate::responder::Responder;

const ATTR_MAX_BYTES: usize = 4096;
const TRIGGER_MAX_BYTES: usize = 256;
const VERSION_MAX_BYTES: usize = 64;
const PRINT_MAX_BYTES: usize = 16 * 1024;

/// Tunables threaded through every command this facade issues (spec
/// 4.8's local/remote timeout split, mirrored after the teacher's
/// `protocol_version`-style context parameters).
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub local_timeout: Duration,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            local_timeout: Duration::from_secs(5),
        }
    }
}

/// A device-control facade bound to one [`Responder`].
pub struct Context {
    responder: Arc<Responder>,
    params: Mutex<ContextParams>,
}

impl Context {
    pub fn new(responder: Arc<Responder>, params: ContextParams) -> Self {
        Context {
            responder,
            params: Mutex::new(params),
        }
    }

    fn attr_op(&self, op: Opcode, dev: u8, name: &str) -> Result<String> {
        let slot = self.responder.new_slot();
        let payload = name.as_bytes().to_vec();
        let (_, buf) = self
            .responder
            .exec_command(&slot, op, dev, payload.len() as i32, payload, ATTR_MAX_BYTES)?;
        decode_attr_value(buf)
    }

    fn write_op(&self, op: Opcode, dev: u8, name: &str, value: &str) -> Result<i32> {
        let slot = self.responder.new_slot();
        let payload = format!("{name} {value}").into_bytes();
        let (code, _) = self.responder.exec_command(&slot, op, dev, payload.len() as i32, payload, 0)?;
        Ok(code)
    }

    /// Sends `OPEN` (or `OPEN_CYCLIC`) for `dev`, requesting `sample_count`
    /// samples per transfer.
    pub fn open(self: &Arc<Self>, dev: u8, sample_count: u32, cyclic: bool) -> Result<DeviceHandle> {
        let op = if cyclic { Opcode::OpenCyclic } else { Opcode::Open };
        let slot = self.responder.new_slot();
        self.responder
            .exec_command(&slot, op, dev, sample_count as i32, Vec::new(), 0)?;
        Ok(DeviceHandle {
            context: self.clone(),
            dev,
        })
    }

    /// Sends `CLOSE` for `dev`.
    pub fn close(&self, dev: u8) -> Result<()> {
        let slot = self.responder.new_slot();
        self.responder.exec_command(&slot, Opcode::Close, dev, 0, Vec::new(), 0)?;
        Ok(())
    }

    pub fn read_attr(&self, dev: u8, name: &str) -> Result<String> {
        self.attr_op(Opcode::ReadAttr, dev, name)
    }

    pub fn read_dbg_attr(&self, dev: u8, name: &str) -> Result<String> {
        self.attr_op(Opcode::ReadDbgAttr, dev, name)
    }

    pub fn read_buf_attr(&self, dev: u8, name: &str) -> Result<String> {
        self.attr_op(Opcode::ReadBufAttr, dev, name)
    }

    /// Reads a per-channel attribute. `channel` and `name` are opaque to
    /// the wire protocol's core; they are packed into the command
    /// payload as `"<channel> <name>"`.
    pub fn read_chn_attr(&self, dev: u8, channel: u32, name: &str) -> Result<String> {
        self.attr_op(Opcode::ReadChnAttr, dev, &format!("{channel} {name}"))
    }

    pub fn write_attr(&self, dev: u8, name: &str, value: &str) -> Result<i32> {
        self.write_op(Opcode::WriteAttr, dev, name, value)
    }

    pub fn write_dbg_attr(&self, dev: u8, name: &str, value: &str) -> Result<i32> {
        self.write_op(Opcode::WriteDbgAttr, dev, name, value)
    }

    pub fn write_buf_attr(&self, dev: u8, name: &str, value: &str) -> Result<i32> {
        self.write_op(Opcode::WriteBufAttr, dev, name, value)
    }

    pub fn write_chn_attr(&self, dev: u8, channel: u32, name: &str, value: &str) -> Result<i32> {
        self.write_op(Opcode::WriteChnAttr, dev, &format!("{channel} {name}"), value)
    }

    /// `GETTRIG`: the name of the trigger currently assigned to `dev`,
    /// or `None` if it has none.
    pub fn gettrig(&self, dev: u8) -> Result<Option<String>> {
        let slot = self.responder.new_slot();
        let (code, buf) = self
            .responder
            .exec_command(&slot, Opcode::GetTrig, dev, 0, Vec::new(), TRIGGER_MAX_BYTES)?;
        if code == 0 {
            return Ok(None);
        }
        Ok(Some(decode_attr_value(buf)?))
    }

    /// `SETTRIG`: assigns (or, with `trigger = None`, clears) `dev`'s
    /// trigger.
    pub fn settrig(&self, dev: u8, trigger: Option<&str>) -> Result<()> {
        let payload = trigger.unwrap_or("").as_bytes().to_vec();
        let slot = self.responder.new_slot();
        self.responder
            .exec_command(&slot, Opcode::SetTrig, dev, payload.len() as i32, payload, 0)?;
        Ok(())
    }

    /// `SETBUFCNT`: sets the number of kernel buffers held for `dev`'s
    /// streaming interface.
    pub fn setbufcnt(&self, dev: u8, count: u32) -> Result<()> {
        let slot = self.responder.new_slot();
        self.responder
            .exec_command(&slot, Opcode::SetBufCnt, dev, count as i32, Vec::new(), 0)?;
        Ok(())
    }

    /// `VERSION`: the remote iiod's version string.
    pub fn version(&self) -> Result<String> {
        let slot = self.responder.new_slot();
        let (_, buf) = self
            .responder
            .exec_command(&slot, Opcode::Version, 0, 0, Vec::new(), VERSION_MAX_BYTES)?;
        decode_attr_value(buf)
    }

    /// `PRINT`: the remote context's XML description.
    pub fn print(&self) -> Result<String> {
        let slot = self.responder.new_slot();
        let (_, buf) = self
            .responder
            .exec_command(&slot, Opcode::Print, 0, 0, Vec::new(), PRINT_MAX_BYTES)?;
        decode_attr_value(buf)
    }

    /// Updates the local transport timeout and negotiates `timeout / 2`
    /// with the remote side via a `TIMEOUT` command (spec 4.8). The new
    /// value is only committed to `self`'s params if the remote accepts
    /// it.
    ///
    /// The transport-level socket/USB timeout itself lives inside the
    /// boxed [`crate::port::Port`] this context's responder owns, which
    /// this facade has no handle to reconfigure; callers that need that
    /// half of spec 4.8 construct their transport with the desired
    /// timeout up front (see [`crate::net::NetPort::connect`]).
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let remote_timeout_ms = (timeout.as_millis() / 2) as i32;
        let slot = self.responder.new_slot();
        self.responder
            .exec_command(&slot, Opcode::Timeout, 0, remote_timeout_ms, Vec::new(), 0)?;
        self.params.lock().unwrap().local_timeout = timeout;
        Ok(())
    }

    pub fn local_timeout(&self) -> Duration {
        self.params.lock().unwrap().local_timeout
    }
}

fn decode_attr_value(mut buf: Vec<u8>) -> Result<String> {
    if let Some(&0) = buf.last() {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| IiodError::ProtocolViolation(format!("non-utf8 attribute value: {e}")))
}

/// A device opened via [`Context::open`]. Streaming reads/writes issue
/// `READBUF`/`WRITEBUF` against the device index this handle was opened
/// with.
pub struct DeviceHandle {
    context: Arc<Context>,
    dev: u8,
}

impl DeviceHandle {
    pub fn dev(&self) -> u8 {
        self.dev
    }

    /// `READBUF`: reads up to `buf.len()` bytes of sample data.
    pub fn read_buf(&self, buf: &mut [u8]) -> Result<usize> {
        let slot = self.context.responder.new_slot();
        let (code, data) = self.context.responder.exec_command(
            &slot,
            Opcode::ReadBuf,
            self.dev,
            buf.len() as i32,
            Vec::new(),
            buf.len(),
        )?;
        let n = code.max(0) as usize;
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// `WRITEBUF`: writes `data` as sample data.
    pub fn write_buf(&self, data: &[u8]) -> Result<usize> {
        let slot = self.context.responder.new_slot();
        let (code, _) =
            self.context
                .responder
                .exec_command(&slot, Opcode::WriteBuf, self.dev, data.len() as i32, data.to_vec(), 0)?;
        Ok(code.max(0) as usize)
    }

    /// `READBUF`, scatter-reading the response across `bufs` in order
    /// (spec §3's vectored descriptor list), e.g. to land a sample
    /// transfer directly into separate per-channel buffers without an
    /// intermediate copy.
    pub fn read_buf_vectored(&self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let sizes: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
        let slot = self.context.responder.new_slot();
        let (code, data) = self.context.responder.exec_command_vectored(
            &slot,
            Opcode::ReadBuf,
            self.dev,
            total as i32,
            vec![Vec::new()],
            sizes,
        )?;
        for (dst, src) in bufs.iter_mut().zip(data.iter()) {
            dst[..src.len()].copy_from_slice(src);
        }
        Ok(code.max(0) as usize)
    }

    /// `WRITEBUF`, gather-writing `bufs` as a single ordered send.
    pub fn write_buf_vectored(&self, bufs: &[&[u8]]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let buffers: Vec<Vec<u8>> = bufs.iter().map(|b| b.to_vec()).collect();
        let slot = self.context.responder.new_slot();
        let (code, _) = self.context.responder.exec_command_vectored(
            &slot,
            Opcode::WriteBuf,
            self.dev,
            total as i32,
            buffers,
            vec![0],
        )?;
        Ok(code.max(0) as usize)
    }

    /// Closes this device. Consumes the handle; a failure leaves the
    /// remote device open, matching `Context::close`'s own error
    /// behavior.
    pub fn close(self) -> Result<()> {
        self.context.close(self.dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::port::test_support::LoopbackPort;
    use crate::responder::RejectInboundCommands;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn spawn_context() -> (Arc<Context>, LoopbackPort) {
        let (client, server) = LoopbackPort::pair();
        let responder = Responder::spawn(
            Box::new(client),
            Arc::new(RejectInboundCommands),
            Arc::new(CancelToken::new()),
        )
        .unwrap();
        (Arc::new(Context::new(responder, ContextParams::default())), server)
    }

    fn respond(server: &mut LoopbackPort, client_id: u16, code: i32, payload: &[u8]) {
        let header = crate::codec::CommandHeader::response(client_id, code);
        crate::codec::write_frame(server, &header, &[payload]).unwrap();
    }

    #[test]
    fn read_attr_strips_trailing_nul() {
        let (ctx, mut server) = spawn_context();
        let handle = thread::spawn({
            let ctx = ctx.clone();
            move || ctx.read_attr(0, "in_voltage0_raw")
        });

        thread::sleep(StdDuration::from_millis(20));
        // Use client_id 0: the first slot allocated by this context.
        respond(&mut server, 0, 5, b"1234\0");

        assert_eq!(handle.join().unwrap().unwrap(), "1234");
        ctx.responder.close();
    }

    #[test]
    fn gettrig_with_zero_code_means_no_trigger() {
        let (ctx, mut server) = spawn_context();
        let handle = thread::spawn({
            let ctx = ctx.clone();
            move || ctx.gettrig(0)
        });

        thread::sleep(StdDuration::from_millis(20));
        respond(&mut server, 0, 0, &[]);

        assert_eq!(handle.join().unwrap().unwrap(), None);
        ctx.responder.close();
    }

    #[test]
    fn set_timeout_commits_only_after_remote_accepts() {
        let (ctx, mut server) = spawn_context();
        let original = ctx.local_timeout();
        let handle = thread::spawn({
            let ctx = ctx.clone();
            move || ctx.set_timeout(Duration::from_secs(10))
        });

        thread::sleep(StdDuration::from_millis(20));
        respond(&mut server, 0, 0, &[]);

        handle.join().unwrap().unwrap();
        assert_ne!(ctx.local_timeout(), original);
        assert_eq!(ctx.local_timeout(), Duration::from_secs(10));
        ctx.responder.close();
    }

    #[test]
    fn read_buf_vectored_splits_across_caller_buffers() {
        let (ctx, mut server) = spawn_context();
        let handle = thread::spawn({
            let ctx = ctx.clone();
            move || {
                let dev = ctx.open(0, 64, false).unwrap();
                let mut a = [0u8; 3];
                let mut b = [0u8; 3];
                let n = {
                    let mut bufs: [&mut [u8]; 2] = [&mut a, &mut b];
                    dev.read_buf_vectored(&mut bufs)?
                };
                Ok::<_, IiodError>((n, a, b))
            }
        });

        thread::sleep(StdDuration::from_millis(20));
        respond(&mut server, 0, 0, &[]); // OPEN
        thread::sleep(StdDuration::from_millis(20));
        respond(&mut server, 1, 6, b"abcdef"); // READBUF

        let (n, a, b) = handle.join().unwrap().unwrap();
        assert_eq!(n, 6);
        assert_eq!(&a, b"abc");
        assert_eq!(&b, b"def");
        ctx.responder.close();
    }
}
