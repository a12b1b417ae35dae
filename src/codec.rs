//! Framing codec (component C2): the 8-byte command header and the
//! vectored-I/O primitive that drives a [`Port`] until a declared byte
//! count has been transferred.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use std::io::Cursor;

use crate::error::{IiodError, Result};
use crate::port::Port;

/// Size in bytes of a [`CommandHeader`] on the wire.
pub const HEADER_SIZE: usize = 8;

/// The maximum number of buffers a single vectored transfer may use.
///
/// Exceeding this is an [`IiodError::InvalidArgument`] (spec boundary
/// behavior).
pub const MAX_BUFFERS: usize = 32;

/// Opcodes understood by the iiod wire protocol.
///
/// This is the full enumerated set from the protocol; an opcode byte
/// that doesn't decode to one of these is a fatal protocol error (see
/// [`Opcode::decode`]).
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum Opcode {
    /// A response to a previously sent command.
    Response = 0,
    Print = 1,
    Version = 2,
    Timeout = 3,
    Open = 4,
    OpenCyclic = 5,
    Close = 6,
    ReadAttr = 7,
    ReadDbgAttr = 8,
    ReadBufAttr = 9,
    ReadChnAttr = 10,
    WriteAttr = 11,
    WriteDbgAttr = 12,
    WriteBufAttr = 13,
    WriteChnAttr = 14,
    ReadBuf = 15,
    WriteBuf = 16,
    GetTrig = 17,
    SetTrig = 18,
    SetBufCnt = 19,
}

impl Opcode {
    /// Decodes a raw opcode byte, treating anything unrecognized as a
    /// fatal protocol error per the spec's "unknown opcodes MUST be
    /// treated as a fatal protocol error" rule.
    pub fn decode(byte: u8) -> Result<Self> {
        Opcode::from_u8(byte)
            .ok_or_else(|| IiodError::ProtocolViolation(format!("unknown opcode {byte}")))
    }

    /// Encodes this opcode back to its wire byte.
    pub fn encode(self) -> u8 {
        self.to_u8().expect("Opcode always fits in u8")
    }
}

/// The fixed 8-byte command header, transmitted in host byte order.
///
/// The protocol intentionally does not endian-swap: client and server
/// are assumed to be built for the same architecture. This is the one
/// place this crate deviates from the byteorder convention used
/// elsewhere in its lineage (`NetworkEndian` is not appropriate here).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    /// Correlates a RESPONSE to the request that caused it.
    pub client_id: u16,
    /// The operation code.
    pub op: Opcode,
    /// Device index within the context. Opaque to this layer.
    pub dev: u8,
    /// Command-specific argument; in a RESPONSE frame this is the
    /// signed return code (and, if positive, the payload byte count).
    pub code: i32,
}

impl CommandHeader {
    /// Builds a non-response command header.
    pub fn command(client_id: u16, op: Opcode, dev: u8, code: i32) -> Self {
        CommandHeader {
            client_id,
            op,
            dev,
            code,
        }
    }

    /// Builds a RESPONSE header carrying `code` as its return value.
    pub fn response(client_id: u16, code: i32) -> Self {
        CommandHeader {
            client_id,
            op: Opcode::Response,
            dev: 0,
            code,
        }
    }

    /// If this is a RESPONSE header and `code > 0`, the number of
    /// payload bytes that follow it on the wire.
    pub fn payload_len(&self) -> usize {
        if self.code > 0 {
            self.code as usize
        } else {
            0
        }
    }

    /// Encodes the header to its 8-byte wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            cursor.write_u16::<NativeEndian>(self.client_id).unwrap();
            cursor.write_u8(self.op.encode()).unwrap();
            cursor.write_u8(self.dev).unwrap();
            cursor.write_i32::<NativeEndian>(self.code).unwrap();
        }
        buf
    }

    /// Decodes a header from its 8-byte wire representation.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let client_id = cursor.read_u16::<NativeEndian>()?;
        let op = Opcode::decode(cursor.read_u8()?)?;
        let dev = cursor.read_u8()?;
        let code = cursor.read_i32::<NativeEndian>()?;
        Ok(CommandHeader {
            client_id,
            op,
            dev,
            code,
        })
    }
}

/// Rejects a buffer vector length that's over [`MAX_BUFFERS`] or, unless
/// `allow_empty`, zero (spec section 8 boundary behaviors). Shared by
/// [`BufVec::new`] and the responder's vectored send/recv entry points,
/// so the cap is enforced identically everywhere a caller can supply a
/// buffer count.
pub fn validate_buffer_count(len: usize, allow_empty: bool) -> Result<()> {
    if len > MAX_BUFFERS {
        return Err(IiodError::InvalidArgument(format!(
            "buffer vector of length {len} exceeds the {MAX_BUFFERS} cap"
        )));
    }
    if len == 0 && !allow_empty {
        return Err(IiodError::InvalidArgument(
            "empty buffer vector with no command payload".into(),
        ));
    }
    Ok(())
}

/// An ordered list of mutable buffer slices used for a single vectored
/// transfer, capped at [`MAX_BUFFERS`] entries.
pub struct BufVec<'a> {
    buffers: Vec<&'a mut [u8]>,
}

impl<'a> BufVec<'a> {
    /// Builds a buffer vector, rejecting it if empty-with-no-payload or
    /// over the length cap (spec section 8 boundary behaviors).
    pub fn new(buffers: Vec<&'a mut [u8]>, allow_empty: bool) -> Result<Self> {
        validate_buffer_count(buffers.len(), allow_empty)?;
        Ok(BufVec { buffers })
    }

    /// Total size in bytes across every buffer in the vector.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
}

/// Read side of a transfer: a slice of owned buffers, built once and
/// consumed by [`rw_all`].
pub struct ReadBufVec<'a> {
    inner: BufVec<'a>,
}

impl<'a> ReadBufVec<'a> {
    pub fn new(buffers: Vec<&'a mut [u8]>) -> Result<Self> {
        Ok(ReadBufVec {
            inner: BufVec::new(buffers, true)?,
        })
    }
}

/// Drives `port` until exactly `want` bytes have been transferred
/// across `bufs`, advancing the current buffer on short I/O and
/// retiring buffers as they are filled.
///
/// On a read, the transfer is capped to `want` bytes even if the
/// combined buffer capacity is larger, so oversized trailing buffers
/// are left untouched (spec 4.1).
pub fn rw_all(port: &mut dyn Port, bufs: &mut ReadBufVec<'_>, want: usize, write: bool) -> Result<usize> {
    let mut remaining = want;
    let mut transferred = 0usize;

    for buf in bufs.inner.buffers.iter_mut() {
        if remaining == 0 {
            break;
        }
        let take = buf.len().min(remaining);
        if take == 0 {
            continue;
        }
        let mut offset = 0;
        while offset < take {
            let n = if write {
                port.write(&buf[offset..take])?
            } else {
                port.read(&mut buf[offset..take])?
            };
            if n == 0 {
                return Err(IiodError::EndOfStream);
            }
            offset += n;
        }
        transferred += take;
        remaining -= take;
    }

    Ok(transferred)
}

/// Writes a header followed by an ordered list of send buffers as one
/// logical frame. Used by the writer loop (4.3): header first, then
/// the slot's supplied send buffers, as a single contiguous run of
/// outbound bytes (no other thread may interleave writes on the port).
pub fn write_frame(port: &mut dyn Port, header: &CommandHeader, buffers: &[&[u8]]) -> Result<usize> {
    let encoded = header.encode();
    let mut total = write_all(port, &encoded)?;
    for buf in buffers {
        total += write_all(port, buf)?;
    }
    Ok(total)
}

fn write_all(port: &mut dyn Port, mut buf: &[u8]) -> Result<usize> {
    let want = buf.len();
    while !buf.is_empty() {
        let n = port.write(buf)?;
        if n == 0 {
            return Err(IiodError::BrokenPipe);
        }
        buf = &buf[n..];
    }
    Ok(want)
}

/// Reads exactly one 8-byte header from `port`.
///
/// Returns `Ok(None)` if the peer closed the stream before any bytes of
/// the header arrived (the reader loop's "header read of `0` bytes"
/// fatal condition); a partial header followed by closure is a
/// protocol violation rather than a clean EOF.
pub fn read_header(port: &mut dyn Port) -> Result<Option<CommandHeader>> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = port.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(IiodError::ProtocolViolation(
                "stream closed mid-header".into(),
            ));
        }
        filled += n;
    }
    CommandHeader::decode(&buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::test_support::LoopbackPort;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_round_trip() {
        let h = CommandHeader::command(7, Opcode::ReadAttr, 2, 15);
        let encoded = h.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = CommandHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn unknown_opcode_is_protocol_violation() {
        assert!(Opcode::decode(200).is_err());
    }

    #[test]
    fn buf_vec_rejects_over_cap() {
        let mut storage: Vec<Vec<u8>> = (0..40).map(|_| vec![0u8; 1]).collect();
        let bufs: Vec<&mut [u8]> = storage.iter_mut().map(|v| v.as_mut_slice()).collect();
        assert!(matches!(
            BufVec::new(bufs, true),
            Err(IiodError::InvalidArgument(_))
        ));
    }

    #[test]
    fn buf_vec_rejects_empty_without_payload() {
        assert!(matches!(
            BufVec::new(Vec::new(), false),
            Err(IiodError::InvalidArgument(_))
        ));
    }

    #[test]
    fn short_read_resumes_across_rw_all_calls() {
        let (mut a, mut b) = LoopbackPort::pair();
        // Write only part of an 8-byte header first.
        a.write(&[1, 2, 3]).unwrap();
        let mut first = [0u8; 3];
        let mut bufs = ReadBufVec::new(vec![&mut first]).unwrap();
        let n = rw_all(&mut b, &mut bufs, 3, false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(first, [1, 2, 3]);

        a.write(&[4, 5, 6, 7, 8]).unwrap();
        let mut second = [0u8; 5];
        let mut bufs2 = ReadBufVec::new(vec![&mut second]).unwrap();
        let n2 = rw_all(&mut b, &mut bufs2, 5, false).unwrap();
        assert_eq!(n2, 5);
        assert_eq!(second, [4, 5, 6, 7, 8]);
    }

    #[test]
    fn read_capped_to_declared_bytes_leaves_trailing_buffer_untouched() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.write(&[9, 9]).unwrap();

        let mut small = [0u8; 2];
        let mut oversized = [0xFFu8; 10];
        let mut bufs = ReadBufVec::new(vec![&mut small, &mut oversized]).unwrap();
        let n = rw_all(&mut b, &mut bufs, 2, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(small, [9, 9]);
        assert_eq!(oversized, [0xFFu8; 10]);
    }
}
