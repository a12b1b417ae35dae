//! Error types shared by every layer of the crate.

use thiserror::Error;

/// The abstract error kinds a transport or the responder can surface.
///
/// These map 1:1 onto the kinds enumerated by the protocol: transport
/// failures are funneled into one of these before being handed to a
/// waiting [`crate::slot::RequestSlot`].
#[derive(Error, Debug)]
pub enum IiodError {
    /// A caller-supplied argument was malformed (e.g. an empty buffer
    /// vector with no command payload, or more than 32 buffers).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The server refused the operation for permission reasons.
    #[error("access denied")]
    AccessDenied,
    /// The requested device, channel or attribute does not exist.
    #[error("not found")]
    NotFound,
    /// The underlying device disappeared (USB unplug, etc).
    #[error("no such device")]
    NoDevice,
    /// The resource is already in use (e.g. endpoint couple exhaustion).
    #[error("resource busy")]
    Busy,
    /// An operation exceeded its configured timeout.
    #[error("operation timed out")]
    Timeout,
    /// The transport's peer closed or reset the connection.
    #[error("broken pipe")]
    BrokenPipe,
    /// A blocking syscall was interrupted; the caller may retry.
    #[error("interrupted")]
    Interrupted,
    /// The server or a transport ran out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation is not supported by this transport or server.
    #[error("unsupported")]
    Unsupported,
    /// A generic I/O error not covered by a more specific kind.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// The operation was cancelled via [`crate::cancel::CancelToken`].
    #[error("cancelled")]
    Cancelled,
    /// The peer sent a frame that violates the wire protocol (unknown
    /// opcode, truncated header, etc).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The peer closed the stream cleanly (a header read returned 0 bytes).
    #[error("end of stream")]
    EndOfStream,
}

impl IiodError {
    /// The negative `code` value this error would be encoded as on the
    /// wire in a RESPONSE frame, mirroring libiio's errno conventions.
    pub fn as_wire_code(&self) -> i32 {
        use IiodError::*;
        let errno = match self {
            InvalidArgument(_) => libc_like::EINVAL,
            AccessDenied => libc_like::EACCES,
            NotFound => libc_like::ENOENT,
            NoDevice => libc_like::ENODEV,
            Busy => libc_like::EBUSY,
            Timeout => libc_like::ETIMEDOUT,
            BrokenPipe => libc_like::EPIPE,
            Interrupted => libc_like::EINTR,
            OutOfMemory => libc_like::ENOMEM,
            Unsupported => libc_like::ENOTSUP,
            Io(_) => libc_like::EIO,
            Cancelled => libc_like::EBADF,
            ProtocolViolation(_) => libc_like::EPROTO,
            EndOfStream => libc_like::EPIPE,
        };
        -errno
    }

    /// Reconstructs an error kind from a negative wire `code`, the
    /// inverse of [`IiodError::as_wire_code`]. Used by the reader loop
    /// when it wakes a slot with a server-supplied error code.
    pub fn from_wire_code(code: i32) -> Self {
        debug_assert!(code < 0, "from_wire_code expects a negative errno");
        match -code {
            libc_like::EINVAL => IiodError::InvalidArgument("server rejected argument".into()),
            libc_like::EACCES => IiodError::AccessDenied,
            libc_like::ENOENT => IiodError::NotFound,
            libc_like::ENODEV => IiodError::NoDevice,
            libc_like::EBUSY => IiodError::Busy,
            libc_like::ETIMEDOUT => IiodError::Timeout,
            libc_like::EPIPE => IiodError::BrokenPipe,
            libc_like::EINTR => IiodError::Interrupted,
            libc_like::ENOMEM => IiodError::OutOfMemory,
            libc_like::ENOTSUP => IiodError::Unsupported,
            libc_like::EBADF => IiodError::Cancelled,
            libc_like::EPROTO => IiodError::ProtocolViolation("server reported protocol error".into()),
            _ => IiodError::Io(std::io::Error::from_raw_os_error(-code)),
        }
    }
}

/// A tiny table of the errno values used in [`IiodError::as_wire_code`].
///
/// Kept local rather than pulled from the `libc` crate: only a handful
/// of numeric constants are needed, and the responder core has no other
/// reason to depend on `libc` (the USB/TCP transport layers, which do
/// real syscalls, bring in `libc` transitively through `rusb`/`mio`).
mod libc_like {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ENODEV: i32 = 19;
    pub const ETIMEDOUT: i32 = 110;
    pub const ENOTSUP: i32 = 95;
    pub const EPROTO: i32 = 71;
    pub const EINTR: i32 = 4;
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IiodError>;
