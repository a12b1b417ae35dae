//! The TCP half of component C8, and the socket-specific half of
//! component C7 (spec 4.7: an auxiliary event object multiplexed with
//! the socket fd so a blocking recv/send can be cancelled promptly).

use std::io::{self, Read as _, Write as _};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::cancel::CancelToken;
use crate::error::{IiodError, Result};
use crate::port::Port;

const SOCK_TOKEN: Token = Token(0);
const CANCEL_TOKEN: Token = Token(1);

/// A TCP transport adapter implementing [`Port`].
///
/// Every blocking `read`/`write` first waits, multiplexed, on `(socket,
/// cancel_event)` via its own `mio::Poll`; firing the shared
/// [`CancelToken`] on any thread wakes whichever half is currently
/// blocked.
pub struct NetPort {
    socket: TcpStream,
    poll: Poll,
    events: Events,
    cancel: Arc<CancelToken>,
    timeout: Option<Duration>,
}

impl NetPort {
    /// Connects to `addr` and wraps the resulting socket as a [`Port`].
    /// `timeout` is the local transport timeout (spec 4.8); `None`
    /// waits indefinitely.
    pub fn connect(addr: SocketAddr, cancel: Arc<CancelToken>, timeout: Option<Duration>) -> Result<Self> {
        let std_stream = std::net::TcpStream::connect(addr)?;
        std_stream.set_nonblocking(true)?;
        Self::from_std(std_stream, cancel, timeout)
    }

    fn from_std(std_stream: std::net::TcpStream, cancel: Arc<CancelToken>, timeout: Option<Duration>) -> Result<Self> {
        let mut socket = TcpStream::from_std(std_stream);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCK_TOKEN, Interest::READABLE | Interest::WRITABLE)?;
        let waker = mio::Waker::new(poll.registry(), CANCEL_TOKEN)?;
        cancel.register_waker(waker);

        Ok(NetPort {
            socket,
            poll,
            events: Events::with_capacity(4),
            cancel,
            timeout,
        })
    }

    /// Blocks (subject to `self.timeout` and the cancel token) until
    /// the socket is ready for `interest`.
    fn wait_ready(&mut self, interest: Interest) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(IiodError::Cancelled);
            }

            match self.poll.poll(&mut self.events, self.timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if self.events.is_empty() {
                return Err(IiodError::Timeout);
            }

            let mut ready = false;
            let mut cancelled = false;
            for event in self.events.iter() {
                match event.token() {
                    CANCEL_TOKEN => cancelled = true,
                    SOCK_TOKEN => {
                        if (interest.is_readable() && event.is_readable())
                            || (interest.is_writable() && event.is_writable())
                        {
                            ready = true;
                        }
                    }
                    _ => {}
                }
            }

            if cancelled || self.cancel.is_cancelled() {
                return Err(IiodError::Cancelled);
            }
            if ready {
                return Ok(());
            }
            // Spurious wakeup (e.g. the other interest fired); poll again.
        }
    }
}

impl Port for NetPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.socket.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Interest::READABLE)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            match self.socket.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Interest::WRITABLE)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_clone(&self) -> Result<Box<dyn Port>> {
        // `mio::net::TcpStream` doesn't expose `try_clone`; duplicate
        // the underlying fd directly so the reader and writer threads
        // get independent, fully-owned socket handles backed by the
        // same kernel socket.
        let fd = self.socket.as_raw_fd();
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(IiodError::Io(io::Error::last_os_error()));
        }
        let cloned_std = unsafe { std::net::TcpStream::from_raw_fd(dup_fd) };
        cloned_std.set_nonblocking(true)?;

        Ok(Box::new(Self::from_std(
            cloned_std,
            self.cancel.clone(),
            self.timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::TcpListener;

    fn loopback_pair() -> (NetPort, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = Arc::new(CancelToken::new());
        let client = NetPort::connect(addr, cancel, None).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn cancel_wakes_a_blocked_read() {
        let (mut client, _server) = loopback_pair();
        let cancel = client.cancel.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            client.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        let result = handle.join().unwrap();
        assert_matches!(result, Err(IiodError::Cancelled));
    }

    #[test]
    fn cancel_is_latched_for_subsequent_operations() {
        let (mut client, _server) = loopback_pair();
        client.cancel.cancel();

        let mut buf = [0u8; 8];
        assert_matches!(client.read(&mut buf), Err(IiodError::Cancelled));
        assert_matches!(client.write(b"x"), Err(IiodError::Cancelled));
    }

    #[test]
    fn short_read_resumes_across_calls() {
        let (mut client, mut server) = loopback_pair();
        server.write_all(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 8];
        // Only 3 bytes are available yet; a second read after more
        // arrive should pick up where the first left off.
        let n1 = client.read(&mut buf[..3]).unwrap();
        assert_eq!(n1, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        server.write_all(&[4, 5]).unwrap();
        let n2 = client.read(&mut buf[3..5]).unwrap();
        assert_eq!(n2, 2);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
    }
}
