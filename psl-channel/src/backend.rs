//! # I/O Backends
//!
//! Purpose: Abstract the byte transport under a channel so the same framing
//! runs over plain TCP, an authenticated/encrypted session, or an in-process
//! pipe.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `IoBackend` is injected per channel and can be
//!    swapped while the channel's buffers stay intact.
//! 2. **Blocking First**: only the blocking calls are mandatory; the
//!    non-blocking and credential hooks have inert defaults.
//! 3. **Zero Semantics**: a read of 0 bytes means the peer closed the stream.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use psl_common::PslResult;

/// Byte transport driven by a [`Channel`](crate::Channel).
pub trait IoBackend: Send {
    /// Reads at least one byte, blocking; `Ok(0)` means end of stream.
    fn blocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes at least one byte, blocking.
    fn blocking_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads what is available; `WouldBlock` when nothing is.
    fn nonblocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.blocking_read(buf)
    }

    /// Writes what the transport accepts; `WouldBlock` when it accepts nothing.
    fn nonblocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.blocking_write(buf)
    }

    /// Tears the transport down.
    fn close(&mut self) -> PslResult<()> {
        Ok(())
    }

    /// Makes the session credential available to child processes.
    fn export_credential(&mut self) -> PslResult<()> {
        Ok(())
    }

    /// Removes an exported credential; `sighandler` is set when called from
    /// a signal handler and the implementation must not allocate.
    fn delete_credential(&mut self, _sighandler: bool) -> PslResult<()> {
        Ok(())
    }

    /// Environment assignment that points a child process at the exported
    /// credential.
    fn env_for_credential(&self) -> Option<String> {
        None
    }

    /// OS descriptor of the transport, if it has one.
    fn descriptor(&self) -> Option<i32> {
        None
    }
}

impl<B: IoBackend + ?Sized> IoBackend for Box<B> {
    fn blocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).blocking_read(buf)
    }

    fn blocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).blocking_write(buf)
    }

    fn nonblocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).nonblocking_read(buf)
    }

    fn nonblocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).nonblocking_write(buf)
    }

    fn close(&mut self) -> PslResult<()> {
        (**self).close()
    }

    fn export_credential(&mut self) -> PslResult<()> {
        (**self).export_credential()
    }

    fn delete_credential(&mut self, sighandler: bool) -> PslResult<()> {
        (**self).delete_credential(sighandler)
    }

    fn env_for_credential(&self) -> Option<String> {
        (**self).env_for_credential()
    }

    fn descriptor(&self) -> Option<i32> {
        (**self).descriptor()
    }
}

/// Socket options applied by [`TcpBackend::connect`].
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            nodelay: true,
        }
    }
}

/// Plain TCP transport.
#[derive(Debug)]
pub struct TcpBackend {
    stream: TcpStream,
    nonblocking: bool,
}

impl TcpBackend {
    /// Connects to the first reachable address and applies `options`.
    pub fn connect<A: ToSocketAddrs>(addr: A, options: &TcpOptions) -> PslResult<Self> {
        let stream = connect_stream(addr, options.connect_timeout)?;
        if let Some(timeout) = options.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = options.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        if options.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(TcpBackend::from_stream(stream))
    }

    /// Wraps an already connected (or accepted) stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        TcpBackend {
            stream,
            nonblocking: false,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    fn set_mode(&mut self, nonblocking: bool) -> io::Result<()> {
        if self.nonblocking != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }
}

fn connect_stream<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

impl IoBackend for TcpBackend {
    fn blocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.set_mode(false)?;
        self.stream.read(buf)
    }

    fn blocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.set_mode(false)?;
        self.stream.write(buf)
    }

    fn nonblocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.set_mode(true)?;
        self.stream.read(buf)
    }

    fn nonblocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.set_mode(true)?;
        self.stream.write(buf)
    }

    fn close(&mut self) -> PslResult<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }

    #[cfg(unix)]
    fn descriptor(&self) -> Option<i32> {
        use std::os::unix::io::AsRawFd;
        Some(self.stream.as_raw_fd())
    }
}

struct PipeState {
    // queues[n] holds bytes waiting to be read by side n.
    queues: [VecDeque<u8>; 2],
    closed: [bool; 2],
}

struct PipeShared {
    state: Mutex<PipeState>,
    ready: Condvar,
}

/// One end of an in-process byte pipe created by [`pipe`].
pub struct PipeBackend {
    shared: Arc<PipeShared>,
    side: usize,
}

/// Creates a connected pair of in-process backends.
///
/// Bytes written on one end are read on the other; reads block until data
/// arrives or the peer end is closed or dropped.
pub fn pipe() -> (PipeBackend, PipeBackend) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            queues: [VecDeque::new(), VecDeque::new()],
            closed: [false, false],
        }),
        ready: Condvar::new(),
    });
    (
        PipeBackend {
            shared: Arc::clone(&shared),
            side: 0,
        },
        PipeBackend { shared, side: 1 },
    )
}

impl PipeBackend {
    fn peer(&self) -> usize {
        1 - self.side
    }

    fn read_inner(&mut self, buf: &mut [u8], block: bool) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            let queue = &mut state.queues[self.side];
            if !queue.is_empty() {
                let n = buf.len().min(queue.len());
                for (dst, src) in buf.iter_mut().zip(queue.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if state.closed[self.peer()] || state.closed[self.side] {
                return Ok(0);
            }
            if !block {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.shared.ready.wait(&mut state);
        }
    }

    fn write_inner(&mut self, buf: &[u8]) -> io::Result<usize> {
        let peer = self.peer();
        let mut state = self.shared.state.lock();
        if state.closed[peer] || state.closed[self.side] {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.queues[peer].extend(buf.iter().copied());
        self.shared.ready.notify_all();
        Ok(buf.len())
    }

    fn shut(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed[self.side] = true;
        self.shared.ready.notify_all();
    }
}

impl IoBackend for PipeBackend {
    fn blocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf, true)
    }

    fn blocking_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf)
    }

    fn nonblocking_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf, false)
    }

    fn close(&mut self) -> PslResult<()> {
        self.shut();
        Ok(())
    }
}

impl Drop for PipeBackend {
    fn drop(&mut self) {
        self.shut();
    }
}
