//! Receive and send buffers.
//!
//! Both buffers remember the first backend error they hit; once set, the
//! error is reported by every later fill or flush on that buffer.

use std::io;

use bytes::{Buf, BytesMut};
use psl_common::{PslError, PslResult};
use tracing::debug;

use crate::backend::IoBackend;

fn sticky(kind: io::ErrorKind) -> PslError {
    PslError::Io(io::Error::from(kind))
}

/// Read-side buffer with a fixed capacity.
#[derive(Debug)]
pub struct RecvBuffer {
    data: BytesMut,
    capacity: usize,
    eof: bool,
    error: Option<io::ErrorKind>,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RecvBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
            eof: false,
            error: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes buffered and not yet consumed.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once the backend reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Returns the recorded backend error, if any.
    pub fn check(&self) -> PslResult<()> {
        match self.error {
            Some(kind) => Err(sticky(kind)),
            None => Ok(()),
        }
    }

    /// Reads until at least `min` bytes are buffered, asking the backend for
    /// no more than `max` buffered bytes in total.
    ///
    /// Stops early at end of stream or on error; returns the buffered length.
    pub fn fill(&mut self, backend: &mut dyn IoBackend, min: usize, max: usize) -> usize {
        let max = max.min(self.capacity).max(min);
        while self.data.len() < min && !self.eof && self.error.is_none() {
            let start = self.data.len();
            self.data.resize(max, 0);
            match backend.blocking_read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    self.eof = true;
                }
                Ok(n) => self.data.truncate(start + n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.data.truncate(start);
                }
                Err(err) => {
                    self.data.truncate(start);
                    debug!(error = %err, "receive failed");
                    self.error = Some(err.kind());
                }
            }
        }
        self.data.len()
    }

    /// Reads whatever the backend has without blocking, up to capacity.
    pub fn fill_nonblocking(&mut self, backend: &mut dyn IoBackend) -> PslResult<usize> {
        self.check()?;
        loop {
            let start = self.data.len();
            if start >= self.capacity || self.eof {
                return Ok(start);
            }
            self.data.resize(self.capacity, 0);
            match backend.nonblocking_read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    self.eof = true;
                }
                Ok(n) => self.data.truncate(start + n),
                Err(err) => {
                    self.data.truncate(start);
                    match err.kind() {
                        io::ErrorKind::Interrupted => {}
                        io::ErrorKind::WouldBlock => return Ok(start),
                        kind => {
                            self.error = Some(kind);
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }

    /// Moves up to `out.len()` buffered bytes into `out`.
    pub fn copy_to(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        self.data.copy_to_slice(&mut out[..n]);
        n
    }

    /// Drops up to `len` buffered bytes.
    pub fn consume(&mut self, len: usize) -> usize {
        let n = len.min(self.data.len());
        self.data.advance(n);
        n
    }

    /// Drops everything buffered and forgets end of stream.
    pub fn clear(&mut self) {
        self.data.clear();
        self.eof = false;
    }
}

/// Write-side buffer; grows until flushed.
#[derive(Debug)]
pub struct SendBuffer {
    data: BytesMut,
    error: Option<io::ErrorKind>,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        SendBuffer {
            data: BytesMut::with_capacity(capacity),
            error: None,
        }
    }

    /// Bytes queued and not yet written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Writes every queued byte, blocking.
    pub fn flush(&mut self, backend: &mut dyn IoBackend) -> PslResult<()> {
        if let Some(kind) = self.error {
            return Err(sticky(kind));
        }
        while !self.data.is_empty() {
            match backend.blocking_write(&self.data) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.data.advance(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(())
    }

    /// Writes what the backend accepts without blocking.
    ///
    /// Returns true when the buffer was drained.
    pub fn flush_nonblocking(&mut self, backend: &mut dyn IoBackend) -> PslResult<bool> {
        if let Some(kind) = self.error {
            return Err(sticky(kind));
        }
        while !self.data.is_empty() {
            match backend.nonblocking_write(&self.data) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.data.advance(n),
                Err(err) => match err.kind() {
                    io::ErrorKind::Interrupted => {}
                    io::ErrorKind::WouldBlock => return Ok(false),
                    _ => return Err(self.fail(err)),
                },
            }
        }
        Ok(true)
    }

    fn fail(&mut self, err: io::Error) -> PslError {
        debug!(error = %err, pending = self.data.len(), "send failed");
        self.error = Some(err.kind());
        err.into()
    }
}
