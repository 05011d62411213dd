//! # Framed Channel
//!
//! Purpose: Carry schema-described messages over an `IoBackend`, buffering
//! both directions.
//!
//! ## Design Principles
//! 1. **Explicit Flush**: sends only fill the send buffer; nothing reaches
//!    the wire before `flush`.
//! 2. **Exact or Read-Ahead**: every receive takes `just`. With `just` set the
//!    channel reads no byte past the requested fields, so the transport can be
//!    handed to another reader afterwards.
//! 3. **Three Outcomes**: a receive yields values, a soft end of data
//!    (`Ok(None)`, peer closed between fields), or an error (`Protocol` for a
//!    truncated field, `Io` for the backend).
//! 4. **Swappable Transport**: `set_backend` replaces the backend in place;
//!    buffered bytes survive the swap.

use std::collections::TryReserveError;
use std::mem;

use psl_common::{PslError, PslResult, DEFAULT_BUFFER_SIZE, LENGTH_PREFIX_BYTES};
use tracing::{debug, error};

use crate::backend::IoBackend;
use crate::buffer::{RecvBuffer, SendBuffer};
use crate::codec::{self, Field, Item, Value};

/// Buffered, schema-driven message stream.
pub struct Channel {
    recv: RecvBuffer,
    send: SendBuffer,
    backend: Box<dyn IoBackend>,
}

impl Channel {
    /// Binds default-sized buffers to `backend`.
    pub fn new<B: IoBackend + 'static>(backend: B) -> Self {
        Self::with_capacity(Box::new(backend), DEFAULT_BUFFER_SIZE)
    }

    /// Binds buffers of `capacity` bytes to a boxed backend.
    pub fn with_capacity(backend: Box<dyn IoBackend>, capacity: usize) -> Self {
        Channel {
            recv: RecvBuffer::new(capacity),
            send: SendBuffer::new(capacity),
            backend,
        }
    }

    /// Replaces the backend, returning the previous one. Buffers are kept.
    pub fn set_backend(&mut self, backend: Box<dyn IoBackend>) -> Box<dyn IoBackend> {
        mem::replace(&mut self.backend, backend)
    }

    pub fn backend(&self) -> &dyn IoBackend {
        &*self.backend
    }

    pub fn backend_mut(&mut self) -> &mut dyn IoBackend {
        &mut *self.backend
    }

    pub fn descriptor(&self) -> Option<i32> {
        self.backend.descriptor()
    }

    pub fn export_credential(&mut self) -> PslResult<()> {
        self.backend.export_credential()
    }

    pub fn delete_credential(&mut self, sighandler: bool) -> PslResult<()> {
        self.backend.delete_credential(sighandler)
    }

    pub fn env_for_credential(&self) -> Option<String> {
        self.backend.env_for_credential()
    }

    // ---- send side ----

    /// Queues the leading `Send` items of `schema` and returns the rest.
    pub fn send<'s, 'a>(&mut self, schema: &'s [Item<'a>]) -> PslResult<&'s [Item<'a>]> {
        codec::encode(self.send.bytes_mut(), schema)
    }

    /// Queues every item of `schema`.
    ///
    /// # Panics
    /// Panics if `schema` contains anything but `Send` items.
    pub fn send_all(&mut self, schema: &[Item<'_>]) -> PslResult<()> {
        let tail = self.send(schema)?;
        expect_consumed("send", schema, tail);
        Ok(())
    }

    /// Writes all queued bytes, blocking.
    pub fn flush(&mut self) -> PslResult<()> {
        self.send.flush(&mut *self.backend)
    }

    /// Writes what the backend accepts now; true when nothing is left queued.
    pub fn flush_nonblocking(&mut self) -> PslResult<bool> {
        self.send.flush_nonblocking(&mut *self.backend)
    }

    /// Bytes queued for sending.
    pub fn pending(&self) -> usize {
        self.send.len()
    }

    /// Writes `data` straight to the backend after flushing queued bytes.
    ///
    /// Returns the number of bytes the backend accepted.
    pub fn write_direct(&mut self, data: &[u8]) -> PslResult<usize> {
        self.flush()?;
        loop {
            match self.backend.blocking_write(data) {
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                result => return Ok(result?),
            }
        }
    }

    // ---- receive side ----

    /// Decodes every item of `schema`.
    ///
    /// Returns `Ok(None)` if the peer closed the stream at a field boundary.
    ///
    /// # Panics
    /// Panics if `schema` contains anything but `Recv` items.
    pub fn recv(&mut self, just: bool, schema: &[Item<'_>]) -> PslResult<Option<Vec<Value>>> {
        let (values, tail) = self.recv_fields(just, None, schema)?;
        if values.is_some() {
            expect_consumed("recv", schema, tail);
        }
        Ok(values)
    }

    /// Decodes the leading `Recv` items and returns the unconsumed tail.
    pub fn recv_prefix<'s, 'a>(
        &mut self,
        just: bool,
        schema: &'s [Item<'a>],
    ) -> PslResult<(Option<Vec<Value>>, &'s [Item<'a>])> {
        self.recv_fields(just, None, schema)
    }

    /// Like [`recv`](Self::recv), never consuming more than `*budget` bytes.
    ///
    /// `*budget` is decreased by the bytes consumed. A field that would
    /// overrun it is a `Protocol` error.
    pub fn recv_sized(
        &mut self,
        just: bool,
        budget: &mut usize,
        schema: &[Item<'_>],
    ) -> PslResult<Option<Vec<Value>>> {
        let (values, tail) = self.recv_fields(just, Some(budget), schema)?;
        if values.is_some() {
            expect_consumed("recv_sized", schema, tail);
        }
        Ok(values)
    }

    pub(crate) fn recv_fields<'s, 'a>(
        &mut self,
        just: bool,
        mut budget: Option<&mut usize>,
        schema: &'s [Item<'a>],
    ) -> PslResult<(Option<Vec<Value>>, &'s [Item<'a>])> {
        let mut values = Vec::with_capacity(schema.len());
        for (pos, item) in schema.iter().enumerate() {
            let field = match item {
                Item::Recv(field) => *field,
                _ => return Ok((Some(values), &schema[pos..])),
            };
            match self.recv_field(just, budget.as_deref_mut(), field)? {
                Some(value) => values.push(value),
                None => return Ok((None, &schema[pos..])),
            }
        }
        Ok((Some(values), &[]))
    }

    fn recv_field(
        &mut self,
        just: bool,
        mut budget: Option<&mut usize>,
        field: Field,
    ) -> PslResult<Option<Value>> {
        if let Some(width) = field.fixed_len() {
            charge(budget.as_deref_mut(), width)?;
            let mut raw = [0u8; 8];
            if !self.read_field(just, &mut raw[..width], field)? {
                return Ok(None);
            }
            let value = match field {
                Field::Byte => Value::Byte(raw[0]),
                Field::Int16 => Value::Int16(i16::from_be_bytes([raw[0], raw[1]])),
                Field::Int32 => Value::Int32(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
                Field::Int64 => {
                    let high = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64;
                    let low = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
                    Value::Int64(((high << 32) | low) as i64)
                }
                Field::Double => Value::Double(f64::from_bits(u64::from_be_bytes(raw))),
                Field::Str | Field::Buffer { .. } | Field::AllocBuffer => unreachable!(),
            };
            return Ok(Some(value));
        }

        charge(budget.as_deref_mut(), LENGTH_PREFIX_BYTES)?;
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        if !self.read_field(just, &mut prefix, field)? {
            return Ok(None);
        }
        let len = i32::from_be_bytes(prefix);
        let len = usize::try_from(len).map_err(|_| {
            debug!(tag = %field.tag(), len, "negative length prefix");
            PslError::Protocol
        })?;
        charge(budget, len)?;

        let keep = match field {
            Field::Buffer { capacity } => len.min(capacity),
            _ => len,
        };
        let data = self.read_body(just, len, keep, field, |data, extra| {
            data.try_reserve(extra)
        })?;

        let value = match field {
            Field::Str => Value::Str(String::from_utf8(data).map_err(|_| {
                debug!(len, "string field is not valid UTF-8");
                PslError::Protocol
            })?),
            Field::Buffer { .. } => Value::Buffer { data, len },
            _ => Value::AllocBuffer(data),
        };
        Ok(Some(value))
    }

    // Fills `out` from the stream. Ok(false) means the stream ended before
    // the first byte; ending later is a protocol error.
    fn read_field(&mut self, just: bool, out: &mut [u8], field: Field) -> PslResult<bool> {
        let got = self.read_into(just, out)?;
        if got == 0 {
            return Ok(false);
        }
        if got < out.len() {
            debug!(tag = %field.tag(), got, want = out.len(), "receive short read");
            return Err(PslError::Protocol);
        }
        Ok(true)
    }

    // Reads a `len` byte body and keeps the first `keep` bytes. The vector
    // grows one buffer-sized chunk at a time as bytes arrive. If growing
    // fails the rest of the body is still consumed before reporting
    // `NoMemory`, so the next field starts on a boundary.
    fn read_body<R>(
        &mut self,
        just: bool,
        len: usize,
        keep: usize,
        field: Field,
        mut reserve: R,
    ) -> PslResult<Vec<u8>>
    where
        R: FnMut(&mut Vec<u8>, usize) -> Result<(), TryReserveError>,
    {
        let mut data = Vec::new();
        while data.len() < keep {
            let start = data.len();
            let chunk = (keep - start).min(self.recv.capacity());
            if let Err(err) = reserve(&mut data, chunk) {
                debug!(tag = %field.tag(), len, received = start, "no memory for field body");
                drop(data);
                self.skip_body(just, len - start, field)?;
                return Err(err.into());
            }
            data.resize(start + chunk, 0);
            let got = self.read_into(just, &mut data[start..])?;
            if got < chunk {
                debug!(tag = %field.tag(), got = start + got, want = len, "receive short read");
                return Err(PslError::Protocol);
            }
        }
        if keep < len {
            self.skip_body(just, len - keep, field)?;
        }
        Ok(data)
    }

    fn skip_body(&mut self, just: bool, len: usize, field: Field) -> PslResult<()> {
        let skipped = self.discard(just, len)?;
        if skipped < len {
            debug!(tag = %field.tag(), skipped, want = len, "receive short read");
            return Err(PslError::Protocol);
        }
        Ok(())
    }

    // Copies up to out.len() bytes, stopping early only at end of stream.
    fn read_into(&mut self, just: bool, out: &mut [u8]) -> PslResult<usize> {
        let mut done = 0;
        while done < out.len() {
            let want = (out.len() - done).min(self.recv.capacity());
            let max = if just { want } else { usize::MAX };
            if self.recv.fill(&mut *self.backend, want, max) == 0 {
                self.recv.check()?;
                break;
            }
            done += self.recv.copy_to(&mut out[done..]);
        }
        Ok(done)
    }

    fn discard(&mut self, just: bool, len: usize) -> PslResult<usize> {
        let mut done = 0;
        while done < len {
            let want = (len - done).min(self.recv.capacity());
            let max = if just { want } else { usize::MAX };
            if self.recv.fill(&mut *self.backend, want, max) == 0 {
                self.recv.check()?;
                break;
            }
            done += self.recv.consume(len - done);
        }
        Ok(done)
    }

    /// Discards exactly `len` bytes from the stream.
    ///
    /// # Errors
    /// `UnexpectedEof` if the stream ends first.
    pub fn purge(&mut self, just: bool, len: usize) -> PslResult<()> {
        let skipped = self.discard(just, len)?;
        if skipped < len {
            debug!(skipped, want = len, "purge hit end of stream");
            return Err(PslError::UnexpectedEof);
        }
        Ok(())
    }

    /// Drops buffered input and everything the backend has ready.
    pub fn purge_all(&mut self) -> PslResult<()> {
        loop {
            self.recv.clear();
            if self.recv.fill_nonblocking(&mut *self.backend)? == 0 {
                self.recv.clear();
                return Ok(());
            }
        }
    }

    /// True when buffered input is waiting to be decoded.
    pub fn recv_is_ready(&self) -> bool {
        !self.recv.is_empty()
    }

    /// True when neither buffer holds bytes.
    pub fn is_empty(&self) -> bool {
        self.recv.is_empty() && self.send.is_empty()
    }

    /// Pulls whatever the backend has ready into the receive buffer without
    /// blocking; returns the number of buffered bytes.
    pub fn read_available(&mut self) -> PslResult<usize> {
        self.recv.fill_nonblocking(&mut *self.backend)
    }

    /// Reads between 1 and `out.len()` bytes; 0 only at end of stream.
    pub fn recv_partial(&mut self, just: bool, out: &mut [u8]) -> PslResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let max = if just { out.len() } else { usize::MAX };
        if self.recv.fill(&mut *self.backend, 1, max) == 0 {
            self.recv.check()?;
            return Ok(0);
        }
        Ok(self.recv.copy_to(out))
    }

    /// Reads from buffered input if any, else straight from the backend.
    pub fn read_direct(&mut self, out: &mut [u8]) -> PslResult<usize> {
        if !self.recv.is_empty() {
            return Ok(self.recv.copy_to(out));
        }
        self.recv.check()?;
        loop {
            match self.backend.blocking_read(out) {
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                result => return Ok(result?),
            }
        }
    }

    /// Flushes, then closes the backend. The flush error wins if both fail.
    pub fn close(mut self) -> PslResult<()> {
        let flushed = self.flush();
        let closed = self.backend.close();
        flushed.and(closed)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("recv", &self.recv)
            .field("send", &self.send)
            .field("descriptor", &self.backend.descriptor())
            .finish()
    }
}

fn charge(budget: Option<&mut usize>, len: usize) -> PslResult<()> {
    if let Some(budget) = budget {
        if len > *budget {
            debug!(len, remaining = *budget, "field exceeds message size");
            return Err(PslError::Protocol);
        }
        *budget -= len;
    }
    Ok(())
}

pub(crate) fn expect_consumed(op: &str, schema: &[Item<'_>], tail: &[Item<'_>]) {
    if !tail.is_empty() {
        error!(
            op,
            schema = %codec::signature(schema),
            rest = %codec::signature(tail),
            "schema has unconsumed items"
        );
        panic!(
            "{op}: unconsumed schema items \"{}\" in \"{}\"",
            codec::signature(tail),
            codec::signature(schema)
        );
    }
}
