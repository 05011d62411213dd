//! # Marshalling Codec
//!
//! Purpose: Describe RPC messages as a typed schema and encode the send side
//! of it into a buffer.
//!
//! ## Design Principles
//! 1. **Schema as Data**: a message is a slice of `Item`s, so helpers can
//!    marshal a prefix and hand the tail to a sub-encoder.
//! 2. **Stop, Don't Fail**: encoding stops at the first item that is not a
//!    `Send` and returns the unconsumed tail.
//! 3. **Network Order**: every integer is big-endian; 64-bit values travel as
//!    two 32-bit halves, high half first.
//!
//! ## Wire Types
//!
//! ```text
//! tag  item                 wire
//! c    Byte                 1
//! h    Int16                2
//! i    Int32                4
//! l    Int64                4 (high) + 4 (low)
//! s    Str                  4 (len) + len
//! S    SizedStr             4 (len) + len
//! b    Buffer               4 (len) + len, receiver keeps at most its capacity
//! B    AllocBuffer          4 (len) + len, receiver allocates len
//! r    Raw                  len, no prefix
//! f    Double               8, IEEE-754 bits
//! /    Split                request/response boundary
//! ```

use bytes::{BufMut, BytesMut};
use psl_common::{PslError, PslResult, LENGTH_PREFIX_BYTES};

/// Value sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    /// Length-prefixed string.
    Str(&'a str),
    /// Length-prefixed bytes supplied with their own length.
    SizedStr(&'a [u8]),
    /// Length-prefixed binary buffer.
    Buffer(&'a [u8]),
    /// Bytes written as-is, without a length prefix.
    Raw(&'a [u8]),
    Double(f64),
}

impl Arg<'_> {
    pub fn tag(&self) -> char {
        match self {
            Arg::Byte(_) => 'c',
            Arg::Int16(_) => 'h',
            Arg::Int32(_) => 'i',
            Arg::Int64(_) => 'l',
            Arg::Str(_) => 's',
            Arg::SizedStr(_) => 'S',
            Arg::Buffer(_) => 'b',
            Arg::Raw(_) => 'r',
            Arg::Double(_) => 'f',
        }
    }

    /// Number of bytes this argument occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Arg::Byte(_) => 1,
            Arg::Int16(_) => 2,
            Arg::Int32(_) => 4,
            Arg::Int64(_) | Arg::Double(_) => 8,
            Arg::Str(s) => LENGTH_PREFIX_BYTES + s.len(),
            Arg::SizedStr(b) | Arg::Buffer(b) => LENGTH_PREFIX_BYTES + b.len(),
            Arg::Raw(b) => b.len(),
        }
    }

    fn put(&self, out: &mut BytesMut) -> PslResult<()> {
        match *self {
            Arg::Byte(v) => out.put_u8(v),
            Arg::Int16(v) => out.put_i16(v),
            Arg::Int32(v) => out.put_i32(v),
            Arg::Int64(v) => {
                out.put_u32((v >> 32) as u32);
                out.put_u32(v as u32);
            }
            Arg::Str(s) => put_prefixed(out, s.as_bytes())?,
            Arg::SizedStr(b) | Arg::Buffer(b) => put_prefixed(out, b)?,
            Arg::Raw(b) => out.put_slice(b),
            Arg::Double(v) => out.put_u64(v.to_bits()),
        }
        Ok(())
    }
}

fn put_prefixed(out: &mut BytesMut, data: &[u8]) -> PslResult<()> {
    let len = i32::try_from(data.len()).map_err(|_| PslError::Protocol)?;
    out.put_i32(len);
    out.put_slice(data);
    Ok(())
}

/// Field expected on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Byte,
    Int16,
    Int32,
    Int64,
    /// Length-prefixed string, decoded into an owned `String`.
    Str,
    /// Length-prefixed bytes; at most `capacity` are kept, the rest skipped.
    Buffer { capacity: usize },
    /// Length-prefixed bytes, kept in full.
    AllocBuffer,
    Double,
}

impl Field {
    pub fn tag(&self) -> char {
        match self {
            Field::Byte => 'c',
            Field::Int16 => 'h',
            Field::Int32 => 'i',
            Field::Int64 => 'l',
            Field::Str => 's',
            Field::Buffer { .. } => 'b',
            Field::AllocBuffer => 'B',
            Field::Double => 'f',
        }
    }

    /// Width of fixed-size fields; `None` for length-prefixed ones.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            Field::Byte => Some(1),
            Field::Int16 => Some(2),
            Field::Int32 => Some(4),
            Field::Int64 | Field::Double => Some(8),
            Field::Str | Field::Buffer { .. } | Field::AllocBuffer => None,
        }
    }
}

/// Decoded field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Str(String),
    /// Kept bytes and the length announced by the sender.
    Buffer { data: Vec<u8>, len: usize },
    AllocBuffer(Vec<u8>),
    Double(f64),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes of a buffer or string value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Buffer { data, .. } | Value::AllocBuffer(data) => Some(data),
            _ => None,
        }
    }
}

/// One schema element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Item<'a> {
    Send(Arg<'a>),
    Recv(Field),
    /// Boundary between request and response halves of an RPC schema.
    Split,
}

impl Item<'_> {
    pub fn tag(&self) -> char {
        match self {
            Item::Send(arg) => arg.tag(),
            Item::Recv(field) => field.tag(),
            Item::Split => '/',
        }
    }
}

impl<'a> From<Arg<'a>> for Item<'a> {
    fn from(arg: Arg<'a>) -> Self {
        Item::Send(arg)
    }
}

impl From<Field> for Item<'_> {
    fn from(field: Field) -> Self {
        Item::Recv(field)
    }
}

/// Renders a schema as its tag string, e.g. `"is/i"`.
pub fn signature(schema: &[Item<'_>]) -> String {
    schema.iter().map(Item::tag).collect()
}

/// Wire size of the sendable prefix and the tail that follows it.
pub fn encoded_len<'s, 'a>(schema: &'s [Item<'a>]) -> (usize, &'s [Item<'a>]) {
    let mut total = 0;
    for (pos, item) in schema.iter().enumerate() {
        match item {
            Item::Send(arg) => total += arg.encoded_len(),
            _ => return (total, &schema[pos..]),
        }
    }
    (total, &[])
}

/// Appends the sendable prefix of `schema` to `out`, returning the tail.
///
/// On error nothing of the failing argument is written.
pub fn encode<'s, 'a>(out: &mut BytesMut, schema: &'s [Item<'a>]) -> PslResult<&'s [Item<'a>]> {
    for (pos, item) in schema.iter().enumerate() {
        match item {
            Item::Send(arg) => arg.put(out)?,
            _ => return Ok(&schema[pos..]),
        }
    }
    Ok(&[])
}
