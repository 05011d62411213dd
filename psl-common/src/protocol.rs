//! # Wire Protocol Constants
//!
//! Purpose: Define the framing shared by every RPC carried over a channel.
//!
//! ## Design Principles
//!
//! 1. **Big-Endian Everywhere**: all multi-byte integers travel in network order.
//! 2. **Flat Opcodes**: a single 32-bit opcode namespace; concrete tables belong
//!    to the metadata/storage protocol crates built on top of this one.
//! 3. **Status First**: replies always lead with a status so failures never
//!    require decoding result fields.
//!
//! ## Frame Layout Example
//!
//! ```text
//! Request:
//! +-----------+---------------------------+
//! | opcode:4B | marshalled arguments ...  |
//! +-----------+---------------------------+
//!
//! Reply (status == STATUS_OK):
//! +-----------+---------------------------+
//! | status:4B | marshalled results ...    |
//! +-----------+---------------------------+
//!
//! Reply (status != STATUS_OK):
//! +-----------+
//! | status:4B |
//! +-----------+
//!
//! Length-prefixed string / buffer:
//! +--------+-----------+
//! | len:4B | data:len B|
//! +--------+-----------+
//!
//! 64-bit integer:
//! +---------+---------+
//! | high:4B | low:4B  |
//! +---------+---------+
//! ```

/// Request opcode carried as the first int32 of every request.
pub type Opcode = i32;

/// Reply status code; zero means results follow.
pub type Status = i32;

/// Status code indicating success in RPC replies.
pub const STATUS_OK: Status = 0;

/// Default capacity of each channel buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Width of the length prefix in front of strings and buffers.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound for the shared connection cache capacity.
pub const CONNECTION_CACHE_LIMIT: usize = 0x7fff;
